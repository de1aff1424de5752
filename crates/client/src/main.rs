//! TermRelay Attach
//!
//! Attaches the local terminal to a relay session. `Ctrl-]` detaches.

use std::io::Read;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use client::{
    ManagerConfig, SessionState, TerminalSessionManager, TerminalSurface, WsConnector,
    WriterSurface,
};
use protocol::{Component, SessionKey, Utf8Decoder, DEFAULT_HISTORY_DEPTH};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Byte sent by `Ctrl-]`.
const DETACH_BYTE: u8 = 0x1d;

/// TermRelay Attach - open a managed component's terminal.
#[derive(Parser, Debug)]
#[command(name = "termrelay-attach")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Relay address
    #[arg(long, default_value = "ws://127.0.0.1:23456")]
    pub url: Url,

    /// Target id
    pub target: String,

    /// Component (main, napcat, napcat-ada)
    pub component: Component,

    /// History lines to replay on attach
    #[arg(long, default_value_t = DEFAULT_HISTORY_DEPTH)]
    pub lines: usize,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;

    let key = SessionKey::new(cli.target.clone(), cli.component);
    let connector = WsConnector::new(cli.url.clone());
    let config = ManagerConfig::default().history_depth(cli.lines);
    let mut manager = TerminalSessionManager::with_config(connector, WriterSurface::stdout(), config);

    let state = {
        let _raw = RawMode::enable()?;
        run(&mut manager, key.clone()).await?
    };

    match state {
        SessionState::Error => anyhow::bail!("terminal session for {key} ended with an error"),
        _ => Ok(()),
    }
}

/// Drive the session until it ends or the user detaches.
async fn run(
    manager: &mut TerminalSessionManager<WriterSurface<std::io::Stdout>, WsConnector>,
    key: SessionKey,
) -> anyhow::Result<SessionState> {
    let mut winch =
        signal(SignalKind::window_change()).context("Failed to watch terminal resizes")?;
    let mut stdin = spawn_stdin_reader();
    let mut decoder = Utf8Decoder::new();

    manager.open(key.clone());

    loop {
        let deadline = manager.next_deadline();
        let wake = tokio::time::Instant::from_std(deadline.unwrap_or_else(Instant::now));

        tokio::select! {
            event = manager.next_event() => {
                let Some(event) = event else { break };
                manager.apply(event);
                if manager.state().is_terminal() {
                    break;
                }
            }

            input = stdin.recv() => {
                let Some(bytes) = input else { break };
                let (text, detach) = split_keystrokes(&mut decoder, &bytes);
                if !text.is_empty() {
                    if let Err(e) = manager.send_input(&text) {
                        tracing::debug!(error = %e, "input dropped");
                    }
                }
                if detach {
                    manager.surface_mut().write_line("");
                    manager
                        .surface_mut()
                        .write_line(&format!("\x1b[90mDetached from {key}\x1b[0m"));
                    break;
                }
            }

            _ = winch.recv() => {
                manager.refresh_geometry(Instant::now());
            }

            _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                manager.tick(Instant::now());
            }
        }
    }

    let state = manager.state();
    manager.close();
    Ok(state)
}

/// Stdin is read on a plain thread so a pending read never holds up runtime
/// shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Decode a stdin read up to the detach key. Returns the text to forward
/// and whether the user asked to detach.
fn split_keystrokes(decoder: &mut Utf8Decoder, bytes: &[u8]) -> (String, bool) {
    match bytes.iter().position(|b| *b == DETACH_BYTE) {
        Some(pos) => {
            let mut text = decoder.decode(&bytes[..pos]);
            text.push_str(&decoder.finish());
            (text, true)
        }
        None => (decoder.decode(bytes), false),
    }
}

/// Raw mode for the lifetime of the guard.
struct RawMode;

impl RawMode {
    fn enable() -> anyhow::Result<Self> {
        crossterm::terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            eprintln!("Failed to restore terminal: {e}");
        }
    }
}

/// Logs go to stderr at `warn` unless `--log-file` is given.
fn init_logging(
    cli: &Cli,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .context("--log-file must name a file")?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(&dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}
