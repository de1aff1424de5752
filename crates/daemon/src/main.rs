//! TermRelay Daemon
//!
//! Runs managed components in pseudo-terminals and relays their terminals to
//! WebSocket viewers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{get_socket_path, is_daemon_running, IpcClient, IpcResponse, IpcServer, IpcSessionInfo};
use daemon::orchestrator::{DaemonEvent, RelayDaemon};
use daemon::process::ProcessStatus;
use protocol::{Component, SessionKey};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// TermRelay Daemon - terminal relay for managed processes.
#[derive(Parser, Debug)]
#[command(name = "termrelay-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the relay daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Seconds to wait for the daemon to exit
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Inspect relay sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Control managed components
    #[command(subcommand)]
    Process(ProcessCommands),
}

/// Subcommands for session inspection.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

/// Subcommands for component control.
#[derive(Subcommand, Debug, Clone)]
pub enum ProcessCommands {
    /// Start a component
    Start {
        target: String,
        component: Component,
    },

    /// Stop a component
    Stop {
        target: String,
        component: Component,

        /// Kill immediately instead of interrupting first
        #[arg(long, short)]
        force: bool,
    },

    /// Show a component's status
    Status {
        target: String,
        component: Component,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    if cli.verbose {
        config.daemon.log_level = "debug".to_string();
    }

    match cli.command {
        Commands::Start => {
            config.validate()?;
            let _log_guard = init_daemon_logging(&config)?;

            if is_daemon_running().await {
                eprintln!("Error: Daemon already running");
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  termrelay-daemon stop");
                std::process::exit(1);
            }

            run_daemon(config).await?;
        }
        Commands::Stop { timeout } => {
            init_cli_logging(&config);
            match graceful_stop_daemon(timeout).await {
                Ok(()) => println!("Daemon stopped successfully"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => {
            init_cli_logging(&config);
            match connect().await?.status().await? {
                IpcResponse::Status {
                    running,
                    uptime_secs,
                    bind,
                    session_count,
                    viewer_count,
                    connection_count,
                    target_count,
                } => {
                    println!(
                        "Daemon Status: {}",
                        if running { "running" } else { "starting" }
                    );
                    println!("  Listening:   {}", bind);
                    println!("  Uptime:      {}", format_duration(uptime_secs));
                    println!("  Components:  {}", target_count);
                    println!("  Sessions:    {}", session_count);
                    println!("  Viewers:     {}", viewer_count);
                    println!("  Connections: {}", connection_count);
                }
                other => fail_with(other),
            }
        }
        Commands::Sessions(SessionsCommands::List { json }) => {
            init_cli_logging(&config);
            match connect().await?.list_sessions().await? {
                IpcResponse::Sessions { sessions } => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                other => fail_with(other),
            }
        }
        Commands::Process(cmd) => {
            init_cli_logging(&config);
            let mut client = connect().await?;
            let response = match cmd {
                ProcessCommands::Start { target, component } => {
                    client.start_process(SessionKey::new(target, component)).await?
                }
                ProcessCommands::Stop {
                    target,
                    component,
                    force,
                } => {
                    client.set_timeout(Duration::from_secs(config.pty.stop_timeout_secs + 5));
                    client
                        .stop_process(SessionKey::new(target, component), force)
                        .await?
                }
                ProcessCommands::Status { target, component } => {
                    client.process_status(SessionKey::new(target, component)).await?
                }
            };
            match response {
                IpcResponse::ProcessStarted { key, pid } => match pid {
                    Some(pid) => println!("{} started (pid {})", key, pid),
                    None => println!("{} started", key),
                },
                IpcResponse::ProcessStopped { key, status } | IpcResponse::ProcessStatus { key, status } => {
                    println!("{}: {}", key, describe_status(&status));
                }
                other => fail_with(other),
            }
        }
    }

    Ok(())
}

/// Log to stderr and to a daily rolling file under the data directory.
fn init_daemon_logging(
    config: &Config,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "termrelay-daemon.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(log_filter(config))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    tracing::info!("Logging to {}", log_dir.display());
    Ok(guard)
}

fn init_cli_logging(config: &Config) {
    let level = if config.daemon.log_level.eq_ignore_ascii_case("debug")
        || config.daemon.log_level.eq_ignore_ascii_case("trace")
    {
        config.daemon.log_level.as_str()
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();
}

/// `RUST_LOG` wins over the configured level.
fn log_filter(config: &Config) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.daemon.log_level.to_lowercase()))
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let daemon = Arc::new(RelayDaemon::new(config)?);

    let mut events = daemon.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DaemonEvent::StateChanged(state) => {
                    tracing::info!("Daemon state: {:?}", state);
                }
                DaemonEvent::ProcessStarted { key, pid } => {
                    tracing::debug!("Component {} started with pid {:?}", key, pid);
                }
                DaemonEvent::ProcessFailed { key, message } => {
                    tracing::error!("Component {} failed to start: {}", key, message);
                }
            }
        }
    });

    daemon.start().await?;

    let ipc = IpcServer::bind(&get_socket_path())
        .await
        .context("Failed to bind IPC socket")?;
    let ipc_task = tokio::spawn(ipc.serve(Arc::clone(&daemon), daemon.shutdown_token()));

    let shutdown = daemon.shutdown_token();
    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown requested");
        }
    }

    daemon.stop().await?;
    let _ = ipc_task.await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        _ => {
            tracing::error!("Failed to register signal handlers");
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

async fn connect() -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&get_socket_path(), Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

fn fail_with(response: IpcResponse) -> ! {
    match response {
        IpcResponse::Error { message } => eprintln!("Error: {}", message),
        other => eprintln!("Unexpected response from daemon: {:?}", other),
    }
    std::process::exit(1);
}

async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect().await?;

    println!("Sending shutdown request...");
    match client.stop().await? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

fn describe_status(status: &ProcessStatus) -> String {
    match status {
        ProcessStatus::NotStarted => "not started".to_string(),
        ProcessStatus::Running { pid: Some(pid) } => format!("running (pid {})", pid),
        ProcessStatus::Running { pid: None } => "running".to_string(),
        ProcessStatus::Exited { code: Some(code) } => format!("exited with code {}", code),
        ProcessStatus::Exited { code: None } => "exited".to_string(),
    }
}

fn print_sessions_table(sessions: &[IpcSessionInfo]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.session_id.len())
        .max()
        .unwrap_or(10)
        .max(10);

    println!(
        "{:<id_width$}  {:>8}  {:<10}  {:>7}  {:>8}  {:>10}",
        "SESSION", "PID", "STATE", "VIEWERS", "BUFFERED", "AGE",
    );
    println!("{}", "-".repeat(id_width + 53));

    for session in sessions {
        let pid = session
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = if session.terminated { "exited" } else { "live" };
        println!(
            "{:<id_width$}  {:>8}  {:<10}  {:>7}  {:>8}  {:>10}",
            session.session_id,
            pid,
            state,
            session.viewer_count,
            session.buffered_chunks,
            format_duration(session.age_secs),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["termrelay-daemon", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
        assert!(!cli.verbose);
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "termrelay-daemon",
            "status",
            "--config",
            "/etc/termrelay.toml",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/termrelay.toml")));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_stop_default_timeout() {
        let cli = Cli::try_parse_from(["termrelay-daemon", "stop"]).unwrap();
        match cli.command {
            Commands::Stop { timeout } => assert_eq!(timeout, 30),
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_stop_with_timeout() {
        let cli = Cli::try_parse_from(["termrelay-daemon", "stop", "--timeout", "60"]).unwrap();
        match cli.command {
            Commands::Stop { timeout } => assert_eq!(timeout, 60),
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_sessions_list_json() {
        let cli = Cli::try_parse_from(["termrelay-daemon", "sessions", "list", "--json"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json }) => assert!(json),
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_process_stop_force() {
        let cli = Cli::try_parse_from([
            "termrelay-daemon",
            "process",
            "stop",
            "bot-1",
            "napcat-ada",
            "--force",
        ])
        .unwrap();
        match cli.command {
            Commands::Process(ProcessCommands::Stop {
                target,
                component,
                force,
            }) => {
                assert_eq!(target, "bot-1");
                assert_eq!(component, Component::NapcatAdapter);
                assert!(force);
            }
            _ => panic!("Expected Process Stop command"),
        }
    }

    #[test]
    fn test_process_status_accepts_display_name() {
        let cli =
            Cli::try_parse_from(["termrelay-daemon", "process", "status", "bot-1", "NapCat"])
                .unwrap();
        match cli.command {
            Commands::Process(ProcessCommands::Status { component, .. }) => {
                assert_eq!(component, Component::Napcat);
            }
            _ => panic!("Expected Process Status command"),
        }
    }

    #[test]
    fn test_process_rejects_unknown_component() {
        let result =
            Cli::try_parse_from(["termrelay-daemon", "process", "start", "bot-1", "worker"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_no_subcommand_fails() {
        assert!(Cli::try_parse_from(["termrelay-daemon"]).is_err());
    }

    #[test]
    fn test_describe_status() {
        assert_eq!(describe_status(&ProcessStatus::NotStarted), "not started");
        assert_eq!(
            describe_status(&ProcessStatus::Running { pid: Some(12) }),
            "running (pid 12)"
        );
        assert_eq!(
            describe_status(&ProcessStatus::Exited { code: Some(1) }),
            "exited with code 1"
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(61), "1m 1s");
        assert_eq!(format_duration(3661), "1h 1m 1s");
    }
}
