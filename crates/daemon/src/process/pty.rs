//! PTY-backed process manager.
//!
//! Each configured component is spawned inside a pseudo-terminal. A blocking
//! reader drains the PTY master, decodes UTF-8 incrementally and publishes the
//! text to an [`OutputFeed`]; when the PTY reaches EOF the child is reaped and
//! the feed is closed, which ends every session host's output stream.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::{SessionKey, TerminalSize, Utf8Decoder};

use super::feed::{OutputFeed, DEFAULT_BACKLOG_CAPACITY};
use super::{BoxFuture, ProcessHandle, ProcessInput, ProcessManager, ProcessStatus, PtyResize};
use crate::session::SessionError;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Poll interval while waiting for a stopping process.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Ctrl-C, sent to ask a process to exit before it is killed.
const INTERRUPT: &[u8] = b"\x03";

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What to run for one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn to_command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// One run of a component inside a PTY.
struct PtyProcess {
    key: SessionKey,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    feed: Arc<Mutex<OutputFeed>>,
    running: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl PtyProcess {
    fn spawn(
        key: &SessionKey,
        spec: &CommandSpec,
        size: TerminalSize,
        backlog_capacity: usize,
    ) -> Result<Arc<Self>, SessionError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(spec.to_command())
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let process = Arc::new(Self {
            key: key.clone(),
            pid,
            master: Mutex::new(pair.master),
            writer: Arc::new(Mutex::new(writer)),
            killer: Mutex::new(killer),
            feed: Arc::new(Mutex::new(OutputFeed::new(backlog_capacity))),
            running: Arc::new(AtomicBool::new(true)),
            exit_code: Arc::new(Mutex::new(None)),
        });
        process.start_read_loop(reader, child);

        tracing::info!(
            session_id = %key.session_id(),
            pid = ?pid,
            program = %spec.program,
            "Spawned process"
        );
        Ok(process)
    }

    /// Drains the PTY on a blocking thread until EOF, then reaps the child.
    fn start_read_loop(&self, mut reader: Box<dyn Read + Send>, mut child: Box<dyn Child + Send + Sync>) {
        let feed = Arc::clone(&self.feed);
        let running = Arc::clone(&self.running);
        let exit_code = Arc::clone(&self.exit_code);
        let session_id = self.key.session_id();

        tokio::task::spawn_blocking(move || {
            let mut decoder = Utf8Decoder::new();
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::info!(session_id = %session_id, "PTY EOF - process exited");
                        break;
                    }
                    Ok(n) => {
                        let text = decoder.decode(&buffer[..n]);
                        lock(&feed).publish(text);
                    }
                    Err(e) => {
                        // Linux reports EIO on the master once the child is gone.
                        tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                        break;
                    }
                }
            }

            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to reap child");
                    None
                }
            };
            *lock(&exit_code) = code;
            running.store(false, Ordering::SeqCst);

            let mut feed = lock(&feed);
            feed.publish(decoder.finish());
            feed.close();
            tracing::info!(session_id = %session_id, exit_code = ?code, "Process exited");
        });
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn status(&self) -> ProcessStatus {
        if self.is_running() {
            ProcessStatus::Running { pid: self.pid }
        } else {
            ProcessStatus::Exited {
                code: *lock(&self.exit_code),
            }
        }
    }

    fn kill(&self) -> Result<(), SessionError> {
        lock(&self.killer)
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))
    }

    async fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.is_running() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        true
    }
}

impl ProcessInput for PtyProcess {
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            if !self.is_running() {
                return Err(SessionError::AlreadyTerminated(self.key.clone()));
            }
            let writer = Arc::clone(&self.writer);
            let data = data.to_vec();
            tokio::task::spawn_blocking(move || {
                let mut writer = lock(&writer);
                writer.write_all(&data)?;
                writer.flush()
            })
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
        })
    }
}

impl PtyResize for PtyProcess {
    fn resize(&self, size: TerminalSize) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            if !self.is_running() {
                return Err(SessionError::AlreadyTerminated(self.key.clone()));
            }
            lock(&self.master)
                .resize(PtySize {
                    rows: size.rows,
                    cols: size.cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
            tracing::debug!(
                session_id = %self.key.session_id(),
                cols = size.cols,
                rows = size.rows,
                "Resized PTY"
            );
            Ok(())
        })
    }
}

/// Spawns and supervises configured components in PTYs.
pub struct PtyProcessManager {
    specs: HashMap<SessionKey, CommandSpec>,
    processes: DashMap<SessionKey, Arc<PtyProcess>>,
    size: TerminalSize,
    backlog_capacity: usize,
    stop_timeout: Duration,
}

impl PtyProcessManager {
    pub fn new(specs: impl IntoIterator<Item = (SessionKey, CommandSpec)>) -> Self {
        Self {
            specs: specs.into_iter().collect(),
            processes: DashMap::new(),
            size: TerminalSize::default(),
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            stop_timeout: Duration::from_secs(5),
        }
    }

    /// Initial PTY size for new processes.
    pub fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    pub fn with_backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity = capacity;
        self
    }

    /// How long a non-forced stop waits before killing.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn spec(&self, key: &SessionKey) -> Result<&CommandSpec, SessionError> {
        self.specs
            .get(key)
            .ok_or_else(|| SessionError::NoSuchTarget(key.clone()))
    }

    /// Spawn the component unless it is already running. Returns its pid.
    pub fn spawn(&self, key: &SessionKey) -> Result<Option<u32>, SessionError> {
        let spec = self.spec(key)?;
        match self.processes.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().is_running() {
                    return Ok(entry.get().pid);
                }
                let process = PtyProcess::spawn(key, spec, self.size, self.backlog_capacity)?;
                let pid = process.pid;
                entry.insert(process);
                Ok(pid)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let process = PtyProcess::spawn(key, spec, self.size, self.backlog_capacity)?;
                let pid = process.pid;
                entry.insert(process);
                Ok(pid)
            }
        }
    }

    /// Kill every running process. Used on daemon shutdown.
    pub fn kill_all(&self) {
        for entry in self.processes.iter() {
            if entry.is_running() {
                if let Err(e) = entry.kill() {
                    tracing::warn!(session_id = %entry.key().session_id(), error = %e, "Failed to kill process");
                }
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.processes.iter().filter(|p| p.is_running()).count()
    }
}

impl ProcessManager for PtyProcessManager {
    fn targets(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.specs.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn status(&self, key: &SessionKey) -> Result<ProcessStatus, SessionError> {
        self.spec(key)?;
        Ok(self
            .processes
            .get(key)
            .map(|p| p.status())
            .unwrap_or(ProcessStatus::NotStarted))
    }

    fn get_process_handle(&self, key: &SessionKey) -> Result<ProcessHandle, SessionError> {
        self.spec(key)?;
        let Some(process) = self.processes.get(key).map(|p| Arc::clone(p.value())) else {
            return Ok(ProcessHandle::not_running(None));
        };
        if !process.is_running() {
            return Ok(ProcessHandle::not_running(process.pid));
        }

        let (backlog, output) = lock(&process.feed).subscribe();
        Ok(ProcessHandle {
            running: true,
            pid: process.pid,
            backlog,
            output: Some(output),
            input: Some(process.clone() as Arc<dyn ProcessInput>),
            resize: Some(process as Arc<dyn PtyResize>),
        })
    }

    fn start<'a>(&'a self, key: &'a SessionKey) -> BoxFuture<'a, Result<Option<u32>, SessionError>> {
        Box::pin(async move { self.spawn(key) })
    }

    fn stop<'a>(
        &'a self,
        key: &'a SessionKey,
        force: bool,
    ) -> BoxFuture<'a, Result<ProcessStatus, SessionError>> {
        Box::pin(async move {
            self.spec(key)?;
            let Some(process) = self.processes.get(key).map(|p| Arc::clone(p.value())) else {
                return Ok(ProcessStatus::NotStarted);
            };
            if !process.is_running() {
                return Ok(process.status());
            }

            if !force {
                if let Err(e) = process.write(INTERRUPT).await {
                    tracing::debug!(session_id = %key.session_id(), error = %e, "Interrupt failed");
                }
                if process.wait_exit(self.stop_timeout).await {
                    return Ok(process.status());
                }
                tracing::warn!(
                    session_id = %key.session_id(),
                    "Process ignored interrupt, killing"
                );
            }

            process.kill()?;
            process.wait_exit(self.stop_timeout).await;
            tracing::info!(session_id = %key.session_id(), "Process stopped");
            Ok(process.status())
        })
    }
}
