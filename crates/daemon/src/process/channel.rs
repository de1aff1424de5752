//! In-memory process manager for programs that run their own processes.
//!
//! The owner registers targets, then launches a run to obtain a
//! [`ChannelProcess`] through which it pushes output and receives the input
//! and resize requests coming from viewers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use protocol::{SessionKey, TerminalSize};
use tokio::sync::mpsc;

use super::feed::{OutputFeed, DEFAULT_BACKLOG_CAPACITY};
use super::{BoxFuture, ProcessHandle, ProcessInput, ProcessManager, ProcessStatus, PtyResize};
use crate::session::SessionError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Run {
    pid: Option<u32>,
    feed: Arc<Mutex<OutputFeed>>,
    status: Arc<Mutex<ProcessStatus>>,
    input: Arc<ChannelInput>,
    resize: Option<Arc<ChannelResize>>,
}

#[derive(Default)]
struct Target {
    run: Option<Run>,
}

struct ChannelInput {
    tx: mpsc::UnboundedSender<String>,
}

impl ProcessInput for ChannelInput {
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            self.tx
                .send(String::from_utf8_lossy(data).into_owned())
                .map_err(|_| SessionError::WriteFailed("input receiver dropped".to_string()))
        })
    }
}

struct ChannelResize {
    tx: mpsc::UnboundedSender<TerminalSize>,
}

impl PtyResize for ChannelResize {
    fn resize(&self, size: TerminalSize) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            self.tx
                .send(size)
                .map_err(|_| SessionError::ResizeFailed("resize receiver dropped".to_string()))
        })
    }
}

/// Owner side of one launched process run.
pub struct ChannelProcess {
    key: SessionKey,
    pid: Option<u32>,
    feed: Arc<Mutex<OutputFeed>>,
    status: Arc<Mutex<ProcessStatus>>,
    input_rx: mpsc::UnboundedReceiver<String>,
    resize_rx: Option<mpsc::UnboundedReceiver<TerminalSize>>,
}

impl ChannelProcess {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Publish an output chunk to every subscribed session host.
    pub fn emit(&self, chunk: impl Into<String>) {
        lock(&self.feed).publish(chunk.into());
    }

    /// Mark the run as exited and end its output stream.
    pub fn exit(&self, code: Option<i32>) {
        *lock(&self.status) = ProcessStatus::Exited { code };
        lock(&self.feed).close();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.status).is_running()
    }

    /// Next chunk of viewer input.
    pub async fn next_input(&mut self) -> Option<String> {
        self.input_rx.recv().await
    }

    pub fn try_next_input(&mut self) -> Option<String> {
        self.input_rx.try_recv().ok()
    }

    /// Next resize request. Always `None` for runs without a PTY.
    pub async fn next_resize(&mut self) -> Option<TerminalSize> {
        match self.resize_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn try_next_resize(&mut self) -> Option<TerminalSize> {
        self.resize_rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }
}

/// Process manager backed by in-memory channels.
pub struct ChannelProcessManager {
    targets: DashMap<SessionKey, Target>,
    backlog_capacity: usize,
}

impl Default for ChannelProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelProcessManager {
    pub fn new() -> Self {
        Self::with_backlog_capacity(DEFAULT_BACKLOG_CAPACITY)
    }

    pub fn with_backlog_capacity(backlog_capacity: usize) -> Self {
        Self {
            targets: DashMap::new(),
            backlog_capacity,
        }
    }

    /// Make `key` known. Its process starts out not running.
    pub fn register(&self, key: SessionKey) {
        self.targets.entry(key).or_default();
    }

    pub fn unregister(&self, key: &SessionKey) {
        if let Some((_, target)) = self.targets.remove(key) {
            if let Some(run) = target.run {
                *lock(&run.status) = ProcessStatus::Exited { code: None };
                lock(&run.feed).close();
            }
        }
    }

    /// Start a run attached to a PTY (viewer resizes are forwarded).
    pub fn launch(&self, key: &SessionKey, pid: Option<u32>) -> Result<ChannelProcess, SessionError> {
        self.launch_inner(key, pid, true)
    }

    /// Start a run with plain pipes; resize requests are not forwarded.
    pub fn launch_piped(
        &self,
        key: &SessionKey,
        pid: Option<u32>,
    ) -> Result<ChannelProcess, SessionError> {
        self.launch_inner(key, pid, false)
    }

    fn launch_inner(
        &self,
        key: &SessionKey,
        pid: Option<u32>,
        pty: bool,
    ) -> Result<ChannelProcess, SessionError> {
        let mut target = self
            .targets
            .get_mut(key)
            .ok_or_else(|| SessionError::NoSuchTarget(key.clone()))?;

        if let Some(previous) = target.run.take() {
            *lock(&previous.status) = ProcessStatus::Exited { code: None };
            lock(&previous.feed).close();
        }

        let feed = Arc::new(Mutex::new(OutputFeed::new(self.backlog_capacity)));
        let status = Arc::new(Mutex::new(ProcessStatus::Running { pid }));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (resize, resize_rx) = if pty {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(Arc::new(ChannelResize { tx })), Some(rx))
        } else {
            (None, None)
        };

        target.run = Some(Run {
            pid,
            feed: Arc::clone(&feed),
            status: Arc::clone(&status),
            input: Arc::new(ChannelInput { tx: input_tx }),
            resize,
        });

        tracing::debug!(session_id = %key.session_id(), ?pid, "Launched channel process");

        Ok(ChannelProcess {
            key: key.clone(),
            pid,
            feed,
            status,
            input_rx,
            resize_rx,
        })
    }
}

impl ProcessManager for ChannelProcessManager {
    fn targets(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.targets.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn status(&self, key: &SessionKey) -> Result<ProcessStatus, SessionError> {
        let target = self
            .targets
            .get(key)
            .ok_or_else(|| SessionError::NoSuchTarget(key.clone()))?;
        Ok(match &target.run {
            Some(run) => *lock(&run.status),
            None => ProcessStatus::NotStarted,
        })
    }

    fn get_process_handle(&self, key: &SessionKey) -> Result<ProcessHandle, SessionError> {
        let target = self
            .targets
            .get(key)
            .ok_or_else(|| SessionError::NoSuchTarget(key.clone()))?;
        let Some(run) = &target.run else {
            return Ok(ProcessHandle::not_running(None));
        };
        if !lock(&run.status).is_running() {
            return Ok(ProcessHandle::not_running(run.pid));
        }

        let (backlog, output) = lock(&run.feed).subscribe();
        Ok(ProcessHandle {
            running: true,
            pid: run.pid,
            backlog,
            output: Some(output),
            input: Some(run.input.clone() as Arc<dyn ProcessInput>),
            resize: run.resize.clone().map(|r| r as Arc<dyn PtyResize>),
        })
    }

    fn start<'a>(&'a self, key: &'a SessionKey) -> BoxFuture<'a, Result<Option<u32>, SessionError>> {
        Box::pin(async move {
            match self.status(key)? {
                ProcessStatus::Running { pid } => Ok(pid),
                _ => Err(SessionError::Unsupported(format!(
                    "{key} is launched by its owner"
                ))),
            }
        })
    }

    fn stop<'a>(
        &'a self,
        key: &'a SessionKey,
        _force: bool,
    ) -> BoxFuture<'a, Result<ProcessStatus, SessionError>> {
        Box::pin(async move {
            let target = self
                .targets
                .get(key)
                .ok_or_else(|| SessionError::NoSuchTarget(key.clone()))?;
            match &target.run {
                Some(run) => {
                    let mut status = lock(&run.status);
                    if status.is_running() {
                        *status = ProcessStatus::Exited { code: None };
                        lock(&run.feed).close();
                    }
                    Ok(*status)
                }
                None => Ok(ProcessStatus::NotStarted),
            }
        })
    }
}
