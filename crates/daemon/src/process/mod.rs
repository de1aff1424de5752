//! Process manager collaborator.
//!
//! The relay never owns processes. It asks a [`ProcessManager`] for a
//! [`ProcessHandle`] that exposes the live output stream, the input sink and,
//! when the process runs in a PTY, a resize hook.
//!
//! Two implementations ship with the daemon:
//! - [`PtyProcessManager`] spawns configured components in pseudo-terminals.
//! - [`ChannelProcessManager`] lets an embedding program feed output and
//!   consume input for processes it manages itself.

mod channel;
mod feed;
mod pty;

pub use channel::{ChannelProcess, ChannelProcessManager};
pub use feed::{OutputFeed, DEFAULT_BACKLOG_CAPACITY};
pub use pty::{CommandSpec, PtyProcessManager};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use protocol::{SessionKey, TerminalSize};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session::SessionError;

/// Boxed future returned by the object-safe collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Decoded process output, one chunk per read. Ends when the process exits.
pub type OutputStream = mpsc::UnboundedReceiver<String>;

/// Lifecycle status of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessStatus {
    NotStarted,
    Running { pid: Option<u32> },
    Exited { code: Option<i32> },
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessStatus::Running { pid } => *pid,
            _ => None,
        }
    }
}

/// Input sink of a running process.
pub trait ProcessInput: Send + Sync {
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<(), SessionError>>;
}

/// Resize hook of a process attached to a PTY.
pub trait PtyResize: Send + Sync {
    fn resize(&self, size: TerminalSize) -> BoxFuture<'_, Result<(), SessionError>>;
}

/// Everything a session host needs to bind to a process.
///
/// `backlog` and `output` are captured atomically: the first chunk received
/// on `output` directly follows the last backlog entry.
pub struct ProcessHandle {
    pub running: bool,
    pub pid: Option<u32>,
    pub backlog: Vec<String>,
    pub output: Option<OutputStream>,
    pub input: Option<Arc<dyn ProcessInput>>,
    pub resize: Option<Arc<dyn PtyResize>>,
}

impl ProcessHandle {
    pub fn not_running(pid: Option<u32>) -> Self {
        Self {
            running: false,
            pid,
            backlog: Vec::new(),
            output: None,
            input: None,
            resize: None,
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("running", &self.running)
            .field("pid", &self.pid)
            .field("backlog", &self.backlog.len())
            .field("has_input", &self.input.is_some())
            .field("has_resize", &self.resize.is_some())
            .finish()
    }
}

/// Source of process handles for the relay.
pub trait ProcessManager: Send + Sync {
    /// Every key this manager can serve.
    fn targets(&self) -> Vec<SessionKey>;

    /// Current status. `NoSuchTarget` for unknown keys.
    fn status(&self, key: &SessionKey) -> Result<ProcessStatus, SessionError>;

    /// Subscribe to the process for `key`.
    ///
    /// Returns a handle with `running == false` when the target is known but
    /// idle; `NoSuchTarget` when the key is unknown.
    fn get_process_handle(&self, key: &SessionKey) -> Result<ProcessHandle, SessionError>;

    /// Start the process if it is not running. Returns its pid.
    fn start<'a>(&'a self, key: &'a SessionKey) -> BoxFuture<'a, Result<Option<u32>, SessionError>>;

    /// Stop the process. `force` skips the interrupt-and-wait phase.
    fn stop<'a>(
        &'a self,
        key: &'a SessionKey,
        force: bool,
    ) -> BoxFuture<'a, Result<ProcessStatus, SessionError>>;

    /// Whether `key` names a known target.
    fn knows(&self, key: &SessionKey) -> bool {
        self.status(key).is_ok()
    }
}
