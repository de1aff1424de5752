use protocol::SessionKey;
use thiserror::Error;

/// Errors that can occur while resolving, attaching to, or driving a session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The process manager does not know this target/component pair.
    #[error("no such target: {0}")]
    NoSuchTarget(SessionKey),

    /// The target exists but its process is not live.
    #[error("process not running: {0}")]
    ProcessNotRunning(SessionKey),

    /// The process behind the session has already exited.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionKey),

    /// Failed to spawn the process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Failed to write to the process input.
    #[error("failed to write to process: {0}")]
    WriteFailed(String),

    /// Failed to read process output.
    #[error("failed to read from process: {0}")]
    ReadFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to stop the process.
    #[error("failed to stop process: {0}")]
    KillFailed(String),

    /// The operation is not supported by this process manager.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether a viewer should still be given a session after this error.
    ///
    /// A stopped component is reported to the viewer instead of refusing it.
    pub fn is_informational(&self) -> bool {
        matches!(self, SessionError::ProcessNotRunning(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Component;

    #[test]
    fn test_error_display() {
        let key = SessionKey::new("bot-1", Component::Main);
        assert_eq!(
            SessionError::NoSuchTarget(key.clone()).to_string(),
            "no such target: bot-1/main"
        );
        assert_eq!(
            SessionError::ProcessNotRunning(key).to_string(),
            "process not running: bot-1/main"
        );
    }

    #[test]
    fn test_informational_classification() {
        let key = SessionKey::new("bot-1", Component::Main);
        assert!(SessionError::ProcessNotRunning(key.clone()).is_informational());
        assert!(!SessionError::NoSuchTarget(key).is_informational());
        assert!(!SessionError::WriteFailed("pipe".into()).is_informational());
    }
}
