//! Client session states and the notices emitted on transitions.

use std::fmt;

use protocol::SessionKey;
use serde::{Deserialize, Serialize};

/// Lifecycle of one client-side session.
///
/// ```text
/// Idle ──open()──► Connecting ──connected frame──► Connected
///                      │                              │
///                      └──────────┬───────────────────┘
///                                 ▼
///                         Error  |  Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Nothing opened yet.
    Idle,
    /// Connection requested, waiting for the `connected` frame.
    Connecting,
    /// Host accepted the viewer.
    Connected,
    /// Transport failed without a local close.
    Error,
    /// Closed locally or cleanly by the host.
    Closed,
}

impl SessionState {
    /// `Error` and `Closed` only move on through a fresh `open`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Error | SessionState::Closed)
    }

    /// Whether a connection is open or being opened.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Identity tag of one connection attempt. Strictly increasing per manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Notices for the embedding UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum LifecycleNotice {
    /// State changed for the given generation.
    StateChanged {
        generation: Generation,
        state: SessionState,
    },
    /// A connection to `key` is being opened.
    Connecting {
        generation: Generation,
        key: SessionKey,
    },
    /// The host accepted the viewer.
    Connected {
        generation: Generation,
        message: String,
        pid: Option<u32>,
    },
    /// History replay is being rendered.
    ReplayingHistory { generation: Generation, lines: usize },
    /// Error notice; `fatal` when the session cannot continue.
    Error {
        generation: Generation,
        message: String,
        fatal: bool,
    },
    /// The session closed.
    Closed {
        generation: Generation,
        reason: String,
    },
}

impl LifecycleNotice {
    pub fn generation(&self) -> Generation {
        match self {
            LifecycleNotice::StateChanged { generation, .. }
            | LifecycleNotice::Connecting { generation, .. }
            | LifecycleNotice::Connected { generation, .. }
            | LifecycleNotice::ReplayingHistory { generation, .. }
            | LifecycleNotice::Error { generation, .. }
            | LifecycleNotice::Closed { generation, .. } => *generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Component;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Error.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Connecting.is_terminal());
        assert!(!SessionState::Connected.is_terminal());
    }

    #[test]
    fn test_live_states() {
        assert!(SessionState::Connecting.is_live());
        assert!(SessionState::Connected.is_live());
        assert!(!SessionState::Closed.is_live());
    }

    #[test]
    fn test_generation_next() {
        let g = Generation(0);
        assert_eq!(g.next(), Generation(1));
        assert!(g.next() > g);
    }

    #[test]
    fn test_notice_serializes_with_payload() {
        let notice = LifecycleNotice::Connecting {
            generation: Generation(3),
            key: SessionKey::new("bot-1", Component::Napcat),
        };
        let value = serde_json::to_value(&notice).unwrap();
        assert_eq!(value["type"], "Connecting");
        assert_eq!(value["payload"]["generation"], 3);
        assert_eq!(value["payload"]["key"]["component"], "napcat");
        assert_eq!(notice.generation(), Generation(3));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Connecting.to_string(), "connecting");
    }
}
