//! Relay message definitions.
//!
//! Every frame exchanged over a terminal connection is a JSON object whose
//! `type` field selects the variant:
//!
//! ```text
//!  host ──► client   {"type":"connected","message":"...","pid":1234}
//!  host ──► client   {"type":"history","lines":["...","..."]}
//!  host ──► client   {"type":"output","data":"..."}
//!  host ──► client   {"type":"error","message":"..."}
//!  client ──► host   {"type":"input","data":"..."}
//!  client ──► host   {"type":"resize","rows":30,"cols":120}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// A size with zero rows or columns cannot be applied to a PTY.
    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Which side of the connection is allowed to send a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToClient,
    ClientToHost,
}

/// A single relay frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayMessage {
    /// Sent once, first, after the host accepts the viewer.
    Connected {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    /// Replayed output, oldest first. Sent once, directly after `connected`.
    History { lines: Vec<String> },
    /// Live process output.
    Output { data: String },
    /// Keystrokes from the authoritative viewer.
    Input { data: String },
    /// Geometry of the viewer's terminal.
    Resize { rows: u16, cols: u16 },
    /// Notice from the host. The connection may stay open afterwards.
    Error { message: String },
}

impl RelayMessage {
    pub fn connected(message: impl Into<String>, pid: Option<u32>) -> Self {
        Self::Connected {
            message: message.into(),
            pid,
        }
    }

    pub fn history(lines: Vec<String>) -> Self {
        Self::History { lines }
    }

    pub fn output(data: impl Into<String>) -> Self {
        Self::Output { data: data.into() }
    }

    pub fn input(data: impl Into<String>) -> Self {
        Self::Input { data: data.into() }
    }

    pub fn resize(size: TerminalSize) -> Self {
        Self::Resize {
            rows: size.rows,
            cols: size.cols,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The wire name of this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::History { .. } => "history",
            Self::Output { .. } => "output",
            Self::Input { .. } => "input",
            Self::Resize { .. } => "resize",
            Self::Error { .. } => "error",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::Input { .. } | Self::Resize { .. } => Direction::ClientToHost,
            _ => Direction::HostToClient,
        }
    }

    /// Returns the requested size for `resize` frames.
    pub fn as_size(&self) -> Option<TerminalSize> {
        match self {
            Self::Resize { rows, cols } => Some(TerminalSize::new(*rows, *cols)),
            _ => None,
        }
    }

    /// Checks value constraints that the JSON schema alone cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Self::Resize { rows, cols } = self {
            if *rows == 0 || *cols == 0 {
                return Err(ProtocolError::InvalidMessage(format!(
                    "resize to {}x{} has a zero dimension",
                    cols, rows
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connected_wire_format() {
        let msg = RelayMessage::connected("attached to bot-1/main", Some(4242));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "connected", "message": "attached to bot-1/main", "pid": 4242})
        );
    }

    #[test]
    fn test_connected_without_pid_omits_field() {
        let msg = RelayMessage::connected("main is not running", None);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "connected", "message": "main is not running"}));
    }

    #[test]
    fn test_connected_accepts_missing_pid() {
        let msg: RelayMessage =
            serde_json::from_str(r#"{"type":"connected","message":"hi"}"#).unwrap();
        assert_eq!(msg, RelayMessage::connected("hi", None));
    }

    #[test]
    fn test_history_wire_format() {
        let msg = RelayMessage::history(vec!["a".into(), "b".into()]);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "history", "lines": ["a", "b"]}));
    }

    #[test]
    fn test_resize_from_client_json() {
        let msg: RelayMessage =
            serde_json::from_str(r#"{"type":"resize","rows":30,"cols":120}"#).unwrap();
        assert_eq!(msg.as_size(), Some(TerminalSize::new(30, 120)));
        assert_eq!(msg.direction(), Direction::ClientToHost);
    }

    #[test]
    fn test_input_direction() {
        assert_eq!(RelayMessage::input("ls\r").direction(), Direction::ClientToHost);
        assert_eq!(RelayMessage::output("x").direction(), Direction::HostToClient);
        assert_eq!(RelayMessage::error("x").direction(), Direction::HostToClient);
    }

    #[test]
    fn test_kind_names_match_tag() {
        let messages = vec![
            RelayMessage::connected("m", None),
            RelayMessage::history(vec![]),
            RelayMessage::output("o"),
            RelayMessage::input("i"),
            RelayMessage::resize(TerminalSize::new(1, 1)),
            RelayMessage::error("e"),
        ];
        for msg in messages {
            let value = serde_json::to_value(&msg).unwrap();
            assert_eq!(value["type"], msg.kind());
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = serde_json::from_str::<RelayMessage>(r#"{"type":"ping"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_resize() {
        let msg = RelayMessage::Resize { rows: 0, cols: 80 };
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::InvalidMessage(_))
        ));
        assert!(RelayMessage::resize(TerminalSize::new(24, 80)).validate().is_ok());
    }

    #[test]
    fn test_terminal_size_display_and_default() {
        assert_eq!(TerminalSize::default(), TerminalSize::new(24, 80));
        assert_eq!(TerminalSize::new(30, 120).to_string(), "120x30");
        assert!(!TerminalSize::new(0, 10).is_valid());
    }
}
