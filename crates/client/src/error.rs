//! Error types for the client crate.

use std::time::Duration;

use protocol::{ProtocolError, SessionKey};
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The relay does not know the target or component. Fatal to the attach.
    #[error("no such target: {0}")]
    NoSuchTarget(SessionKey),

    /// The relay refused the upgrade for another reason.
    #[error("handshake rejected with HTTP {status}: {reason}")]
    HandshakeRejected { status: u16, reason: String },

    /// Socket-level failure. A new `open` may recover.
    #[error("transport error: {0}")]
    Transport(String),

    /// The relay did not answer the upgrade in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Frame could not be encoded or decoded, or the endpoint is invalid.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// There is no open connection to send on.
    #[error("session is not connected")]
    NotConnected,
}

impl ClientError {
    /// Whether the error should prevent the terminal from opening at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::NoSuchTarget(_) | ClientError::HandshakeRejected { .. }
        )
    }

    /// Classify a failed WebSocket connect for `key`.
    pub fn from_connect(key: &SessionKey, err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                let status = response.status();
                if status == StatusCode::NOT_FOUND {
                    return ClientError::NoSuchTarget(key.clone());
                }
                let reason = response
                    .body()
                    .as_deref()
                    .map(|body| String::from_utf8_lossy(body).trim().to_string())
                    .filter(|body| !body.is_empty())
                    .unwrap_or_else(|| {
                        status.canonical_reason().unwrap_or("unknown").to_string()
                    });
                ClientError::HandshakeRejected {
                    status: status.as_u16(),
                    reason,
                }
            }
            tungstenite::Error::Url(e) => {
                ClientError::Protocol(ProtocolError::InvalidEndpoint(e.to_string()))
            }
            other => ClientError::Transport(other.to_string()),
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
