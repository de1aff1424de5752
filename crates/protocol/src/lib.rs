//! # TermRelay Protocol Library
//!
//! Wire types shared by the relay daemon and its clients.
//!
//! ## Overview
//!
//! - **Relay Messages**: the six frame variants exchanged over a terminal
//!   connection
//! - **Frame Codec**: JSON text encoding with a maximum frame size
//! - **Endpoints**: session keys and the request path that carries them
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Relay Messages               │  connected/history/output/...
//! ├─────────────────────────────────────────┤
//! │             Frame Codec                 │  JSON, 1 MiB limit
//! ├─────────────────────────────────────────┤
//! │         Transport (WebSocket)           │  text frames
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Component, FrameCodec, RelayMessage, SessionKey, TerminalEndpoint};
//!
//! let endpoint = TerminalEndpoint::new(SessionKey::new("bot-1", Component::Main));
//! assert_eq!(
//!     endpoint.path_and_query(),
//!     "/api/v1/instances/bot-1/component/main/terminal?lines=500"
//! );
//!
//! let codec = FrameCodec::new();
//! let text = codec.encode(&RelayMessage::input("ls\r")).unwrap();
//! assert_eq!(codec.decode(&text).unwrap(), RelayMessage::input("ls\r"));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Relay frame definitions
//! - [`codec`]: Frame codec
//! - [`endpoint`]: Session keys and endpoint paths
//! - [`utf8`]: Incremental UTF-8 decoding
//! - [`error`]: Error types

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod messages;
pub mod utf8;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use endpoint::{
    is_valid_target_id, Component, SessionKey, TerminalEndpoint, DEFAULT_HISTORY_DEPTH,
};
pub use error::{ProtocolError, Result};
pub use messages::{Direction, RelayMessage, TerminalSize};
pub use utf8::Utf8Decoder;
