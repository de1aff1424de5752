//! # TermRelay Client Library
//!
//! Client side of the terminal relay: attaches a terminal surface to a relay
//! session, replays history, forwards input and keeps the remote terminal
//! size in sync.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                TerminalSessionManager                  │
//! │  state machine · generation check · resize debounce    │
//! ├──────────────────────────┬────────────────────────────┤
//! │     TerminalSurface      │         Connector           │
//! │  (rendering delegated)   │  one task per generation    │
//! └──────────────────────────┴──────────────┬─────────────┘
//!                                           │ WebSocket
//!                                           ▼
//!                                    termrelay-daemon
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use client::{MemorySurface, TerminalSessionManager, WsConnector};
//! use protocol::{Component, SessionKey, TerminalSize};
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connector = WsConnector::new(Url::parse("ws://127.0.0.1:23456")?);
//!     let surface = MemorySurface::new(TerminalSize::new(24, 80));
//!     let mut manager = TerminalSessionManager::new(connector, surface);
//!
//!     manager.open(SessionKey::new("bot-1", Component::Main));
//!     while let Some(event) = manager.next_event().await {
//!         manager.apply(event);
//!         if manager.state().is_terminal() {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`manager`]: Session manager and frame application
//! - [`transport`]: Connection tasks and the WebSocket connector
//! - [`state`]: Session states, generations and lifecycle notices
//! - [`surface`]: Terminal surfaces
//! - [`resize`]: Resize debouncing
//! - [`error`]: Error types

pub mod error;
pub mod manager;
pub mod resize;
pub mod state;
pub mod surface;
pub mod transport;

pub use error::{ClientError, Result};
pub use manager::{FrameDisposition, ManagerConfig, TerminalSessionManager};
pub use resize::{ResizeDebouncer, DEFAULT_RESIZE_DEBOUNCE};
pub use state::{Generation, LifecycleNotice, SessionState};
pub use surface::{MemorySurface, TerminalSurface, WriterSurface};
pub use transport::{
    ConnectionLink, Connector, LinkEvent, TaggedEvent, WsConnector, DEFAULT_CONNECT_TIMEOUT,
};
