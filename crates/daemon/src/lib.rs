//! # TermRelay Daemon Library
//!
//! The daemon runs managed components (a target's main process and its
//! companions) in pseudo-terminals and relays each terminal to any number of
//! WebSocket viewers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          RelayDaemon                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐   handles   ┌──────────────────────────────┐  │
//! │  │   Process    │ ──────────► │       Session Registry       │  │
//! │  │   Manager    │             │  SessionHost per target/role │  │
//! │  └──────────────┘             │  ring buffer + viewer queues │  │
//! │                               └──────────────────────────────┘  │
//! │                                          ▲                      │
//! │  ┌───────────────────┐   ┌───────────────┴──────────────────┐   │
//! │  │    IPC server     │   │    WebSocket relay (network)     │   │
//! │  └───────────────────┘   └──────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, RelayDaemon};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let daemon = RelayDaemon::new(config)?;
//!     let addr = daemon.start().await?;
//!     println!("relay listening on {addr}");
//!
//!     daemon.shutdown_token().cancelled().await;
//!     daemon.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`process`]: Process manager collaborators (PTY and channel backed)
//! - [`session`]: Ring buffer, session hosts and the session registry
//! - [`network`]: WebSocket relay listener
//! - [`ipc`]: Operator commands over a Unix socket
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod ipc;
pub mod network;
pub mod orchestrator;
pub mod process;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};

pub use process::{
    ChannelProcess, ChannelProcessManager, CommandSpec, ProcessHandle, ProcessManager,
    ProcessStatus, PtyProcessManager,
};

pub use session::{
    Attachment, HostInfo, OutputRingBuffer, SessionError, SessionHost, SessionRegistry,
    ViewerHandle,
};

pub use network::{RelayServer, ServerSettings};

pub use orchestrator::{DaemonEvent, DaemonState, RelayDaemon};
