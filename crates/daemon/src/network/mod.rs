//! Network surface of the daemon.
//!
//! Viewers reach session hosts over WebSocket; see [`server`].

pub mod server;

pub use server::{RelayServer, ServerSettings};
