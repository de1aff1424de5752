//! Unix Domain Socket IPC between `termrelay-daemon` subcommands and the
//! running daemon.
//!
//! The protocol is newline-delimited JSON: one [`IpcRequest`] per line, one
//! [`IpcResponse`] line back.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/termrelay/daemon.sock`
//! - Fallback: `/tmp/termrelay-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse, IpcSessionInfo};
pub use server::{IpcConnection, IpcError, IpcHandler, IpcServer};

use std::path::PathBuf;
use std::time::Duration;

/// Get the socket path for IPC communication.
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join("termrelay").join("daemon.sock")
        }
        _ => {
            // UID of the owner of our own /proc entry.
            let uid = std::fs::metadata("/proc/self")
                .map(|m| m.uid())
                .unwrap_or(0);
            PathBuf::from(format!("/tmp/termrelay-{}", uid)).join("daemon.sock")
        }
    }
}

#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    PathBuf::from("/tmp/termrelay-unsupported/daemon.sock")
}

/// Whether a daemon answers on the socket.
pub async fn is_daemon_running() -> bool {
    match IpcClient::connect_with_timeout(&get_socket_path(), Duration::from_millis(500)).await {
        Ok(mut client) => client.ping().await.unwrap_or(false),
        Err(_) => false,
    }
}
