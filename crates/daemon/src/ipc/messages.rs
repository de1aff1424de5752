//! IPC message types for CLI-daemon communication.
//!
//! This module defines the request and response types used for communication
//! between the CLI and the daemon over Unix Domain Sockets.

use protocol::SessionKey;
use serde::{Deserialize, Serialize};

use crate::process::ProcessStatus;
use crate::session::HostInfo;

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List live relay sessions.
    ListSessions,
    /// Start a configured component.
    StartProcess { key: SessionKey },
    /// Stop a component. `force` kills without the interrupt grace period.
    StopProcess { key: SessionKey, force: bool },
    /// Query one component.
    ProcessStatus { key: SessionKey },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Relay listen address.
        bind: String,
        /// Live session hosts.
        session_count: usize,
        /// Viewers attached across all hosts.
        viewer_count: usize,
        /// Open WebSocket connections.
        connection_count: usize,
        /// Configured components.
        target_count: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// Live relay sessions.
    Sessions { sessions: Vec<IpcSessionInfo> },
    ProcessStarted { key: SessionKey, pid: Option<u32> },
    ProcessStopped { key: SessionKey, status: ProcessStatus },
    ProcessStatus { key: SessionKey, status: ProcessStatus },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

/// Summary of one session host for IPC listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcSessionInfo {
    /// Flat `{target}_{component}` identifier.
    pub session_id: String,
    pub key: SessionKey,
    pub host_id: String,
    pub pid: Option<u32>,
    pub terminated: bool,
    pub viewer_count: usize,
    pub authoritative_viewer: Option<u64>,
    pub buffered_chunks: usize,
    pub buffered_bytes: usize,
    pub age_secs: u64,
}

impl From<&HostInfo> for IpcSessionInfo {
    fn from(info: &HostInfo) -> Self {
        Self {
            session_id: info.session_id.clone(),
            key: info.key.clone(),
            host_id: info.host_id.to_string(),
            pid: info.pid,
            terminated: info.terminated,
            viewer_count: info.viewers.len(),
            authoritative_viewer: info.authoritative_viewer,
            buffered_chunks: info.buffered_chunks,
            buffered_bytes: info.buffered_bytes,
            age_secs: info.age_secs,
        }
    }
}
