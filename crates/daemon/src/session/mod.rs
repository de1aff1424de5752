//! Relay sessions.
//!
//! A [`SessionRegistry`] maps each [`SessionKey`](protocol::SessionKey) to at
//! most one [`SessionHost`]. A host binds to a running process, keeps an
//! [`OutputRingBuffer`] of its recent output and fans that output out to
//! attached viewers. Only the most recently attached viewer may send input or
//! resize the terminal.

mod error;
pub mod host;
pub mod registry;
pub mod ring_buffer;
pub mod viewer;

pub use error::SessionError;
pub use host::{
    HostInfo, HostSettings, InputDisposition, ResizeDisposition, SessionHost,
    PROCESS_EXITED_NOTICE,
};
pub use registry::{RegistrySettings, SessionRegistry, DEFAULT_TEARDOWN_GRACE, SUPERSEDED_NOTICE};
pub use ring_buffer::OutputRingBuffer;
pub use viewer::{Attachment, ViewerHandle, ViewerId, ViewerInfo, ViewerStats};
