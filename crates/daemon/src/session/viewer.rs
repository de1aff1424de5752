//! Viewer connections attached to a session host.
//!
//! Each viewer gets a bounded outbound queue. Output is offered with
//! `try_send` so a slow viewer can never stall the process pump or other
//! viewers; a viewer whose queue fills up is dropped instead.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use protocol::{RelayMessage, SessionKey, TerminalSize};
use serde::Serialize;
use tokio::sync::mpsc;

use super::host::{InputDisposition, ResizeDisposition, SessionHost};
use super::SessionError;

/// Identifier of a viewer, unique within its host and increasing with
/// attach order.
pub type ViewerId = u64;

/// Default outbound queue capacity per viewer.
pub const DEFAULT_VIEWER_QUEUE_CAPACITY: usize = 256;

/// Smallest usable queue: `connected`, `history` and a notice must fit.
pub const MIN_VIEWER_QUEUE_CAPACITY: usize = 4;

/// Delivery statistics of one viewer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ViewerStats {
    /// Frames accepted into the queue.
    pub frames_queued: u64,
    /// Payload bytes of queued `output` frames.
    pub output_bytes: u64,
}

/// Outcome of offering a frame to a viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    /// The queue is full; the viewer must be dropped.
    Overflow,
    /// The receiving side is gone.
    Closed,
}

/// Host-side record of an attached viewer.
pub(crate) struct ViewerSlot {
    pub(crate) id: ViewerId,
    tx: mpsc::Sender<RelayMessage>,
    pub(crate) size: Option<TerminalSize>,
    pub(crate) attached_at: Instant,
    pub(crate) attached_wall: SystemTime,
    pub(crate) stats: ViewerStats,
}

impl ViewerSlot {
    pub(crate) fn new(id: ViewerId, tx: mpsc::Sender<RelayMessage>) -> Self {
        Self {
            id,
            tx,
            size: None,
            attached_at: Instant::now(),
            attached_wall: SystemTime::now(),
            stats: ViewerStats::default(),
        }
    }

    pub(crate) fn deliver(&mut self, message: RelayMessage) -> Delivery {
        let output_len = match &message {
            RelayMessage::Output { data } => data.len() as u64,
            _ => 0,
        };
        match self.tx.try_send(message) {
            Ok(()) => {
                self.stats.frames_queued += 1;
                self.stats.output_bytes += output_len;
                Delivery::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Overflow,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Snapshot of a viewer for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct ViewerInfo {
    pub id: ViewerId,
    pub authoritative: bool,
    pub size: Option<TerminalSize>,
    pub attached_secs: u64,
    pub stats: ViewerStats,
}

/// Handle held by the connection that owns a viewer.
///
/// Dropping the handle does not detach; call
/// [`SessionRegistry::detach`](super::SessionRegistry::detach).
#[derive(Clone)]
pub struct ViewerHandle {
    id: ViewerId,
    host: Arc<SessionHost>,
}

impl ViewerHandle {
    pub(crate) fn new(id: ViewerId, host: Arc<SessionHost>) -> Self {
        Self { id, host }
    }

    pub fn id(&self) -> ViewerId {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        self.host.key()
    }

    pub fn host(&self) -> &Arc<SessionHost> {
        &self.host
    }

    pub fn is_authoritative(&self) -> bool {
        self.host.authoritative_viewer() == Some(self.id)
    }

    /// Forward keystrokes to the process if this viewer holds authority.
    pub async fn send_input(&self, data: &str) -> Result<InputDisposition, SessionError> {
        self.host.on_viewer_input(self.id, data).await
    }

    /// Apply a terminal size if this viewer holds authority.
    pub async fn resize(&self, size: TerminalSize) -> Result<ResizeDisposition, SessionError> {
        self.host.on_viewer_resize(self.id, size).await
    }
}

impl std::fmt::Debug for ViewerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerHandle")
            .field("id", &self.id)
            .field("key", self.host.key())
            .finish()
    }
}

/// Result of a successful attach: the handle plus the viewer's frame queue.
///
/// The queue yields `connected`, then `history`, then live frames. It ends
/// when the viewer is detached, dropped for overflow, or the host retires.
pub struct Attachment {
    pub viewer: ViewerHandle,
    pub frames: mpsc::Receiver<RelayMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_counts_output_bytes() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut slot = ViewerSlot::new(1, tx);
        assert_eq!(slot.deliver(RelayMessage::output("hello")), Delivery::Queued);
        assert_eq!(slot.deliver(RelayMessage::error("x")), Delivery::Queued);
        assert_eq!(slot.stats.frames_queued, 2);
        assert_eq!(slot.stats.output_bytes, 5);
        assert_eq!(rx.try_recv().unwrap(), RelayMessage::output("hello"));
    }

    #[test]
    fn test_deliver_reports_overflow() {
        let (tx, _rx) = mpsc::channel(1);
        let mut slot = ViewerSlot::new(1, tx);
        assert_eq!(slot.deliver(RelayMessage::output("a")), Delivery::Queued);
        assert_eq!(slot.deliver(RelayMessage::output("b")), Delivery::Overflow);
    }

    #[test]
    fn test_deliver_reports_closed() {
        let (tx, rx) = mpsc::channel(1);
        let mut slot = ViewerSlot::new(1, tx);
        drop(rx);
        assert!(slot.is_closed());
        assert_eq!(slot.deliver(RelayMessage::output("a")), Delivery::Closed);
    }
}
