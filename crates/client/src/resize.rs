//! Trailing-edge debounce for geometry changes.

use std::time::{Duration, Instant};

use protocol::TerminalSize;

/// Default quiet period before a resize frame is sent.
pub const DEFAULT_RESIZE_DEBOUNCE: Duration = Duration::from_millis(50);

/// Coalesces bursts of geometry changes into one frame.
///
/// Every `record` replaces the pending size and restarts the quiet period,
/// so the size released by `poll` is always the latest one recorded.
#[derive(Debug, Clone)]
pub struct ResizeDebouncer {
    delay: Duration,
    pending: Option<(TerminalSize, Instant)>,
}

impl Default for ResizeDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_RESIZE_DEBOUNCE)
    }
}

impl ResizeDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn record(&mut self, size: TerminalSize, now: Instant) {
        self.pending = Some((size, now + self.delay));
    }

    /// Release the pending size once its quiet period has passed.
    pub fn poll(&mut self, now: Instant) -> Option<TerminalSize> {
        match self.pending {
            Some((size, due)) if due <= now => {
                self.pending = None;
                Some(size)
            }
            _ => None,
        }
    }

    /// Release the pending size immediately.
    pub fn flush(&mut self) -> Option<TerminalSize> {
        self.pending.take().map(|(size, _)| size)
    }

    /// When the pending size becomes due.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, due)| due)
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }
}
