use std::collections::VecDeque;

use tokio::sync::mpsc;

use super::OutputStream;

/// Default number of chunks a process keeps for new subscribers.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 300;

/// Output fan-out of one process run.
///
/// Publishing and subscribing happen under the same lock held by the owner,
/// so a subscriber's backlog snapshot and its stream never overlap or leave
/// a gap.
#[derive(Debug)]
pub struct OutputFeed {
    backlog: VecDeque<String>,
    capacity: usize,
    subscribers: Vec<mpsc::UnboundedSender<String>>,
    closed: bool,
}

impl OutputFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            backlog: VecDeque::new(),
            capacity,
            subscribers: Vec::new(),
            closed: false,
        }
    }

    /// Record a chunk and forward it to live subscribers.
    pub fn publish(&mut self, chunk: String) {
        if chunk.is_empty() || self.closed {
            return;
        }
        self.subscribers.retain(|tx| tx.send(chunk.clone()).is_ok());
        if self.capacity > 0 {
            if self.backlog.len() == self.capacity {
                self.backlog.pop_front();
            }
            self.backlog.push_back(chunk);
        }
    }

    /// Snapshot the backlog and register a new stream.
    ///
    /// The stream of a closed feed ends immediately.
    pub fn subscribe(&mut self) -> (Vec<String>, OutputStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed {
            self.subscribers.push(tx);
        }
        (self.backlog.iter().cloned().collect(), rx)
    }

    /// End every stream. Later subscribers still get the backlog.
    pub fn close(&mut self) {
        self.closed = true;
        self.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().filter(|tx| !tx.is_closed()).count()
    }
}
