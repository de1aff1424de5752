//! Bounded history of process output.
//!
//! The buffer keeps whole output chunks, never splitting one, so a replayed
//! tail is byte-for-byte what viewers saw live. Eviction is oldest-first and
//! triggered by either the entry capacity or the byte budget.

use std::collections::VecDeque;

/// Default number of retained chunks.
pub const DEFAULT_RING_CAPACITY: usize = 1000;

/// Default byte budget across all retained chunks (2 MiB).
pub const DEFAULT_RING_MAX_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug)]
pub struct OutputRingBuffer {
    entries: VecDeque<String>,
    capacity: usize,
    max_bytes: usize,
    bytes: usize,
    total_emitted: u64,
}

impl Default for OutputRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl OutputRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_byte_limit(capacity, DEFAULT_RING_MAX_BYTES)
    }

    pub fn with_byte_limit(capacity: usize, max_bytes: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            max_bytes,
            bytes: 0,
            total_emitted: 0,
        }
    }

    /// Append a chunk, evicting from the front as needed.
    ///
    /// The newest chunk is always kept while the capacity is non-zero, even
    /// if it alone exceeds the byte budget.
    pub fn push(&mut self, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        self.total_emitted += 1;
        if self.capacity == 0 {
            return;
        }

        self.bytes += chunk.len();
        self.entries.push_back(chunk);

        while self.entries.len() > self.capacity
            || (self.bytes > self.max_bytes && self.entries.len() > 1)
        {
            if let Some(evicted) = self.entries.pop_front() {
                self.bytes -= evicted.len();
            }
        }
    }

    /// The newest `min(depth, len)` chunks, oldest first.
    pub fn tail(&self, depth: usize) -> Vec<String> {
        let skip = self.entries.len().saturating_sub(depth);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently retained.
    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    /// Number of non-empty chunks ever pushed.
    pub fn total_emitted(&self) -> u64 {
        self.total_emitted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}
