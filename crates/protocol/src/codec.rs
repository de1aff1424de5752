//! JSON frame codec.
//!
//! Relay frames travel as WebSocket text messages. The codec enforces the
//! maximum frame size on both encode and decode and validates decoded frames,
//! so callers only ever see well-formed [`RelayMessage`] values.

use crate::error::{ProtocolError, Result};
use crate::messages::RelayMessage;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encoded size of an `output` frame with empty data.
const OUTPUT_ENVELOPE: usize = r#"{"type":"output","data":""}"#.len();

/// Encoded size of a `history` frame with no lines.
const HISTORY_ENVELOPE: usize = r#"{"type":"history","lines":[]}"#.len();

/// Per-line cost in a `history` frame on top of the escaped text: two
/// quotes and a separating comma.
const HISTORY_LINE_OVERHEAD: usize = 3;

/// Codec for encoding and decoding relay frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec with the default maximum frame size.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a message into a text frame.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` if the encoded frame exceeds the limit.
    pub fn encode(&self, message: &RelayMessage) -> Result<String> {
        let text = serde_json::to_string(message)?;
        if text.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: self.max_frame_size,
            });
        }
        Ok(text)
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` for oversized input, `Deserialization` for
    /// malformed JSON or an unknown `type`, and `InvalidMessage` for frames
    /// that parse but carry unacceptable values.
    pub fn decode(&self, text: &str) -> Result<RelayMessage> {
        self.decode_bytes(text.as_bytes())
    }

    /// Decode a frame delivered as raw bytes (binary WebSocket messages).
    pub fn decode_bytes(&self, data: &[u8]) -> Result<RelayMessage> {
        if data.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }
        let message: RelayMessage = serde_json::from_slice(data)?;
        message.validate()?;
        Ok(message)
    }

    /// Split process output into `output` frames that each encode within
    /// the limit. Pieces break on char boundaries and concatenate back to
    /// `data`.
    pub fn output_frames(&self, data: &str) -> Vec<RelayMessage> {
        let budget = self.max_frame_size.saturating_sub(OUTPUT_ENVELOPE);
        if escaped_len(data) <= budget {
            return vec![RelayMessage::output(data)];
        }
        split_escaped(data, budget)
            .into_iter()
            .map(RelayMessage::output)
            .collect()
    }

    /// Pack replay lines, oldest first, into `history` frames that each
    /// encode within the limit. A line too large for a frame of its own is
    /// split across consecutive entries. Always yields at least one frame.
    pub fn history_frames(&self, lines: Vec<String>) -> Vec<RelayMessage> {
        let budget = self.max_frame_size.saturating_sub(HISTORY_ENVELOPE);
        let mut packer = HistoryPacker::new(budget);
        for line in lines {
            let cost = escaped_len(&line) + HISTORY_LINE_OVERHEAD;
            if cost <= budget {
                packer.push(line, cost);
                continue;
            }
            let piece_budget = budget.saturating_sub(HISTORY_LINE_OVERHEAD);
            for piece in split_escaped(&line, piece_budget) {
                let cost = escaped_len(piece) + HISTORY_LINE_OVERHEAD;
                packer.push(piece.to_string(), cost);
            }
        }
        packer.finish()
    }
}

struct HistoryPacker {
    budget: usize,
    used: usize,
    batch: Vec<String>,
    frames: Vec<RelayMessage>,
}

impl HistoryPacker {
    fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            batch: Vec::new(),
            frames: Vec::new(),
        }
    }

    fn push(&mut self, line: String, cost: usize) {
        if self.used + cost > self.budget && !self.batch.is_empty() {
            self.frames
                .push(RelayMessage::history(std::mem::take(&mut self.batch)));
            self.used = 0;
        }
        self.used += cost;
        self.batch.push(line);
    }

    fn finish(mut self) -> Vec<RelayMessage> {
        if !self.batch.is_empty() || self.frames.is_empty() {
            self.frames.push(RelayMessage::history(self.batch));
        }
        self.frames
    }
}

/// Length of `c` inside a JSON string as serde_json writes it.
fn escaped_char_len(c: char) -> usize {
    match c {
        '"' | '\\' | '\n' | '\r' | '\t' | '\u{08}' | '\u{0c}' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}

fn escaped_len(s: &str) -> usize {
    s.chars().map(escaped_char_len).sum()
}

/// Split `data` on char boundaries into pieces whose escaped length is at
/// most `budget`. Each piece holds at least one char.
fn split_escaped(data: &str, budget: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (i, c) in data.char_indices() {
        let len = escaped_char_len(c);
        if used + len > budget && i > start {
            pieces.push(&data[start..i]);
            start = i;
            used = 0;
        }
        used += len;
    }
    if start < data.len() {
        pieces.push(&data[start..]);
    }
    pieces
}
