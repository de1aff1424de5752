//! Incremental UTF-8 decoding for byte streams read in arbitrary chunks.

/// Incremental UTF-8 decoder for PTY and terminal reads.
///
/// A multi-byte character split across two reads is held back until the
/// rest arrives. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `bytes` (plus any carried tail) as possible.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut pos = 0;
        while pos < self.pending.len() {
            match std::str::from_utf8(&self.pending[pos..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    pos = self.pending.len();
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(
                        &self.pending[pos..pos + valid_up_to],
                    ));
                    pos += valid_up_to;
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            pos += len;
                        }
                        // Incomplete sequence at the end; wait for more bytes.
                        None => break,
                    }
                }
            }
        }

        self.pending.drain(..pos);
        out
    }

    /// Flush whatever is still pending, replacing an incomplete tail.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"hello\r\n"), "hello\r\n");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_split_multibyte_sequence() {
        let bytes = "日志".as_bytes();
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&bytes[..2]), "");
        assert!(decoder.has_pending());
        assert_eq!(decoder.decode(&bytes[2..4]), "日");
        assert_eq!(decoder.decode(&bytes[4..]), "志");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_invalid_bytes_replaced() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_invalid_byte_then_incomplete_tail() {
        let bytes = "é".as_bytes();
        let mut decoder = Utf8Decoder::new();
        let mut read = vec![b'a', 0xff];
        read.push(bytes[0]);
        assert_eq!(decoder.decode(&read), "a\u{FFFD}");
        assert!(decoder.has_pending());
        assert_eq!(decoder.decode(&bytes[1..]), "é");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_finish_flushes_incomplete_tail() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&"✓".as_bytes()[..1]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert!(!decoder.has_pending());
    }
}
