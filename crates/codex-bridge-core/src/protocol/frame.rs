//! Byte stream to JSON frames.
//!
//! The agent writes one JSON object per line, but reads from its stdout pipe
//! return arbitrary chunks: half a line, three lines, a line and a half. The
//! [`FrameReader`] reassembles them.
//!
//! # Algorithm
//!
//! 1. If nothing is carried over and the whole chunk parses as one JSON
//!    object, emit it straight away.
//! 2. Otherwise append the chunk to the carry-over buffer and cut it at every
//!    newline. Each non-blank line is parsed; lines that fail to parse are
//!    dropped (agents sometimes interleave plain-text diagnostics).
//! 3. Whatever follows the last newline waits for the next chunk.
//!
//! Splitting happens on raw bytes, so a multi-byte UTF-8 character cut in half
//! by a chunk boundary is reassembled before any parsing happens.
//!
//! JSON strings cannot contain a literal newline, so a well-formed line is
//! never cut inside a string. Pretty-printed (multi-line) objects are not
//! supported: their individual lines fail to parse and are dropped.

use serde_json::Value;

#[derive(Debug, Default)]
pub struct FrameReader {
    /// Bytes after the last newline seen so far.
    buffer: Vec<u8>,

    /// Lines dropped because they were not valid JSON.
    dropped: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every complete frame it finishes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        if chunk.is_empty() {
            return Vec::new();
        }

        if self.buffer.is_empty() {
            if let Ok(value @ Value::Object(_)) = serde_json::from_slice::<Value>(chunk) {
                return vec![value];
            }
        }

        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if let Some(value) = self.parse_line(start, end) {
                frames.push(value);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        frames
    }

    /// Parse whatever is left once the stream has ended.
    pub fn flush(&mut self) -> Option<Value> {
        let end = self.buffer.len();
        let value = self.parse_line(0, end);
        self.buffer.clear();
        value
    }

    /// Bytes waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of non-blank lines that were not valid JSON.
    pub fn dropped_lines(&self) -> usize {
        self.dropped
    }

    fn parse_line(&mut self, start: usize, end: usize) -> Option<Value> {
        let line = self.buffer[start..end].trim_ascii();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_slice(line) {
            Ok(value) => Some(value),
            Err(e) => {
                self.dropped += 1;
                log::debug!(
                    "Dropping non-JSON line ({}): {}",
                    e,
                    String::from_utf8_lossy(line)
                );
                None
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
