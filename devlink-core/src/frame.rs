//! Framing: delimiter-separated text frames over a fragment-prone byte stream.
//!
//! The carry-over is held as bytes so that a UTF-8 sequence or a multi-byte
//! delimiter split across two reads is reassembled before decoding.

use std::borrow::Cow;

/// Default frame delimiter.
pub const DEFAULT_DELIMITER: &str = "|";

/// Splits incoming chunks into complete frames, carrying the unterminated tail
/// over to the next call.
#[derive(Debug, Clone)]
pub struct FrameSplitter {
    delimiter: Vec<u8>,
    carry: Vec<u8>,
}

impl FrameSplitter {
    /// Create a splitter for `delimiter`. An empty delimiter falls back to [`DEFAULT_DELIMITER`].
    pub fn new(delimiter: &str) -> Self {
        let delimiter = if delimiter.is_empty() {
            DEFAULT_DELIMITER
        } else {
            delimiter
        };
        Self {
            delimiter: delimiter.as_bytes().to_vec(),
            carry: Vec::new(),
        }
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Bytes held over from the last incomplete frame.
    pub fn carry(&self) -> &[u8] {
        &self.carry
    }

    /// Carry-over decoded as text (lossy).
    pub fn carry_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.carry)
    }

    /// Feed one chunk. The new carry-over is stored before this returns; the
    /// returned iterator yields the complete, non-blank frames in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames {
        let mut buf = std::mem::take(&mut self.carry);
        // The old carry holds no whole delimiter; only one straddling the join can be new.
        let mut from = buf.len().saturating_sub(self.delimiter.len() - 1);
        buf.extend_from_slice(chunk);

        let mut tail_start = 0;
        while let Some(at) = find(&buf, &self.delimiter, from) {
            tail_start = at + self.delimiter.len();
            from = tail_start;
        }
        self.carry = buf.split_off(tail_start);

        Frames {
            buf,
            pos: 0,
            delimiter: self.delimiter.clone(),
        }
    }
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

/// Complete frames produced by one [`FrameSplitter::feed`] call.
#[derive(Debug)]
pub struct Frames {
    // Ends exactly on a delimiter (or is empty).
    buf: Vec<u8>,
    pos: usize,
    delimiter: Vec<u8>,
}

impl Iterator for Frames {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while self.pos < self.buf.len() {
            let end = find(&self.buf, &self.delimiter, self.pos).unwrap_or(self.buf.len());
            let frame = String::from_utf8_lossy(&self.buf[self.pos..end]);
            self.pos = end + self.delimiter.len();
            if !frame.trim().is_empty() {
                return Some(frame.into_owned());
            }
        }
        None
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}
