//! Byte-capped, in-memory agent output log.

use std::collections::VecDeque;

/// Append-only chunk log that evicts its oldest chunks once the aggregate
/// size exceeds `cap` bytes.
///
/// The newest chunk is always kept. A single chunk larger than the cap is
/// cut down to its trailing `cap` bytes (on a char boundary) so the
/// aggregate never exceeds the cap.
#[derive(Debug, Clone)]
pub struct OutputLog {
    chunks: VecDeque<String>,
    bytes: usize,
    cap: usize,
}

impl OutputLog {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            cap,
        }
    }

    pub fn push(&mut self, chunk: impl Into<String>) {
        let mut chunk = chunk.into();
        if chunk.len() > self.cap {
            chunk = tail_within(&chunk, self.cap).to_string();
        }

        self.bytes += chunk.len();
        self.chunks.push_back(chunk);

        while self.bytes > self.cap && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.bytes -= evicted.len();
            }
        }
    }

    /// Aggregate size of the retained chunks in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &str> {
        self.chunks.iter().map(String::as_str)
    }

    /// Retained chunks joined by newlines.
    pub fn contents(&self) -> String {
        self.chunks
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }
}

/// Longest suffix of `s` no larger than `max` bytes that starts on a char boundary.
pub(crate) fn tail_within(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Longest prefix of `s` no larger than `max` bytes that ends on a char boundary.
pub(crate) fn head_within(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
