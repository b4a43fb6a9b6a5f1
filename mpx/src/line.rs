//! Line discipline: an append-only byte buffer with pattern search.
//!
//! This is a pure search/slice primitive. It never interprets bytes; the
//! REPL engine and the mount proxy decide what the bytes mean. Every byte
//! appended is surfaced exactly once, either by a successful
//! [`LineBuffer::take_until`] or by [`LineBuffer::take_all`].

/// Growable buffer over which delimiter patterns are located.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Read-only view of the pending bytes.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Finds `pattern`, returning the offset of its first byte.
    #[must_use]
    pub fn find(&self, pattern: &[u8]) -> Option<usize> {
        find(&self.buf, pattern)
    }

    /// If `pattern` is present, removes and returns everything before it
    /// and consumes the pattern itself.
    pub fn take_until(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let at = self.find(pattern)?;
        let mut rest = self.buf.split_off(at + pattern.len());
        std::mem::swap(&mut rest, &mut self.buf);
        rest.truncate(at);
        Some(rest)
    }

    /// Removes and returns exactly `n` bytes, if that many are buffered.
    pub fn take_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.buf.len() < n {
            return None;
        }
        let rest = self.buf.split_off(n);
        Some(std::mem::replace(&mut self.buf, rest))
    }

    /// Removes and returns the whole buffer.
    pub fn take_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// First occurrence of `pattern` in `haystack`.
#[must_use]
pub fn find(haystack: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(pattern.len())
        .position(|w| w == pattern)
}
