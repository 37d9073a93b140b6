//! Capped scrollback kept for replay on attach.

use bytes::Bytes;

/// Append-only byte history that drops its oldest bytes once `capacity` is exceeded.
#[derive(Debug)]
pub struct OutputHistory {
    buf: Vec<u8>,
    capacity: usize,
}

impl OutputHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.capacity..]);
            return;
        }

        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Current contents, oldest byte first.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
