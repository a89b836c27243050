//! Bounded output collection.

/// An append-only byte collector with a hard cap.
///
/// Writes past the cap are silently discarded; the retained prefix is exactly
/// the first `cap` bytes ever written. Used for the buffered stdout/stderr
/// copies on both ends of an exec exchange, where streamed delivery remains
/// complete even when the buffered copy truncates.
#[derive(Debug)]
pub struct BoundedBuffer {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl BoundedBuffer {
    /// Create a collector retaining at most `cap` bytes.
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Append bytes, keeping at most the configured cap.
    pub fn write(&mut self, data: &[u8]) {
        if self.cap == 0 {
            if !data.is_empty() {
                self.truncated = true;
            }
            return;
        }

        let remaining = self.cap - self.buf.len();
        if remaining == 0 {
            if !data.is_empty() {
                self.truncated = true;
            }
            return;
        }

        if data.len() > remaining {
            self.buf.extend_from_slice(&data[..remaining]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(data);
        }
    }

    /// Bytes retained so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been retained.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True when at least one byte was discarded.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Borrow the retained bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the collector, returning the retained bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
