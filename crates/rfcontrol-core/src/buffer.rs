//! Receive buffer
//!
//! Bytes arrive from a connector in arbitrary chunks. Codecs append every chunk
//! to a [`ReceiveBuffer`], scan it with a cursor, and consume only the prefix
//! that made up complete frames. Whatever is left waits for the next chunk.

/// Growable byte queue with prefix consumption
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveBuffer {
    data: Vec<u8>,
}

impl ReceiveBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Buffered, not yet consumed bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of occurrences of `byte` in the buffer
    pub fn count(&self, byte: u8) -> usize {
        self.data.iter().filter(|b| **b == byte).count()
    }

    /// Index of the first `byte` at or after `from`
    pub fn position_from(&self, byte: u8, from: usize) -> Option<usize> {
        self.data
            .get(from..)?
            .iter()
            .position(|b| *b == byte)
            .map(|i| i + from)
    }

    /// Drop the first `n` bytes, keeping the rest. Consuming more than is
    /// buffered empties the buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    /// Remove and return the first `n` bytes
    pub fn split_to(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.data.len());
        self.data.drain(..n).collect()
    }

    /// Last buffered byte
    pub fn last(&self) -> Option<u8> {
        self.data.last().copied()
    }
}
