//! Command queue with acknowledgment and retry handling
//!
//! Devices that acknowledge every command (ACK/NACK) may only have one command
//! in flight. [`CommandQueue`] holds outbound frames in FIFO order and decides
//! what to transmit next; it never touches the transport itself. Every method
//! that changes the head returns the frame the caller must write, so the write
//! can happen after the queue lock is released.

use std::collections::VecDeque;
use std::fmt;

use crate::config::MAX_SEND_RETRIES;
use crate::error::Error;

/// Immutable bytes of one outbound command
#[derive(Clone, PartialEq, Eq)]
pub struct CommandFrame(Vec<u8>);

impl CommandFrame {
    /// Wrap encoded bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Bytes to write
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the frame has no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex rendering used in log messages
    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }
}

impl fmt::Debug for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandFrame({})", self.to_hex())
    }
}

impl From<Vec<u8>> for CommandFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Format bytes as lowercase hex without separators
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Whether a command is waiting for its acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing queued
    Idle,
    /// The head frame was sent and is not acknowledged yet
    AwaitingAck,
}

/// FIFO of outbound frames with at most one frame in flight
#[derive(Debug)]
pub struct CommandQueue {
    frames: VecDeque<CommandFrame>,
    retries: u32,
    max_retries: u32,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    /// Create a queue using [`MAX_SEND_RETRIES`]
    pub fn new() -> Self {
        Self::with_max_retries(MAX_SEND_RETRIES)
    }

    /// Create a queue that drops its head after `max_retries` attempts
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            frames: VecDeque::new(),
            retries: 0,
            max_retries: max_retries.max(1),
        }
    }

    /// Idle when empty, otherwise waiting for the head's acknowledgment
    pub fn state(&self) -> QueueState {
        if self.frames.is_empty() {
            QueueState::Idle
        } else {
            QueueState::AwaitingAck
        }
    }

    /// Frame currently waiting for an acknowledgment
    pub fn in_flight(&self) -> Option<&CommandFrame> {
        self.frames.front()
    }

    /// Number of queued frames, including the one in flight
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Consecutive negative acknowledgments for the head frame
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Append a frame. Returns the frame if it must be written right away
    /// because nothing else was in flight.
    pub fn enqueue(&mut self, frame: CommandFrame) -> Option<CommandFrame> {
        let was_idle = self.frames.is_empty();
        self.frames.push_back(frame);
        if was_idle {
            self.frames.front().cloned()
        } else {
            None
        }
    }

    /// The head frame was acknowledged. Returns the next frame to write.
    pub fn on_ack(&mut self) -> Option<CommandFrame> {
        if self.frames.pop_front().is_none() {
            tracing::warn!("CommandQueue: ACK received but no command is outstanding");
            return None;
        }
        self.retries = 0;
        self.frames.front().cloned()
    }

    /// The head frame was rejected. Returns the head again for a resend, or
    /// the following frame once the head ran out of retries.
    pub fn on_nack(&mut self) -> Option<CommandFrame> {
        if self.frames.is_empty() {
            tracing::warn!("CommandQueue: NACK received but no command is outstanding");
            return None;
        }

        self.retries += 1;
        if self.retries < self.max_retries {
            tracing::debug!(
                "CommandQueue: resending command (attempt {} of {})",
                self.retries + 1,
                self.max_retries
            );
            return self.frames.front().cloned();
        }

        if let Some(dropped) = self.frames.pop_front() {
            let err = Error::RetryExhausted {
                command: dropped.to_hex(),
                attempts: self.retries,
            };
            tracing::warn!("CommandQueue: {}", err);
        }
        self.retries = 0;
        self.frames.front().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(b: u8) -> CommandFrame {
        CommandFrame::new(vec![b])
    }

    #[test]
    fn test_enqueue_sends_only_when_idle() {
        let mut q = CommandQueue::new();
        assert_eq!(q.state(), QueueState::Idle);
        assert_eq!(q.enqueue(frame(1)), Some(frame(1)));
        assert_eq!(q.enqueue(frame(2)), None);
        assert_eq!(q.state(), QueueState::AwaitingAck);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_ack_advances_fifo() {
        let mut q = CommandQueue::new();
        q.enqueue(frame(1));
        q.enqueue(frame(2));
        assert_eq!(q.on_ack(), Some(frame(2)));
        assert_eq!(q.on_ack(), None);
        assert_eq!(q.state(), QueueState::Idle);
    }

    #[test]
    fn test_unexpected_ack_and_nack_are_ignored() {
        let mut q = CommandQueue::new();
        assert_eq!(q.on_ack(), None);
        assert_eq!(q.on_nack(), None);
        assert_eq!(q.retries(), 0);
        assert_eq!(q.state(), QueueState::Idle);
    }

    #[test]
    fn test_nack_resends_head() {
        let mut q = CommandQueue::new();
        q.enqueue(frame(1));
        q.enqueue(frame(2));
        assert_eq!(q.on_nack(), Some(frame(1)));
        assert_eq!(q.retries(), 1);
        assert_eq!(q.on_ack(), Some(frame(2)));
        assert_eq!(q.retries(), 0);
    }

    #[test]
    fn test_ten_nacks_drop_head() {
        let mut q = CommandQueue::new();
        q.enqueue(frame(1));
        q.enqueue(frame(2));
        for _ in 0..9 {
            assert_eq!(q.on_nack(), Some(frame(1)));
        }
        assert_eq!(q.on_nack(), Some(frame(2)));
        assert_eq!(q.len(), 1);
        assert_eq!(q.retries(), 0);
    }

    #[test]
    fn test_nine_nacks_then_ack() {
        let mut q = CommandQueue::new();
        q.enqueue(frame(1));
        for _ in 0..9 {
            q.on_nack();
        }
        assert_eq!(q.retries(), 9);
        assert_eq!(q.on_ack(), None);
        assert!(q.is_empty());
        assert_eq!(q.retries(), 0);
    }

    #[test]
    fn test_last_frame_exhausted_goes_idle() {
        let mut q = CommandQueue::with_max_retries(2);
        q.enqueue(frame(7));
        assert_eq!(q.on_nack(), Some(frame(7)));
        assert_eq!(q.on_nack(), None);
        assert_eq!(q.state(), QueueState::Idle);
    }

    #[test]
    fn test_at_most_one_outstanding_for_any_interleaving() {
        // Deterministic pseudo-random walk over enqueue/ack/nack
        let mut q = CommandQueue::new();
        let mut seed: u32 = 0x1234_5678;
        for i in 0..5000u32 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let busy = q.state() == QueueState::AwaitingAck;
            let sent = match (seed >> 16) % 3 {
                0 => {
                    let sent = q.enqueue(frame((i % 251) as u8));
                    if busy {
                        assert!(sent.is_none(), "enqueue transmitted while awaiting ack");
                    }
                    sent
                }
                1 => q.on_ack(),
                _ => q.on_nack(),
            };
            // Whatever is transmitted is always the head, i.e. the single
            // outstanding frame
            if let Some(sent) = sent {
                assert_eq!(Some(&sent), q.in_flight());
            }
            assert!(q.retries() < MAX_SEND_RETRIES);
        }
    }

    #[test]
    fn test_queue_is_unbounded() {
        let mut q = CommandQueue::new();
        for i in 0..10_000u32 {
            q.enqueue(frame((i % 256) as u8));
        }
        assert_eq!(q.len(), 10_000);
    }

    #[test]
    fn test_frame_debug_is_hex() {
        let f = CommandFrame::new(vec![0x2a, 0x08, 0x2c, 0x01]);
        assert_eq!(format!("{:?}", f), "CommandFrame(2a082c01)");
    }
}
