//! Inbound sequence restoration
//!
//! The adapter numbers received frames; the engine must dispatch them in
//! that order. Frames arriving early wait in a bounded buffer until the
//! gap before them closes. When the buffer fills up the missing frame is
//! considered lost: the oldest waiting entry is dropped with a warning and
//! the expected counter jumps past the gap.

use std::collections::BTreeMap;

use loxlink_core::frame::CanFrame;
use tracing::{debug, warn};

/// Restores adapter-sequence order over received frames
#[derive(Debug)]
pub struct ReorderBuffer {
    next_expected: u64,
    pending: BTreeMap<u64, CanFrame>,
    capacity: usize,
    dropped: u64,
}

impl ReorderBuffer {
    /// Buffer starting at sequence 0 with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            next_expected: 0,
            pending: BTreeMap::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Offer a received frame; returns every frame now releasable in
    /// strict ascending sequence order.
    pub fn push(&mut self, sequence: u64, frame: CanFrame) -> Vec<CanFrame> {
        if sequence < self.next_expected {
            debug!(sequence, next = self.next_expected, "stale frame discarded");
            return Vec::new();
        }

        self.pending.insert(sequence, frame);

        if self.pending.len() > self.capacity {
            // A frame was lost at the adapter; give up waiting for it.
            let (&oldest, _) = self.pending.iter().next().expect("buffer not empty");
            self.pending.remove(&oldest);
            self.dropped += 1;
            warn!(
                sequence = oldest,
                waiting_for = self.next_expected,
                "reorder buffer full, dropping oldest pending frame"
            );
            self.next_expected = oldest + 1;
        }

        self.drain_in_order()
    }

    fn drain_in_order(&mut self) -> Vec<CanFrame> {
        let mut released = Vec::new();
        while let Some(frame) = self.pending.remove(&self.next_expected) {
            released.push(frame);
            self.next_expected += 1;
        }
        released
    }

    /// Frames discarded because the buffer overflowed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Frames currently waiting for a gap to close.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> CanFrame {
        CanFrame::new(0x1000_0000 | u32::from(tag), [tag; 8])
    }

    #[test]
    fn in_order_frames_pass_through() {
        let mut buffer = ReorderBuffer::new(4);
        assert_eq!(buffer.push(0, frame(0)).len(), 1);
        assert_eq!(buffer.push(1, frame(1)).len(), 1);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn out_of_order_frames_wait_for_the_gap() {
        let mut buffer = ReorderBuffer::new(4);
        assert!(buffer.push(1, frame(1)).is_empty());
        assert!(buffer.push(2, frame(2)).is_empty());

        let released = buffer.push(0, frame(0));
        assert_eq!(released.len(), 3);
        assert_eq!(released[0].data[0], 0);
        assert_eq!(released[1].data[0], 1);
        assert_eq!(released[2].data[0], 2);
    }

    #[test]
    fn stale_frames_are_discarded() {
        let mut buffer = ReorderBuffer::new(4);
        buffer.push(0, frame(0));
        assert!(buffer.push(0, frame(0)).is_empty());
    }

    #[test]
    fn overflow_gives_up_on_the_gap() {
        let mut buffer = ReorderBuffer::new(2);
        // Sequence 0 never arrives.
        assert!(buffer.push(1, frame(1)).is_empty());
        assert!(buffer.push(2, frame(2)).is_empty());

        // Third waiter exceeds capacity: 1 is dropped, 2 and 3 release.
        let released = buffer.push(3, frame(3));
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].data[0], 2);
        assert_eq!(released[1].data[0], 3);
    }

    #[test]
    fn order_resumes_after_a_drop() {
        let mut buffer = ReorderBuffer::new(2);
        buffer.push(1, frame(1));
        buffer.push(2, frame(2));
        buffer.push(3, frame(3));

        // Gap resolved by the drop; later traffic flows normally.
        assert_eq!(buffer.push(4, frame(4)).len(), 1);
    }
}
