//! Fixed-capacity byte ring buffer
//!
//! Holds PCM bytes between the producer (`OutputSession::write`) and the pump
//! thread. Unlike the split SPSC buffers elsewhere in audio pipelines, this
//! one is never split: both sides reach it through the session mutex, so a
//! single `HeapRb` with both the producer and consumer traits is enough.
//!
//! Contract violations (writing more than `space()`, discarding more than
//! `len()`) are caller bugs and are checked with debug assertions only.

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::trace;

/// Byte ring buffer with contiguous-write and discard-on-read semantics
pub struct RingBuffer {
    inner: HeapRb<u8>,
}

impl RingBuffer {
    /// Allocate a buffer holding `capacity` bytes
    ///
    /// `capacity` must be non-zero.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            inner: HeapRb::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    /// Bytes currently queued
    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Bytes that can still be written
    pub fn space(&self) -> usize {
        self.inner.vacant_len()
    }

    /// Largest run that can be written in place without wrapping
    pub fn contiguous_write_len(&self) -> usize {
        self.inner.vacant_slices().0.len()
    }

    /// Largest contiguous run of queued bytes, starting at the read cursor
    pub fn readable(&self) -> &[u8] {
        self.inner.as_slices().0
    }

    /// Append `data`; caller guarantees `data.len() <= space()`
    pub fn copy_in(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.space(), "ring buffer overflow");
        let pushed = self.inner.push_slice(data);
        debug_assert_eq!(pushed, data.len());
    }

    /// Drop `n` bytes from the read side; caller guarantees `n <= len()`
    pub fn discard(&mut self, n: usize) {
        debug_assert!(n <= self.len(), "ring buffer underflow");
        let skipped = self.inner.skip(n);
        debug_assert_eq!(skipped, n);
    }

    /// Drop `n` bytes from the read side and move what remains to offset 0
    ///
    /// Used when `n` is not a whole number of frames but more data follows:
    /// the surviving bytes start a fresh frame boundary at the read cursor.
    pub fn discard_realigned(&mut self, n: usize) {
        self.discard(n);
        if self.is_empty() {
            self.discard_all();
            return;
        }
        let remaining: Vec<u8> = self.inner.pop_iter().collect();
        trace!("Realigning {} buffered bytes", remaining.len());
        self.discard_all();
        self.copy_in(&remaining);
    }

    /// Empty the buffer
    ///
    /// Reallocates rather than skipping so both cursors return to offset 0:
    /// the pump only ever reads whole frames from the contiguous run, and a
    /// flushed partial frame must not leave the read cursor misaligned.
    pub fn discard_all(&mut self) {
        let capacity = self.capacity();
        trace!("Discarding {} buffered bytes", self.len());
        self.inner = HeapRb::new(capacity);
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_buffer() {
        let ring = RingBuffer::new(16);
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.space(), 16);
        assert!(ring.is_empty());
        assert!(ring.readable().is_empty());
        assert_eq!(ring.contiguous_write_len(), 16);
    }

    #[test]
    fn test_copy_in_and_discard() {
        let mut ring = RingBuffer::new(8);
        ring.copy_in(&[1, 2, 3, 4, 5]);
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.readable(), &[1, 2, 3, 4, 5]);

        ring.discard(3);
        assert_eq!(ring.readable(), &[4, 5]);
        assert_eq!(ring.space(), 6);
    }

    #[test]
    fn test_wraparound_views() {
        let mut ring = RingBuffer::new(8);
        ring.copy_in(&[0; 6]);
        ring.discard(6);

        // Write cursor at 6: only two bytes fit before the wrap
        assert_eq!(ring.space(), 8);
        assert_eq!(ring.contiguous_write_len(), 2);

        ring.copy_in(&[1, 2, 3, 4]);
        // Readable run stops at the end of storage
        assert_eq!(ring.readable(), &[1, 2]);
        ring.discard(2);
        assert_eq!(ring.readable(), &[3, 4]);
    }

    #[test]
    fn test_discard_all_resets_cursors() {
        let mut ring = RingBuffer::new(8);
        ring.copy_in(&[9; 5]);
        ring.discard(2);
        ring.discard_all();

        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), 8);
        assert_eq!(ring.contiguous_write_len(), 8);
    }

    #[test]
    fn test_discard_realigned_keeps_following_bytes() {
        let mut ring = RingBuffer::new(8);
        ring.copy_in(&[0; 6]);
        ring.discard(6);
        // Read cursor at 6; a one-byte tail followed by four new bytes wraps
        ring.copy_in(&[9, 1, 2, 3, 4]);

        ring.discard_realigned(1);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.readable(), &[1, 2, 3, 4]);
        assert_eq!(ring.contiguous_write_len(), 4);
    }

    #[test]
    fn test_discard_realigned_everything() {
        let mut ring = RingBuffer::new(8);
        ring.copy_in(&[5; 3]);
        ring.discard_realigned(3);
        assert!(ring.is_empty());
        assert_eq!(ring.contiguous_write_len(), 8);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(usize),
        Read(usize),
        Clear,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0usize..64).prop_map(Op::Write),
            4 => (0usize..64).prop_map(Op::Read),
            1 => Just(Op::Clear),
        ]
    }

    proptest! {
        #[test]
        fn prop_len_plus_space_is_capacity(
            capacity in 1usize..96,
            ops in prop::collection::vec(op_strategy(), 0..64),
        ) {
            let mut ring = RingBuffer::new(capacity);
            let mut model: std::collections::VecDeque<u8> = Default::default();
            let mut next = 0u8;

            for op in ops {
                match op {
                    Op::Write(n) => {
                        let n = n.min(ring.space());
                        let data: Vec<u8> = (0..n)
                            .map(|_| {
                                next = next.wrapping_add(1);
                                next
                            })
                            .collect();
                        ring.copy_in(&data);
                        model.extend(data);
                    }
                    Op::Read(n) => {
                        let n = n.min(ring.readable().len());
                        let expected: Vec<u8> = model.drain(..n).collect();
                        prop_assert_eq!(&ring.readable()[..n], &expected[..]);
                        ring.discard(n);
                    }
                    Op::Clear => {
                        ring.discard_all();
                        model.clear();
                    }
                }
                prop_assert_eq!(ring.len() + ring.space(), capacity);
                prop_assert_eq!(ring.len(), model.len());
                prop_assert!(ring.contiguous_write_len() <= ring.space());
            }
        }
    }
}
