//! Fixed-capacity circular sample buffer shared by the producer and consumer.
//!
//! # Memory Layout
//! ```text
//! offset 0                capacity/2               capacity
//!   |------ first half ------|------ second half ------|
//!                 ^ write_pos = total_written % capacity
//! ```
//!
//! The buffer has exactly one writer (the producer thread) and one reader (the
//! consumer loop). Elements are stored in atomics with relaxed ordering and the
//! single `total_written` counter is published with release ordering after every
//! append. A reader that loads the counter with acquire ordering therefore sees
//! every element written before that point. If the producer re-enters a half while
//! the consumer is still copying it, the copy mixes old and new samples - an
//! overrun - but never touches uninitialised or freed memory.
//!
//! `write_pos` is derived from `total_written`, so a [`BufferPosition`] snapshot is
//! always self-consistent.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use crate::consumer::HalfBufferToken;
use crate::error::{Result, StreamError};
use crate::hardware::RawSample;

/// Snapshot of the producer's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferPosition {
    /// Next write offset, always in `[0, capacity)`
    pub write_pos: usize,
    /// Samples appended since the buffer was created
    pub total_written: u64,
}

/// Circular buffer of raw samples split into two equal halves.
#[derive(Debug)]
pub struct CircularBuffer {
    storage: Box<[AtomicU16]>,
    total_written: AtomicU64,
}

impl CircularBuffer {
    /// Allocate a zeroed buffer of `capacity` samples.
    ///
    /// The capacity must be non-zero and even so that it splits into two halves.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity % 2 != 0 {
            return Err(StreamError::Configuration(format!(
                "buffer capacity must be a non-zero even number, got {capacity}"
            )));
        }

        let storage = (0..capacity).map(|_| AtomicU16::new(0)).collect();
        Ok(Self {
            storage,
            total_written: AtomicU64::new(0),
        })
    }

    /// Total number of samples the buffer holds.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of samples in one half.
    pub fn half_len(&self) -> usize {
        self.storage.len() / 2
    }

    /// Append samples at the write position, wrapping at capacity.
    ///
    /// The write is split into a pre-wrap and a post-wrap segment when it crosses
    /// the end of the buffer. If `samples` is longer than the buffer, only its last
    /// `capacity` samples survive; the counters still advance by the full length.
    /// Always succeeds and returns `samples.len()`.
    ///
    /// Only one thread may append at a time.
    pub fn append(&self, samples: &[RawSample]) -> usize {
        let appended = samples.len();
        if appended == 0 {
            return 0;
        }

        let capacity = self.capacity();
        // Single writer: nobody else moves the counter between this load and the store.
        let total = self.total_written.load(Ordering::Relaxed);

        let skipped = appended.saturating_sub(capacity);
        let surviving = &samples[skipped..];
        let start = ((total + skipped as u64) % capacity as u64) as usize;

        let pre_wrap = surviving.len().min(capacity - start);
        let (head, tail) = surviving.split_at(pre_wrap);
        self.write_segment(start, head);
        self.write_segment(0, tail);

        self.total_written
            .store(total + appended as u64, Ordering::Release);
        appended
    }

    fn write_segment(&self, offset: usize, samples: &[RawSample]) {
        for (slot, &value) in self.storage[offset..offset + samples.len()]
            .iter()
            .zip(samples)
        {
            slot.store(value, Ordering::Relaxed);
        }
    }

    /// Read the producer's progress with acquire ordering.
    pub fn snapshot_position(&self) -> BufferPosition {
        let total_written = self.total_written.load(Ordering::Acquire);
        BufferPosition {
            write_pos: (total_written % self.capacity() as u64) as usize,
            total_written,
        }
    }

    /// Copy one half into `dest`, replacing its contents.
    pub fn copy_half_into(&self, half: HalfBufferToken, dest: &mut Vec<RawSample>) {
        let half_len = self.half_len();
        let start = match half {
            HalfBufferToken::First => 0,
            HalfBufferToken::Second => half_len,
        };

        dest.clear();
        dest.extend(
            self.storage[start..start + half_len]
                .iter()
                .map(|slot| slot.load(Ordering::Relaxed)),
        );
    }

    /// Copy one half out of the buffer.
    pub fn copy_half(&self, half: HalfBufferToken) -> Vec<RawSample> {
        let mut out = Vec::with_capacity(self.half_len());
        self.copy_half_into(half, &mut out);
        out
    }

    /// Value currently stored at `offset`.
    pub fn get(&self, offset: usize) -> Option<RawSample> {
        self.storage
            .get(offset)
            .map(|slot| slot.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: u16, len: usize) -> Vec<u16> {
        (0..len).map(|i| start.wrapping_add(i as u16)).collect()
    }

    #[test]
    fn test_rejects_odd_or_empty_capacity() {
        assert!(CircularBuffer::new(0).is_err());
        assert!(CircularBuffer::new(7).is_err());
        assert!(CircularBuffer::new(8).is_ok());
    }

    #[test]
    fn test_append_advances_position() {
        let buffer = CircularBuffer::new(16).unwrap();
        let mut expected_total = 0u64;

        for len in [0usize, 3, 5, 7, 16, 1, 9] {
            let before = buffer.snapshot_position();
            let appended = buffer.append(&ramp(1, len));
            let after = buffer.snapshot_position();

            assert_eq!(appended, len);
            expected_total += len as u64;
            assert_eq!(after.total_written, expected_total);
            assert_eq!(after.write_pos, (before.write_pos + len) % 16);
        }
    }

    #[test]
    fn test_wrap_places_tail_at_zero() {
        let buffer = CircularBuffer::new(10).unwrap();
        buffer.append(&ramp(100, 7));
        buffer.append(&ramp(200, 6));

        // 200..=202 fill offsets 7..=9, 203..=205 wrap to offsets 0..=2
        assert_eq!(buffer.get(7), Some(200));
        assert_eq!(buffer.get(9), Some(202));
        assert_eq!(buffer.get(0), Some(203));
        assert_eq!(buffer.get(2), Some(205));
        // untouched since the first append
        assert_eq!(buffer.get(3), Some(103));
        assert_eq!(buffer.snapshot_position().write_pos, 3);
    }

    #[test]
    fn test_every_offset_holds_latest_write() {
        let capacity = 12;
        let buffer = CircularBuffer::new(capacity).unwrap();
        let mut shadow = vec![0u16; capacity];
        let mut pos = 0usize;
        let mut next = 1u16;

        for len in [5usize, 11, 3, 12, 7, 2, 9] {
            let chunk = ramp(next, len);
            next = next.wrapping_add(len as u16);
            for &v in &chunk {
                shadow[pos] = v;
                pos = (pos + 1) % capacity;
            }
            buffer.append(&chunk);

            for (offset, &want) in shadow.iter().enumerate() {
                assert_eq!(buffer.get(offset), Some(want), "offset {offset}");
            }
        }
    }

    #[test]
    fn test_oversized_append_keeps_last_capacity_samples() {
        let buffer = CircularBuffer::new(4).unwrap();
        buffer.append(&[1]);
        let appended = buffer.append(&[10, 11, 12, 13, 14, 15]);
        assert_eq!(appended, 6);

        let pos = buffer.snapshot_position();
        assert_eq!(pos.total_written, 7);
        assert_eq!(pos.write_pos, 3);
        // Equivalent to writing all six one by one starting at offset 1
        assert_eq!(buffer.get(1), Some(14));
        assert_eq!(buffer.get(2), Some(15));
        assert_eq!(buffer.get(3), Some(12));
        assert_eq!(buffer.get(0), Some(13));
    }

    #[test]
    fn test_copy_half() {
        let buffer = CircularBuffer::new(8).unwrap();
        buffer.append(&ramp(1, 8));
        assert_eq!(buffer.copy_half(HalfBufferToken::First), vec![1, 2, 3, 4]);
        assert_eq!(buffer.copy_half(HalfBufferToken::Second), vec![5, 6, 7, 8]);

        let mut reused = vec![99; 10];
        buffer.copy_half_into(HalfBufferToken::Second, &mut reused);
        assert_eq!(reused, vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_concurrent_reader_never_sees_unwritten_half() {
        use std::sync::Arc;
        use std::thread;

        const TOTAL: u64 = 60_000;

        // Sample n carries the value n + 1, so a reader that observes
        // `total_written` must find a value at least that new behind the write position.
        let buffer = Arc::new(CircularBuffer::new(1024).unwrap());
        let writer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut n: u64 = 0;
                while n < TOTAL {
                    let chunk: Vec<u16> = (n..n + 64).map(|v| (v + 1) as u16).collect();
                    buffer.append(&chunk);
                    n += 64;
                }
            })
        };

        for _ in 0..10_000 {
            let pos = buffer.snapshot_position();
            if pos.total_written == 0 {
                continue;
            }
            let last = (pos.write_pos + buffer.capacity() - 1) % buffer.capacity();
            let value = u64::from(buffer.get(last).unwrap());
            // Either the published sample or one from a later lap
            assert!(value >= pos.total_written, "stale sample at {last}");
            assert_eq!((value - pos.total_written) % 1024, 0);
        }

        writer.join().unwrap();
        assert_eq!(buffer.snapshot_position().total_written, 60_032);
    }
}
