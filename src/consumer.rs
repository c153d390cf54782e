//! Half-buffer consumer.
//!
//! The consumer never blocks on the producer. On each poll it takes a snapshot of
//! the write position and decides whether the half the producer just left is
//! complete:
//!
//! | last delivered | write position        | action                  |
//! |----------------|-----------------------|-------------------------|
//! | `Second`       | `>= capacity / 2`     | deliver `First`         |
//! | `First`        | `<  capacity / 2`     | deliver `Second`        |
//! | otherwise      |                       | nothing to do           |
//!
//! A write position exactly on the midpoint counts as "first half complete".
//! Deliveries therefore strictly alternate, and each half is handed downstream at
//! most once per wrap.
//!
//! If the producer appends more than half a buffer between two polls it has
//! overwritten a half before the consumer could deliver it. That overrun is counted
//! and flagged on the next delivered block; it does not stop acquisition.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::buffer::{BufferPosition, CircularBuffer};
use crate::error::Result;
use crate::hardware::RawSample;
use crate::sink::{CalibrationTable, DownstreamSink, HalfBlock};

/// Identifies one half of the circular buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HalfBufferToken {
    /// Offsets `[0, capacity/2)`
    First,
    /// Offsets `[capacity/2, capacity)`
    Second,
}

impl HalfBufferToken {
    /// The opposite half.
    pub fn other(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }
}

/// Result of a single consumer poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Half delivered on this poll, if any
    pub delivered: Option<HalfBufferToken>,
    /// Producer advanced more than half a buffer since the previous poll
    pub overrun: bool,
    /// Snapshot the decision was based on
    pub position: BufferPosition,
}

/// Consumer-side counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerStats {
    /// Polls performed
    pub polls: u64,
    /// First halves delivered
    pub first_halves: u64,
    /// Second halves delivered
    pub second_halves: u64,
    /// Raw samples handed to the sink
    pub samples_delivered: u64,
    /// Polls on which an overrun was detected
    pub overrun_events: u64,
}

impl ConsumerStats {
    /// Total halves delivered.
    pub fn halves_delivered(&self) -> u64 {
        self.first_halves + self.second_halves
    }

    /// Whether any overrun has been observed.
    pub fn overrun_detected(&self) -> bool {
        self.overrun_events > 0
    }
}

/// Watches the circular buffer and delivers completed halves.
#[derive(Debug)]
pub struct AcquisitionConsumer {
    buffer: Arc<CircularBuffer>,
    calibration: Arc<CalibrationTable>,
    channel_count: usize,
    last_delivered: HalfBufferToken,
    last_total: u64,
    overrun_since_delivery: bool,
    stats: ConsumerStats,
    scratch: Vec<RawSample>,
}

impl AcquisitionConsumer {
    /// Create a consumer for `buffer` holding `channel_count` interleaved channels.
    /// The first detected transition delivers the first half.
    pub fn new(
        buffer: Arc<CircularBuffer>,
        channel_count: usize,
        calibration: Arc<CalibrationTable>,
    ) -> Self {
        let half_len = buffer.half_len();
        let last_total = buffer.snapshot_position().total_written;
        Self {
            channel_count: channel_count.max(1),
            buffer,
            calibration,
            last_delivered: HalfBufferToken::Second,
            last_total,
            overrun_since_delivery: false,
            stats: ConsumerStats::default(),
            scratch: Vec::with_capacity(half_len),
        }
    }

    /// Half delivered most recently (`Second` before the first delivery).
    pub fn last_delivered(&self) -> HalfBufferToken {
        self.last_delivered
    }

    /// Counters so far.
    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Whether an overrun has ever been detected.
    pub fn overrun_detected(&self) -> bool {
        self.stats.overrun_detected()
    }

    /// Check the write position and deliver a completed half to `sink`.
    pub fn poll<K: DownstreamSink + ?Sized>(&mut self, sink: &mut K) -> Result<PollOutcome> {
        let position = self.buffer.snapshot_position();
        self.stats.polls += 1;

        let advanced = position.total_written - self.last_total;
        self.last_total = position.total_written;
        let overrun = advanced > self.buffer.half_len() as u64;
        if overrun {
            self.stats.overrun_events += 1;
            self.overrun_since_delivery = true;
            warn!(
                advanced,
                half_len = self.buffer.half_len(),
                total_written = position.total_written,
                "Buffer overrun: producer lapped an undelivered half"
            );
        }

        let in_second_half = position.write_pos >= self.buffer.half_len();
        let ready = match (self.last_delivered, in_second_half) {
            (HalfBufferToken::Second, true) => Some(HalfBufferToken::First),
            (HalfBufferToken::First, false) => Some(HalfBufferToken::Second),
            _ => None,
        };

        if let Some(half) = ready {
            self.deliver(half, sink)?;
        }

        Ok(PollOutcome {
            delivered: ready,
            overrun,
            position,
        })
    }

    fn deliver<K: DownstreamSink + ?Sized>(
        &mut self,
        half: HalfBufferToken,
        sink: &mut K,
    ) -> Result<()> {
        self.buffer.copy_half_into(half, &mut self.scratch);

        let block = HalfBlock {
            half,
            sequence: self.stats.halves_delivered(),
            samples: &self.scratch,
            channel_count: self.channel_count,
            calibration: &self.calibration,
            overrun: self.overrun_since_delivery,
        };
        sink.consume(&block)?;

        match half {
            HalfBufferToken::First => self.stats.first_halves += 1,
            HalfBufferToken::Second => self.stats.second_halves += 1,
        }
        self.stats.samples_delivered += self.scratch.len() as u64;
        self.last_delivered = half;
        self.overrun_since_delivery = false;

        trace!(?half, sequence = block.sequence, "Delivered half");
        Ok(())
    }
}
