//! Downstream sinks for delivered buffer halves.
//!
//! A [`DownstreamSink`] is called synchronously from the consumer loop, once per
//! delivered half, with a borrowed [`HalfBlock`]. The block carries raw samples
//! interleaved by scan (`[scan0_ch0, scan0_ch1, ..., scan1_ch0, ...]`) together
//! with the session's [`CalibrationTable`], so sinks decide for themselves whether
//! to scale.
//!
//! Scaling follows the converter's linear model: the raw code is corrected with
//! the channel's slope and offset, clamped to the code range, and mapped onto the
//! configured voltage range.

use std::io::Write;

use tracing::{debug, info};

use crate::consumer::HalfBufferToken;
use crate::error::{CalibrationError, Result};
use crate::hardware::{
    CalibrationProvider, ChannelCalibration, RawSample, ScanParameters, VoltageRange,
};

/// Per-channel calibration built once at session start.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    low_channel: u8,
    voltage_range: VoltageRange,
    channels: Vec<ChannelCalibration>,
}

impl CalibrationTable {
    /// Build a table from explicit constants; `channels[i]` belongs to channel
    /// `low_channel + i`.
    pub fn new(
        low_channel: u8,
        voltage_range: VoltageRange,
        channels: Vec<ChannelCalibration>,
    ) -> Self {
        Self {
            low_channel,
            voltage_range,
            channels,
        }
    }

    /// Identity calibration for every channel in `params`.
    pub fn identity(params: &ScanParameters) -> Self {
        Self::new(
            params.low_channel,
            params.voltage_range,
            vec![ChannelCalibration::IDENTITY; params.channel_count()],
        )
    }

    /// Query `provider` for every channel in the scan list.
    pub fn read<P: CalibrationProvider + ?Sized>(
        params: &ScanParameters,
        provider: &mut P,
    ) -> std::result::Result<Self, CalibrationError> {
        let channels = params
            .channels()
            .map(|channel| provider.channel_calibration(channel))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for (channel, cal) in params.channels().zip(&channels) {
            info!(
                channel,
                slope = cal.slope,
                offset = cal.offset,
                "Channel calibration"
            );
        }

        Ok(Self::new(params.low_channel, params.voltage_range, channels))
    }

    /// Number of channels covered.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Device channel number at scan position `index`.
    pub fn channel_number(&self, index: usize) -> u8 {
        u8::try_from(index)
            .map(|index| self.low_channel.saturating_add(index))
            .unwrap_or(u8::MAX)
    }

    /// Input range the constants are valid for.
    pub fn voltage_range(&self) -> VoltageRange {
        self.voltage_range
    }

    /// Constants for scan position `index`.
    pub fn get(&self, index: usize) -> Option<&ChannelCalibration> {
        self.channels.get(index)
    }

    /// Scale a raw sample at scan position `index` to volts.
    ///
    /// Positions outside the table are scaled without correction.
    pub fn scale(&self, index: usize, raw: RawSample) -> f64 {
        let cal = self.get(index).copied().unwrap_or_default();
        self.voltage_range.code_to_volts(cal.correct(raw))
    }
}

/// One delivered half of the circular buffer.
#[derive(Debug, Clone, Copy)]
pub struct HalfBlock<'a> {
    /// Which half this is
    pub half: HalfBufferToken,
    /// Delivery counter, starting at 0
    pub sequence: u64,
    /// Raw samples, interleaved by scan
    pub samples: &'a [RawSample],
    /// Channels per scan
    pub channel_count: usize,
    /// Session calibration
    pub calibration: &'a CalibrationTable,
    /// An overrun was detected since the previous delivery
    pub overrun: bool,
}

impl<'a> HalfBlock<'a> {
    /// Number of complete scans in the block.
    pub fn n_scans(&self) -> usize {
        if self.channel_count > 0 {
            self.samples.len() / self.channel_count
        } else {
            0
        }
    }

    /// Iterate over complete scans.
    pub fn scans(&self) -> impl Iterator<Item = &'a [RawSample]> + 'a {
        self.samples.chunks_exact(self.channel_count.max(1))
    }

    /// Scale one scan to volts.
    pub fn scaled_scan(&self, scan: &[RawSample]) -> Vec<f64> {
        scan.iter()
            .enumerate()
            .map(|(i, &raw)| self.calibration.scale(i, raw))
            .collect()
    }

    /// Raw samples of a single scan position.
    pub fn channel_data(&self, index: usize) -> Vec<RawSample> {
        if index >= self.channel_count {
            return Vec::new();
        }
        self.scans().map(|scan| scan[index]).collect()
    }
}

/// Receiver of delivered halves.
pub trait DownstreamSink {
    /// Handle one delivered half.
    fn consume(&mut self, block: &HalfBlock<'_>) -> Result<()>;

    /// Flush buffered output at the end of a session.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: DownstreamSink + ?Sized> DownstreamSink for Box<S> {
    fn consume(&mut self, block: &HalfBlock<'_>) -> Result<()> {
        (**self).consume(block)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Forwards every half to several sinks in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn DownstreamSink + Send>>,
}

impl FanoutSink {
    /// Create an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn push(&mut self, sink: Box<dyn DownstreamSink + Send>) {
        self.sinks.push(sink);
    }

    /// Number of attached sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sinks are attached.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl DownstreamSink for FanoutSink {
    fn consume(&mut self, block: &HalfBlock<'_>) -> Result<()> {
        for sink in &mut self.sinks {
            sink.consume(block)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.finish()?;
        }
        Ok(())
    }
}

/// Prints a short preview of each delivered half.
#[derive(Debug)]
pub struct ConsoleSink<W> {
    out: W,
    preview_scans: usize,
}

impl ConsoleSink<std::io::Stdout> {
    /// Console sink on standard output.
    pub fn stdout(preview_scans: usize) -> Self {
        Self::new(std::io::stdout(), preview_scans)
    }
}

impl<W: Write> ConsoleSink<W> {
    /// Console sink on an arbitrary writer.
    pub fn new(out: W, preview_scans: usize) -> Self {
        Self { out, preview_scans }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> DownstreamSink for ConsoleSink<W> {
    fn consume(&mut self, block: &HalfBlock<'_>) -> Result<()> {
        let shown = block.n_scans().min(self.preview_scans);
        writeln!(
            self.out,
            "Data ({} scans, {:?} half, displaying first {}){}:",
            block.n_scans(),
            block.half,
            shown,
            if block.overrun { " [overrun]" } else { "" }
        )?;

        for scan in block.scans().take(shown) {
            let row = block
                .scaled_scan(scan)
                .iter()
                .map(|v| format!("{v:.4}"))
                .collect::<Vec<_>>()
                .join(",");
            writeln!(self.out, "{row}")?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Writes every scan of every delivered half as a row of scaled voltages.
#[cfg(feature = "storage_csv")]
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    header_written: bool,
    rows: u64,
}

#[cfg(feature = "storage_csv")]
impl CsvSink<std::fs::File> {
    /// Create (or truncate) a CSV file at `path`.
    pub fn create<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::create(path.as_ref())?;
        info!(path = %path.as_ref().display(), "CSV sink created");
        Ok(Self::new(file))
    }
}

#[cfg(feature = "storage_csv")]
impl<W: Write> CsvSink<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
            header_written: false,
            rows: 0,
        }
    }

    /// Data rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flush and recover the writer.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| crate::error::StreamError::Sink(e.to_string()))
    }
}

#[cfg(feature = "storage_csv")]
impl<W: Write> DownstreamSink for CsvSink<W> {
    fn consume(&mut self, block: &HalfBlock<'_>) -> Result<()> {
        if !self.header_written {
            let header = (0..block.channel_count)
                .map(|i| format!("ch{}", block.calibration.channel_number(i)));
            self.writer.write_record(header)?;
            self.header_written = true;
        }

        for scan in block.scans() {
            let row = block.scaled_scan(scan).into_iter().map(|v| format!("{v:.6}"));
            self.writer.write_record(row)?;
            self.rows += 1;
        }
        debug!(rows = self.rows, sequence = block.sequence, "CSV rows written");
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
