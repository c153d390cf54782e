//! Hardware-facing interfaces for the acquisition pipeline.
//!
//! The pipeline never talks to USB directly. It drives two traits:
//!
//! - [`HardwareSource`] - configures a scan and hands out bulk transfers of raw
//!   16-bit samples.
//! - [`CalibrationProvider`] - per-channel slope/offset pairs, read once per session.
//!
//! [`protocol`] contains the ASCII command vocabulary spoken by the supported
//! devices and a calibration provider built on top of it. [`mock`] provides a
//! simulated device for tests and for running the CLI without hardware.

pub mod mock;
pub mod protocol;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, DeviceError};

/// Raw sample unit produced by the converter.
pub type RawSample = u16;

/// Full-scale code count of the 16-bit converter.
pub const ADC_CODES: u32 = 1 << 16;

/// Analog input voltage range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VoltageRange {
    /// ±10 V
    #[default]
    #[serde(rename = "BIP10V")]
    Bip10V,
    /// ±5 V
    #[serde(rename = "BIP5V")]
    Bip5V,
    /// ±2 V
    #[serde(rename = "BIP2V")]
    Bip2V,
    /// ±1 V
    #[serde(rename = "BIP1V")]
    Bip1V,
}

impl VoltageRange {
    /// Protocol token for this range.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bip10V => "BIP10V",
            Self::Bip5V => "BIP5V",
            Self::Bip2V => "BIP2V",
            Self::Bip1V => "BIP1V",
        }
    }

    /// Lowest representable voltage.
    pub fn min_volts(self) -> f64 {
        -self.max_volts()
    }

    /// Highest representable voltage.
    pub fn max_volts(self) -> f64 {
        match self {
            Self::Bip10V => 10.0,
            Self::Bip5V => 5.0,
            Self::Bip2V => 2.0,
            Self::Bip1V => 1.0,
        }
    }

    /// Map a (calibrated) converter code onto this range.
    pub fn code_to_volts(self, code: f64) -> f64 {
        let span = self.max_volts() - self.min_volts();
        code * span / f64::from(ADC_CODES) + self.min_volts()
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the device moves scan data to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferMode {
    /// Packet transfers, suited to fast acquisitions
    #[default]
    #[serde(rename = "BLOCKIO")]
    BlockIo,
    /// One sample per transfer, suited to slow acquisitions
    #[serde(rename = "SINGLEIO")]
    SingleIo,
}

impl TransferMode {
    /// Protocol token for this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlockIo => "BLOCKIO",
            Self::SingleIo => "SINGLEIO",
        }
    }
}

/// Parameters a [`HardwareSource`] needs to arm a continuous scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParameters {
    /// First channel in the scan list
    pub low_channel: u8,
    /// Last channel in the scan list (inclusive)
    pub high_channel: u8,
    /// Per-channel sample rate in Hz
    pub rate: u32,
    /// Input range
    pub voltage_range: VoltageRange,
    /// Transfer mode
    pub transfer_mode: TransferMode,
}

impl ScanParameters {
    /// Number of channels in the scan list.
    pub fn channel_count(&self) -> usize {
        usize::from(self.high_channel.saturating_sub(self.low_channel)) + 1
    }

    /// Channel numbers in scan order.
    pub fn channels(&self) -> impl Iterator<Item = u8> {
        self.low_channel..=self.high_channel
    }
}

/// Outcome of one bulk transfer request.
///
/// `timed_out` mirrors the USB timeout status. A timed-out transfer may still have
/// delivered data; callers treat it as success either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transfer {
    /// Raw units written into the destination slice
    pub units: usize,
    /// Whether the request ended on its timeout
    pub timed_out: bool,
}

impl Transfer {
    /// A transfer that filled `units` before completing normally.
    pub fn complete(units: usize) -> Self {
        Self {
            units,
            timed_out: false,
        }
    }

    /// A transfer that ran into its timeout after delivering `units`.
    pub fn timed_out(units: usize) -> Self {
        Self {
            units,
            timed_out: true,
        }
    }
}

/// A device that streams raw analog input samples.
///
/// Implementations are moved into the producer thread for the duration of a
/// session and handed back to the controller when it stops, so they only need to
/// be `Send`.
pub trait HardwareSource: Send {
    /// Discard stale data queued on the input endpoint.
    fn flush_input(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Program the scan list, rate, range and transfer mode.
    fn configure(&mut self, params: &ScanParameters) -> Result<(), DeviceError>;

    /// Start the configured scan.
    fn start_scan(&mut self) -> Result<(), DeviceError>;

    /// Stop a running scan.
    fn stop_scan(&mut self) -> Result<(), DeviceError>;

    /// Read up to `dest.len()` raw units, waiting at most `timeout`.
    ///
    /// A timeout is reported through [`Transfer::timed_out`], never as an error.
    fn request_transfer(
        &mut self,
        dest: &mut [RawSample],
        timeout: Duration,
    ) -> Result<Transfer, DeviceError>;
}

/// Slope and offset for one channel, valid for the currently selected range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelCalibration {
    /// Gain correction
    pub slope: f32,
    /// Offset correction in converter codes
    pub offset: f32,
}

impl ChannelCalibration {
    /// Identity calibration (no correction).
    pub const IDENTITY: Self = Self {
        slope: 1.0,
        offset: 0.0,
    };

    /// Apply the correction and clamp to the converter's code range.
    pub fn correct(&self, raw: RawSample) -> f64 {
        let corrected = f64::from(self.slope) * f64::from(raw) + f64::from(self.offset);
        corrected.clamp(0.0, f64::from(ADC_CODES - 1))
    }
}

impl Default for ChannelCalibration {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Source of per-channel calibration constants.
pub trait CalibrationProvider {
    /// Read the calibration for `channel`.
    fn channel_calibration(&mut self, channel: u8) -> Result<ChannelCalibration, CalibrationError>;
}

/// Calibration provider that returns the same constants for every channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedCalibration(pub ChannelCalibration);

impl CalibrationProvider for FixedCalibration {
    fn channel_calibration(&mut self, _channel: u8) -> Result<ChannelCalibration, CalibrationError> {
        Ok(self.0)
    }
}
