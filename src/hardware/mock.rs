//! Simulated scan device.
//!
//! `MockScanDevice` speaks the same command protocol as the real hardware and
//! produces interleaved multi-channel sine waves with a little seeded noise. In
//! [`Pacing::Realtime`] mode samples become available at the configured rate and a
//! transfer that cannot be filled before its timeout returns whatever has arrived,
//! flagged as timed out - the same behaviour a USB bulk endpoint shows.
//!
//! # Example
//!
//! ```
//! use daq_stream::hardware::mock::{MockScanDevice, Pacing};
//!
//! let device = MockScanDevice::new()
//!     .with_pacing(Pacing::Instant)
//!     .with_seed(7)
//!     .fail_after_transfers(100);
//! assert!(device.commands().is_empty());
//! ```

use std::f64::consts::TAU;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::error::DeviceError;
use crate::error::CalibrationError;
use crate::hardware::protocol::{self, MessageCalibration, MessageTransport, ScanCommand};
use crate::hardware::{
    CalibrationProvider, ChannelCalibration, HardwareSource, RawSample, ScanParameters, Transfer,
    TransferMode,
};

/// Mid-scale converter code (0 V on a bipolar range).
const MID_SCALE: f64 = 32768.0;

/// How the simulated device releases samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// Every transfer is filled immediately
    #[default]
    Instant,
    /// Samples accrue at `rate × channels` per second after `AISCAN:START`
    Realtime,
}

/// Simulated analog input device.
#[derive(Debug)]
pub struct MockScanDevice {
    pacing: Pacing,
    params: Option<ScanParameters>,
    scanning: bool,
    started_at: Option<Instant>,
    /// Raw units handed out since the scan started
    produced: u64,
    transfers: u64,
    fail_after: Option<u64>,
    disconnect_after: Option<u64>,
    disconnected: bool,
    reject_prefix: Option<String>,
    calibration: ChannelCalibration,
    amplitude: f64,
    base_frequency: f64,
    noise: u16,
    rng: StdRng,
    commands: Vec<String>,
}

impl Default for MockScanDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScanDevice {
    /// Create a device with instant pacing and identity calibration.
    pub fn new() -> Self {
        Self {
            pacing: Pacing::Instant,
            params: None,
            scanning: false,
            started_at: None,
            produced: 0,
            transfers: 0,
            fail_after: None,
            disconnect_after: None,
            disconnected: false,
            reject_prefix: None,
            calibration: ChannelCalibration::IDENTITY,
            amplitude: 20_000.0,
            base_frequency: 50.0,
            noise: 8,
            rng: StdRng::seed_from_u64(0),
            commands: Vec::new(),
        }
    }

    /// Select the pacing mode.
    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Seed the noise generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Calibration constants reported for every channel.
    pub fn with_calibration(mut self, calibration: ChannelCalibration) -> Self {
        self.calibration = calibration;
        self
    }

    /// Peak noise in converter codes (0 disables noise).
    pub fn with_noise(mut self, codes: u16) -> Self {
        self.noise = codes;
        self
    }

    /// Fail every transfer after the first `n` with a pipe error.
    pub fn fail_after_transfers(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Drop off the bus after the first `n` transfers. Every later transfer and
    /// command fails with [`DeviceError::Disconnected`].
    pub fn disconnect_after_transfers(mut self, n: u64) -> Self {
        self.disconnect_after = Some(n);
        self
    }

    /// Answer any command starting with `prefix` with an error response.
    pub fn reject_commands(mut self, prefix: impl Into<String>) -> Self {
        self.reject_prefix = Some(prefix.into());
        self
    }

    /// Every message received so far, in order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Number of transfer requests served.
    pub fn transfer_count(&self) -> u64 {
        self.transfers
    }

    fn answer_query(&self, message: &str) -> String {
        let parsed = message
            .strip_prefix("?AI{")
            .and_then(|rest| rest.split_once("}:"));

        match parsed {
            Some((channel, "SLOPE")) => format!("AI{{{channel}}}:SLOPE={}", self.calibration.slope),
            Some((channel, "OFFSET")) => {
                format!("AI{{{channel}}}:OFFSET={}", self.calibration.offset)
            }
            _ => format!("ERR:{message}"),
        }
    }

    /// Units that could be delivered right now without waiting.
    fn available_units(&self, params: &ScanParameters) -> u64 {
        match (self.pacing, self.started_at) {
            (Pacing::Instant, _) => u64::MAX,
            (Pacing::Realtime, Some(start)) => {
                let per_second = f64::from(params.rate) * params.channel_count() as f64;
                let accrued = (start.elapsed().as_secs_f64() * per_second) as u64;
                accrued.saturating_sub(self.produced)
            }
            (Pacing::Realtime, None) => 0,
        }
    }

    /// Time until `units` more samples will have accrued.
    fn time_until(&self, params: &ScanParameters, units: u64) -> Duration {
        let per_second = f64::from(params.rate) * params.channel_count() as f64;
        Duration::from_secs_f64(units as f64 / per_second)
    }

    fn fill(&mut self, params: &ScanParameters, dest: &mut [RawSample]) {
        let n_channels = params.channel_count() as u64;
        let rate = f64::from(params.rate);

        for slot in dest.iter_mut() {
            let unit = self.produced;
            let channel = unit % n_channels;
            let scan = unit / n_channels;
            let t = scan as f64 / rate;
            let freq = self.base_frequency * (channel + 1) as f64;

            let noise = if self.noise == 0 {
                0.0
            } else {
                let peak = i32::from(self.noise);
                f64::from(self.rng.gen_range(-peak..=peak))
            };
            let value = MID_SCALE + self.amplitude * (TAU * freq * t).sin() + noise;
            *slot = value.clamp(0.0, f64::from(u16::MAX)) as RawSample;

            self.produced += 1;
        }
    }
}

impl MessageTransport for MockScanDevice {
    fn send_message(&mut self, message: &str) -> Result<String, DeviceError> {
        self.commands.push(message.to_string());
        if self.disconnected {
            return Err(DeviceError::Disconnected);
        }

        if let Some(prefix) = &self.reject_prefix {
            if message.starts_with(prefix.as_str()) {
                warn!(%message, "Simulated device rejecting command");
                return Ok(format!("ERR:{message}"));
            }
        }

        if message.starts_with('?') {
            Ok(self.answer_query(message))
        } else {
            Ok(message.to_string())
        }
    }
}

impl CalibrationProvider for MockScanDevice {
    fn channel_calibration(&mut self, channel: u8) -> Result<ChannelCalibration, CalibrationError> {
        MessageCalibration::new(self).channel_calibration(channel)
    }
}

impl HardwareSource for MockScanDevice {
    fn flush_input(&mut self) -> Result<(), DeviceError> {
        self.produced = 0;
        Ok(())
    }

    fn configure(&mut self, params: &ScanParameters) -> Result<(), DeviceError> {
        protocol::configure_scan(self, params)?;
        self.params = Some(*params);
        Ok(())
    }

    fn start_scan(&mut self) -> Result<(), DeviceError> {
        if self.params.is_none() {
            return Err(DeviceError::NotConfigured);
        }
        protocol::send_command(self, ScanCommand::Start)?;
        self.scanning = true;
        self.started_at = Some(Instant::now());
        self.produced = 0;
        debug!("Simulated scan started");
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), DeviceError> {
        protocol::send_command(self, ScanCommand::Stop)?;
        self.scanning = false;
        self.started_at = None;
        debug!(units = self.produced, "Simulated scan stopped");
        Ok(())
    }

    fn request_transfer(
        &mut self,
        dest: &mut [RawSample],
        timeout: Duration,
    ) -> Result<Transfer, DeviceError> {
        let params = match (self.scanning, self.params) {
            (true, Some(params)) => params,
            _ => return Err(DeviceError::NotConfigured),
        };

        if self.disconnect_after.is_some_and(|limit| self.transfers >= limit) {
            self.disconnected = true;
        }
        if self.disconnected {
            return Err(DeviceError::Disconnected);
        }
        if let Some(limit) = self.fail_after {
            if self.transfers >= limit {
                return Err(DeviceError::Transfer {
                    message: "LIBUSB_ERROR_PIPE".to_string(),
                    transferred: 0,
                });
            }
        }
        self.transfers += 1;

        let mut wanted = dest.len();
        if params.transfer_mode == TransferMode::SingleIo {
            wanted = wanted.min(params.channel_count());
        }

        let available = self.available_units(&params);
        let (units, timed_out) = if available >= wanted as u64 {
            (wanted, false)
        } else {
            let missing = wanted as u64 - available;
            let wait = self.time_until(&params, missing);
            if wait <= timeout {
                std::thread::sleep(wait);
                (wanted, false)
            } else {
                std::thread::sleep(timeout);
                let units = self.available_units(&params).min(wanted as u64) as usize;
                (units, true)
            }
        };

        self.fill(&params, &mut dest[..units]);
        trace!(units, timed_out, "Simulated transfer");

        Ok(Transfer { units, timed_out })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::protocol::MessageCalibration;
    use crate::hardware::{CalibrationProvider, VoltageRange};

    fn params() -> ScanParameters {
        ScanParameters {
            low_channel: 0,
            high_channel: 1,
            rate: 1000,
            voltage_range: VoltageRange::Bip10V,
            transfer_mode: TransferMode::BlockIo,
        }
    }

    #[test]
    fn test_configure_records_protocol() {
        let mut device = MockScanDevice::new();
        device.configure(&params()).unwrap();
        device.start_scan().unwrap();
        assert!(device.is_scanning());
        assert_eq!(device.commands().first().unwrap(), "AISCAN:XFRMODE=BLOCKIO");
        assert_eq!(device.commands().last().unwrap(), "AISCAN:START");
    }

    #[test]
    fn test_start_requires_configuration() {
        let mut device = MockScanDevice::new();
        assert_eq!(device.start_scan(), Err(DeviceError::NotConfigured));
    }

    #[test]
    fn test_rejected_configuration() {
        let mut device = MockScanDevice::new().reject_commands("AISCAN:RATE");
        let err = device.configure(&params()).unwrap_err();
        assert!(matches!(err, DeviceError::Rejected { .. }));
    }

    #[test]
    fn test_instant_transfer_fills_request() {
        let mut device = MockScanDevice::new().with_noise(0);
        device.configure(&params()).unwrap();
        device.start_scan().unwrap();

        let mut buf = [0u16; 64];
        let transfer = device
            .request_transfer(&mut buf, Duration::from_millis(10))
            .unwrap();
        assert_eq!(transfer, Transfer::complete(64));
        // t = 0 for the first scan, both channels sit at mid-scale
        assert_eq!(buf[0], 32768);
        assert_eq!(buf[1], 32768);
    }

    #[test]
    fn test_realtime_transfer_times_out_with_partial_data() {
        let mut device = MockScanDevice::new().with_pacing(Pacing::Realtime);
        device.configure(&params()).unwrap();
        device.start_scan().unwrap();

        // 2 channels at 1 kHz -> 2000 units/s; 10_000 units cannot arrive in 20 ms
        let mut buf = vec![0u16; 10_000];
        let transfer = device
            .request_transfer(&mut buf, Duration::from_millis(20))
            .unwrap();
        assert!(transfer.timed_out);
        assert!(transfer.units > 0);
        assert!(transfer.units < 10_000);
    }

    #[test]
    fn test_fault_injection() {
        let mut device = MockScanDevice::new().fail_after_transfers(1);
        device.configure(&params()).unwrap();
        device.start_scan().unwrap();

        let mut buf = [0u16; 8];
        assert!(device.request_transfer(&mut buf, Duration::ZERO).is_ok());
        let err = device
            .request_transfer(&mut buf, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Transfer { .. }));
        assert_eq!(device.transfer_count(), 1);
    }

    #[test]
    fn test_disconnect_fails_transfers_and_commands() {
        let mut device = MockScanDevice::new().disconnect_after_transfers(1);
        device.configure(&params()).unwrap();
        device.start_scan().unwrap();

        let mut buf = [0u16; 8];
        assert!(device.request_transfer(&mut buf, Duration::ZERO).is_ok());
        assert_eq!(
            device.request_transfer(&mut buf, Duration::ZERO),
            Err(DeviceError::Disconnected)
        );
        assert_eq!(device.stop_scan(), Err(DeviceError::Disconnected));
        assert!(device.is_scanning());
    }

    #[test]
    fn test_single_io_limits_transfer() {
        let mut device = MockScanDevice::new();
        let single = ScanParameters {
            transfer_mode: TransferMode::SingleIo,
            ..params()
        };
        device.configure(&single).unwrap();
        device.start_scan().unwrap();

        let mut buf = [0u16; 64];
        let transfer = device.request_transfer(&mut buf, Duration::ZERO).unwrap();
        assert_eq!(transfer.units, 2);
    }

    #[test]
    fn test_calibration_over_protocol() {
        let device = MockScanDevice::new().with_calibration(ChannelCalibration {
            slope: 1.5,
            offset: -3.0,
        });
        let mut provider = MessageCalibration::new(device);
        let cal = provider.channel_calibration(4).unwrap();
        assert_eq!(cal.slope, 1.5);
        assert_eq!(cal.offset, -3.0);
        assert_eq!(provider.into_inner().commands(), ["?AI{4}:SLOPE", "?AI{4}:OFFSET"]);
    }

    #[test]
    fn test_device_is_its_own_calibration_provider() {
        let mut device = MockScanDevice::new().with_calibration(ChannelCalibration {
            slope: 0.5,
            offset: 2.0,
        });
        let cal = device.channel_calibration(1).unwrap();
        assert_eq!(cal, ChannelCalibration { slope: 0.5, offset: 2.0 });
        assert_eq!(device.commands(), ["?AI{1}:SLOPE", "?AI{1}:OFFSET"]);
    }
}
