//! Session configuration using Figment.
//!
//! Configuration is layered:
//! 1. Built-in defaults (`StreamConfig::default()`)
//! 2. A TOML file (default `config/daq_stream.toml`)
//! 3. Environment variables prefixed with `DAQ_STREAM_`, nested with `__`
//!    (e.g. `DAQ_STREAM_SCAN__RATE=10000`)
//!
//! # Example
//! ```no_run
//! use daq_stream::config::StreamConfig;
//!
//! let config = StreamConfig::load()?;
//! config.validate()?;
//! println!("Buffer holds {} samples", config.scan.capacity());
//! # Ok::<(), daq_stream::StreamError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::hardware::{ScanParameters, TransferMode, VoltageRange};
use crate::logging::OutputFormat;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_stream.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_STREAM_";

/// Highest single-ended input channel on the supported devices.
pub const MAX_CHANNEL: u8 = 7;

/// Aggregate sample rate limit across all scanned channels (samples/s).
pub const MAX_AGGREGATE_RATE: u64 = 100_000;

/// Continuous scans move data in packets of this many samples; a buffer half
/// must hold a whole number of packets.
pub const SCAN_PACKET_SAMPLES: usize = 32;

/// Largest circular buffer a session may allocate, in raw samples (128 MiB).
pub const MAX_BUFFER_SAMPLES: usize = 1 << 26;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StreamConfig {
    /// Scan parameters sent to the device
    pub scan: ScanConfig,
    /// Producer thread tuning
    pub producer: ProducerConfig,
    /// Consumer loop tuning
    pub consumer: ConsumerConfig,
    /// Output sinks
    pub output: OutputConfig,
    /// Logging
    pub logging: LoggingConfig,
}

/// Scan parameters: `{low_channel, high_channel, rate, samples_per_half, voltage_range}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// First channel to scan
    pub low_channel: u8,
    /// Last channel to scan (inclusive)
    pub high_channel: u8,
    /// Per-channel sample rate in Hz
    pub rate: u32,
    /// Scans held in each half of the circular buffer
    pub samples_per_half: usize,
    /// Input range
    pub voltage_range: VoltageRange,
    /// USB transfer mode
    pub transfer_mode: TransferMode,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            low_channel: 0,
            high_channel: 1,
            rate: 22050,
            samples_per_half: 320,
            voltage_range: VoltageRange::Bip10V,
            transfer_mode: TransferMode::BlockIo,
        }
    }
}

impl ScanConfig {
    /// Channels in the scan list.
    pub fn channel_count(&self) -> usize {
        usize::from(self.high_channel.saturating_sub(self.low_channel)) + 1
    }

    /// Raw units in one half of the buffer. Saturates on overflow.
    pub fn half_len(&self) -> usize {
        self.samples_per_half.saturating_mul(self.channel_count())
    }

    /// Total buffer capacity in raw units (two halves). Saturates on overflow.
    pub fn capacity(&self) -> usize {
        self.half_len().saturating_mul(2)
    }

    /// Buffer capacity, or `None` if it does not fit in `usize`.
    pub fn checked_capacity(&self) -> Option<usize> {
        self.samples_per_half
            .checked_mul(self.channel_count())?
            .checked_mul(2)
    }

    /// Parameters handed to the hardware source.
    pub fn scan_parameters(&self) -> ScanParameters {
        ScanParameters {
            low_channel: self.low_channel,
            high_channel: self.high_channel,
            rate: self.rate,
            voltage_range: self.voltage_range,
            transfer_mode: self.transfer_mode,
        }
    }
}

/// Producer thread tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Pause between transfer requests
    #[serde(with = "humantime_serde")]
    pub poll_delay: Duration,
    /// Upper bound on one transfer request
    #[serde(with = "humantime_serde")]
    pub transfer_timeout: Duration,
    /// Raw units requested per transfer
    pub transfer_units: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            poll_delay: Duration::from_millis(1),
            transfer_timeout: Duration::from_secs(2),
            transfer_units: 256,
        }
    }
}

/// Consumer loop tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Longest the consumer waits for producer progress before re-checking
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// Output sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// CSV file receiving every delivered half as scaled voltages
    pub csv_path: Option<PathBuf>,
    /// Scans of each half echoed to the log (0 disables the console sink)
    pub console_preview: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            csv_path: None,
            console_preview: 10,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

impl StreamConfig {
    /// Load configuration from the default path and environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(StreamConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<()> {
        let scan = &self.scan;

        if scan.high_channel < scan.low_channel {
            return Err(config_error(format!(
                "high_channel {} is below low_channel {}",
                scan.high_channel, scan.low_channel
            )));
        }
        if scan.high_channel > MAX_CHANNEL {
            return Err(config_error(format!(
                "high_channel {} exceeds the device maximum of {}",
                scan.high_channel, MAX_CHANNEL
            )));
        }
        if scan.rate == 0 {
            return Err(config_error("rate must be greater than 0"));
        }
        let aggregate = u64::from(scan.rate) * scan.channel_count() as u64;
        if aggregate > MAX_AGGREGATE_RATE {
            return Err(config_error(format!(
                "aggregate rate {aggregate} S/s exceeds {MAX_AGGREGATE_RATE} S/s"
            )));
        }
        if scan.samples_per_half == 0 {
            return Err(config_error("samples_per_half must be greater than 0"));
        }
        match scan.checked_capacity() {
            None => {
                return Err(config_error(format!(
                    "samples_per_half {} overflows the buffer size",
                    scan.samples_per_half
                )))
            }
            Some(capacity) if capacity > MAX_BUFFER_SAMPLES => {
                return Err(config_error(format!(
                    "buffer of {capacity} samples exceeds the maximum of {MAX_BUFFER_SAMPLES}"
                )))
            }
            Some(_) => {}
        }
        if scan.half_len() % SCAN_PACKET_SAMPLES != 0 {
            return Err(config_error(format!(
                "samples_per_half × channels ({}) must be a multiple of {} for a continuous scan",
                scan.half_len(),
                SCAN_PACKET_SAMPLES
            )));
        }

        let producer = &self.producer;
        if producer.transfer_units == 0 || producer.transfer_units > scan.half_len() {
            return Err(config_error(format!(
                "transfer_units {} must be between 1 and half the buffer ({})",
                producer.transfer_units,
                scan.half_len()
            )));
        }
        if producer.transfer_timeout.is_zero() {
            return Err(config_error("transfer_timeout must be non-zero"));
        }
        if self.consumer.poll_interval.is_zero() {
            return Err(config_error("consumer poll_interval must be non-zero"));
        }

        crate::logging::parse_log_level(&self.logging.level).map_err(config_error)?;

        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> StreamError {
    StreamError::Configuration(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan.channel_count(), 2);
        assert_eq!(config.scan.half_len(), 640);
        assert_eq!(config.scan.capacity(), 1280);
    }

    #[test]
    fn test_capacity_matches_end_to_end_geometry() {
        let scan = ScanConfig {
            samples_per_half: 80,
            ..ScanConfig::default()
        };
        assert_eq!(scan.capacity(), 320);
    }

    #[test]
    fn test_config_validation() {
        let mut config = StreamConfig::default();
        config.scan.low_channel = 3;
        config.scan.high_channel = 2;
        assert!(matches!(config.validate(), Err(StreamError::Configuration(_))));

        let mut config = StreamConfig::default();
        config.scan.high_channel = 8;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.scan.rate = 60_000;
        assert!(config.validate().is_err(), "2 × 60 kS/s is over the aggregate limit");

        let mut config = StreamConfig::default();
        config.scan.samples_per_half = 15;
        assert!(config.validate().is_err(), "30 samples is not a whole packet");

        let mut config = StreamConfig::default();
        config.producer.transfer_units = 641;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.producer.transfer_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overflowing_buffer_size_rejected() {
        let mut config = StreamConfig::default();
        config.scan.samples_per_half = usize::MAX / 2 + 1;
        assert_eq!(config.scan.checked_capacity(), None);
        assert_eq!(config.scan.capacity(), usize::MAX);

        let err = config.validate().unwrap_err();
        assert!(matches!(err, StreamError::Configuration(ref m) if m.contains("overflows")));
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let mut config = StreamConfig::default();
        // 2 channels × 2 halves × 2^25 scans = 2^27 samples
        config.scan.samples_per_half = 1 << 25;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, StreamError::Configuration(ref m) if m.contains("maximum")));

        // Exactly at the limit is allowed
        config.scan.samples_per_half = 1 << 24;
        assert_eq!(config.scan.checked_capacity(), Some(MAX_BUFFER_SAMPLES));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scan_parameters() {
        let scan = ScanConfig {
            low_channel: 1,
            high_channel: 3,
            voltage_range: VoltageRange::Bip2V,
            ..ScanConfig::default()
        };
        let params = scan.scan_parameters();
        assert_eq!(params.channel_count(), 3);
        assert_eq!(params.voltage_range, VoltageRange::Bip2V);
        assert_eq!(params.rate, 22050);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = StreamConfig::default();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("poll_delay = \"1ms\""));
        let parsed: StreamConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
