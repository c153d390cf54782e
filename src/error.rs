//! Error types for streaming acquisition.
//!
//! The taxonomy follows the lifecycle of a session:
//!
//! - **`DeviceError`**: raised by a [`HardwareSource`](crate::hardware::HardwareSource)
//!   for genuine I/O failure. A plain transfer timeout is *not* a `DeviceError`; it is
//!   reported through [`Transfer::timed_out`](crate::hardware::Transfer). A device
//!   error is fatal to the producer and tears the session down.
//! - **`CalibrationError`**: a calibration constant could not be read or parsed.
//! - **`StreamError`**: the crate-wide error. `Configuration` covers everything that
//!   fails `start_session` before the producer thread exists; `Device` carries a
//!   producer fault up to the caller; `Sink` is an I/O failure while handing a
//!   delivered half downstream.
//!
//! Buffer overrun is deliberately absent: it is an observable condition on
//! [`ConsumerStats`](crate::consumer::ConsumerStats), not an error.

use thiserror::Error;

/// Result type alias for streaming operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors reported by a hardware source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Bulk transfer failed for a reason other than timeout
    #[error("Transfer failed after {transferred} units: {message}")]
    Transfer { message: String, transferred: usize },

    /// Device disappeared from the bus
    #[error("Device disconnected")]
    Disconnected,

    /// Device refused a protocol command
    #[error("Device rejected '{command}': {response}")]
    Rejected { command: String, response: String },

    /// Operation requires a configured scan
    #[error("Scan not configured")]
    NotConfigured,

    /// The producer thread panicked while driving the device
    #[error("Producer thread panicked")]
    ProducerPanicked,
}

/// Errors raised while retrieving calibration constants.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    /// The device answered with something that is not `<query>=<value>`
    #[error("Malformed calibration response for channel {channel}: '{response}'")]
    MalformedResponse { channel: u8, response: String },

    /// The query itself failed at the device level
    #[error("Calibration query for channel {channel} failed: {source}")]
    Query {
        channel: u8,
        #[source]
        source: DeviceError,
    },

    /// Constant parsed but is not usable for scaling
    #[error("Channel {channel} calibration {name} is not finite: {value}")]
    NotFinite {
        channel: u8,
        name: &'static str,
        value: f32,
    },
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Fatal device fault, usually surfaced from the producer thread
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Session setup failed (bad parameters or device protocol rejection)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Calibration constants unavailable
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// Downstream sink failed to accept a delivered half
    #[error("Sink error: {0}")]
    Sink(String),

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file or environment could not be extracted
    #[error("Configuration load error: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// Operation on a session that has already been torn down
    #[error("Session already stopped")]
    SessionStopped,
}

impl StreamError {
    /// Whether the error was raised before any acquisition thread started.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            StreamError::Configuration(_) | StreamError::Calibration(_) | StreamError::Figment(_)
        )
    }
}

impl From<figment::Error> for StreamError {
    fn from(err: figment::Error) -> Self {
        StreamError::Figment(Box::new(err))
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for StreamError {
    fn from(err: csv::Error) -> Self {
        StreamError::Sink(err.to_string())
    }
}
