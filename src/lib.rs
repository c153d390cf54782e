//! # DAQ Stream Core Library
//!
//! Continuous, double-buffered analog input streaming. A background producer thread
//! pulls raw samples from a hardware source into a fixed-capacity circular buffer;
//! a foreground consumer hands each half of the buffer downstream as soon as the
//! producer has finished writing it, without ever stopping acquisition.
//!
//! ## Crate Structure
//!
//! - **`buffer`**: `CircularBuffer`, the two-half sample store shared by both sides.
//! - **`producer`**: `AcquisitionProducer`, the thread that drives the hardware source.
//! - **`consumer`**: `AcquisitionConsumer`, half-completion detection, alternation and
//!   overrun detection.
//! - **`controller`**: `AcquisitionController` and `Session`, the start/stop protocol
//!   and its failure handling.
//! - **`hardware`**: the `HardwareSource` and `CalibrationProvider` traits, the ASCII
//!   command protocol, and a simulated device.
//! - **`sink`**: `DownstreamSink`, calibration scaling, console and CSV sinks.
//! - **`signal`**: stop token and producer progress notification.
//! - **`config`**: layered configuration (defaults, TOML, environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: `StreamError` and the device/calibration error types.
//!
//! ## Example
//!
//! ```no_run
//! use daq_stream::config::StreamConfig;
//! use daq_stream::controller::AcquisitionController;
//! use daq_stream::hardware::mock::MockScanDevice;
//! use daq_stream::signal::StopSignal;
//! use daq_stream::sink::ConsoleSink;
//!
//! let controller = AcquisitionController::new(StreamConfig::default());
//! let mut session = controller.start_session(MockScanDevice::new())?;
//!
//! let stop = StopSignal::new();
//! let mut sink = ConsoleSink::stdout(10);
//! session.run(&mut sink, &stop)?;
//!
//! let summary = controller.stop_session(session);
//! println!("{} halves delivered", summary.consumer.halves_delivered());
//! # Ok::<(), daq_stream::StreamError>(())
//! ```

pub mod buffer;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod producer;
pub mod signal;
pub mod sink;

pub use buffer::{BufferPosition, CircularBuffer};
pub use config::StreamConfig;
pub use consumer::{AcquisitionConsumer, ConsumerStats, HalfBufferToken, PollOutcome};
pub use controller::{AcquisitionController, Session, SessionSummary};
pub use error::{CalibrationError, DeviceError, Result, StreamError};
pub use producer::{AcquisitionProducer, ProducerState, ProducerStats};
pub use signal::{ProgressSignal, StopSignal};
pub use sink::{CalibrationTable, DownstreamSink, HalfBlock};
