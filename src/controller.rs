//! Session lifecycle.
//!
//! [`AcquisitionController::start_session`] performs setup strictly in order and
//! fails before any thread exists if a step goes wrong:
//!
//! 1. validate the configuration
//! 2. allocate the circular buffer (`samples_per_half × channels × 2`)
//! 3. flush stale input and send the scan configuration
//! 4. read per-channel calibration into an immutable [`CalibrationTable`]
//! 5. start the scan, then the producer thread
//!
//! The returned [`Session`] drives the consumer. Each [`Session::poll`] waits for
//! producer progress (bounded by `consumer.poll_interval`), delivers at most one
//! half, then checks the producer for a fault. A fault or a sink failure tears the
//! session down before the error reaches the caller, so no producer thread
//! outlives a failed poll.
//!
//! Stopping requests a producer stop, blocks until the thread has acknowledged
//! `Stopped` and been joined, sends the device stop command, and only then lets
//! the buffer go.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::CircularBuffer;
use crate::config::StreamConfig;
use crate::consumer::{AcquisitionConsumer, ConsumerStats, PollOutcome};
use crate::error::{CalibrationError, DeviceError, Result, StreamError};
use crate::hardware::{CalibrationProvider, HardwareSource, ScanParameters};
use crate::producer::{AcquisitionProducer, ProducerState, ProducerStats};
use crate::signal::{ProgressSignal, StopSignal};
use crate::sink::{CalibrationTable, DownstreamSink};

/// Starts and stops acquisition sessions for one configuration.
#[derive(Debug, Clone)]
pub struct AcquisitionController {
    config: StreamConfig,
}

impl AcquisitionController {
    /// Create a controller. The configuration is validated on each session start.
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    /// Configuration used for new sessions.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Start a session on a source that also answers calibration queries.
    pub fn start_session<S>(&self, source: S) -> Result<Session<S>>
    where
        S: HardwareSource + CalibrationProvider + 'static,
    {
        self.start_session_with(source, |source, params| {
            CalibrationTable::read(params, source)
        })
    }

    /// Start a session, reading calibration with `read_calibration`.
    ///
    /// The closure runs after the scan is configured and before it starts, with
    /// exclusive access to the source. The table must cover every scanned channel.
    pub fn start_session_with<S, F>(
        &self,
        mut source: S,
        read_calibration: F,
    ) -> Result<Session<S>>
    where
        S: HardwareSource + 'static,
        F: FnOnce(
            &mut S,
            &ScanParameters,
        ) -> std::result::Result<CalibrationTable, CalibrationError>,
    {
        self.config.validate()?;
        let scan = &self.config.scan;
        let params = scan.scan_parameters();

        let buffer = Arc::new(CircularBuffer::new(scan.capacity())?);
        debug!(
            capacity = buffer.capacity(),
            half_len = buffer.half_len(),
            "Circular buffer allocated"
        );

        source
            .flush_input()
            .and_then(|()| source.configure(&params))
            .map_err(|e| setup_error("scan configuration", &e))?;

        let calibration = read_calibration(&mut source, &params)?;
        if calibration.channel_count() != params.channel_count() {
            return Err(StreamError::Configuration(format!(
                "calibration covers {} channels but the scan has {}",
                calibration.channel_count(),
                params.channel_count()
            )));
        }
        let calibration = Arc::new(calibration);

        source
            .start_scan()
            .map_err(|e| setup_error("scan start", &e))?;

        let progress = Arc::new(ProgressSignal::new());
        let mut producer = AcquisitionProducer::new(
            source,
            Arc::clone(&buffer),
            Arc::clone(&progress),
            self.config.producer.clone(),
        );
        if let Err(e) = producer.start() {
            if let Some(mut source) = producer.take_source() {
                if let Err(stop_err) = source.stop_scan() {
                    warn!(error = %stop_err, "Failed to stop scan after producer start failure");
                }
            }
            return Err(e);
        }

        let consumer = AcquisitionConsumer::new(
            Arc::clone(&buffer),
            params.channel_count(),
            Arc::clone(&calibration),
        );
        let session = Session {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            elapsed: None,
            poll_interval: self.config.consumer.poll_interval,
            buffer,
            progress,
            calibration,
            producer,
            consumer,
            seen_generation: 0,
            source: None,
            scan_stop_error: None,
            stopped: false,
        };

        info!(
            session = %session.id,
            channels = params.channel_count(),
            rate = params.rate,
            range = %params.voltage_range,
            capacity = session.buffer.capacity(),
            "Acquisition session started"
        );
        Ok(session)
    }

    /// Stop `session` and return its summary. Same as [`Session::stop`].
    pub fn stop_session<S: HardwareSource + 'static>(&self, session: Session<S>) -> SessionSummary {
        session.stop()
    }
}

fn setup_error(step: &str, err: &DeviceError) -> StreamError {
    error!(step, error = %err, "Session setup failed");
    StreamError::Configuration(format!("{step} failed: {err}"))
}

/// Final report of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    /// Session identifier
    pub id: Uuid,
    /// Wall-clock start time
    pub started_at: DateTime<Utc>,
    /// Time from start to producer shutdown
    pub elapsed: Duration,
    /// Producer counters
    pub producer: ProducerStats,
    /// Consumer counters
    pub consumer: ConsumerStats,
    /// Fault that ended the producer, if any
    pub fault: Option<DeviceError>,
    /// Failure of the device stop command, if any
    pub scan_stop_error: Option<DeviceError>,
}

impl SessionSummary {
    /// Mean raw-unit throughput over the session.
    pub fn units_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.producer.units_transferred as f64 / secs
        } else {
            0.0
        }
    }
}

/// A running acquisition.
///
/// Dropping a session that was not stopped stops it.
#[derive(Debug)]
pub struct Session<S: HardwareSource + 'static> {
    id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    elapsed: Option<Duration>,
    poll_interval: Duration,
    buffer: Arc<CircularBuffer>,
    progress: Arc<ProgressSignal>,
    calibration: Arc<CalibrationTable>,
    producer: AcquisitionProducer<S>,
    consumer: AcquisitionConsumer,
    seen_generation: u64,
    source: Option<S>,
    scan_stop_error: Option<DeviceError>,
    stopped: bool,
}

impl<S: HardwareSource + 'static> Session<S> {
    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wall-clock start time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Calibration read at session start.
    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }

    /// The shared buffer.
    pub fn buffer(&self) -> &CircularBuffer {
        &self.buffer
    }

    /// Producer lifecycle state.
    pub fn producer_state(&self) -> ProducerState {
        self.producer.state()
    }

    /// Producer counters so far.
    pub fn producer_stats(&self) -> ProducerStats {
        self.producer.stats()
    }

    /// Consumer counters so far.
    pub fn consumer_stats(&self) -> ConsumerStats {
        self.consumer.stats()
    }

    /// Whether the session has been torn down.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Surface a producer fault without polling. Tears the session down if one
    /// was recorded.
    pub fn check_health(&mut self) -> Result<()> {
        if self.stopped {
            return Err(StreamError::SessionStopped);
        }
        match self.producer.fault() {
            Some(fault) => {
                self.shutdown();
                Err(fault.into())
            }
            None => Ok(()),
        }
    }

    /// Wait for producer progress and deliver at most one half to `sink`.
    pub fn poll<K: DownstreamSink + ?Sized>(&mut self, sink: &mut K) -> Result<PollOutcome> {
        if self.stopped {
            return Err(StreamError::SessionStopped);
        }

        self.seen_generation = self
            .progress
            .wait_past(self.seen_generation, self.poll_interval);

        let outcome = match self.consumer.poll(sink) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Sink failed, stopping session");
                self.shutdown();
                return Err(e);
            }
        };

        self.check_health()?;
        Ok(outcome)
    }

    /// Poll until `stop` is triggered, then flush `sink`.
    ///
    /// On error the session has already been torn down; call [`stop`](Self::stop)
    /// for the summary.
    pub fn run<K: DownstreamSink + ?Sized>(
        &mut self,
        sink: &mut K,
        stop: &StopSignal,
    ) -> Result<()> {
        while !stop.is_triggered() {
            self.poll(sink)?;
        }
        debug!("Stop signal observed");
        sink.finish()
    }

    /// Stop the session and return its summary.
    ///
    /// Stopping always completes. A producer fault or a failed device stop
    /// command is reported in the summary.
    pub fn stop(self) -> SessionSummary {
        self.close().0
    }

    /// Stop the session and hand back the hardware source along with the summary.
    ///
    /// The source is `None` if the producer thread panicked.
    pub fn close(mut self) -> (SessionSummary, Option<S>) {
        self.shutdown();
        let summary = self.summary();
        info!(
            session = %summary.id,
            elapsed = ?summary.elapsed,
            units = summary.producer.units_transferred,
            halves = summary.consumer.halves_delivered(),
            overruns = summary.consumer.overrun_events,
            faulted = summary.fault.is_some(),
            "Acquisition session stopped"
        );
        (summary, self.source.take())
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            started_at: self.started_at,
            elapsed: self.elapsed.unwrap_or_else(|| self.started.elapsed()),
            producer: self.producer.stats(),
            consumer: self.consumer.stats(),
            fault: self.producer.fault(),
            scan_stop_error: self.scan_stop_error.clone(),
        }
    }

    /// Stop the producer, wait for it, then stop the scan. Idempotent.
    ///
    /// A failed stop command is logged and kept for the summary; it never
    /// replaces a producer fault.
    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Err(fault) = self.producer.stop() {
            debug!(error = %fault, "Producer ended with a fault");
        }
        self.elapsed = Some(self.started.elapsed());

        self.source = self.producer.take_source();
        match self.source.as_mut() {
            Some(source) => {
                if let Err(e) = source.stop_scan() {
                    error!(error = %e, "Failed to stop scan");
                    self.scan_stop_error = Some(e);
                }
            }
            None => warn!("Hardware source lost with the producer thread, scan not stopped"),
        }
    }
}

impl<S: HardwareSource + 'static> Drop for Session<S> {
    fn drop(&mut self) {
        if !self.stopped {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::hardware::mock::MockScanDevice;
    use crate::hardware::ChannelCalibration;
    use crate::sink::HalfBlock;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Counting {
        halves: usize,
        finished: bool,
    }

    impl DownstreamSink for Counting {
        fn consume(&mut self, _block: &HalfBlock<'_>) -> Result<()> {
            self.halves += 1;
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    fn test_config() -> StreamConfig {
        let mut config = StreamConfig::default();
        config.scan = ScanConfig {
            samples_per_half: 80,
            ..ScanConfig::default()
        };
        config.producer.poll_delay = Duration::from_millis(1);
        config.producer.transfer_units = 64;
        config.consumer.poll_interval = Duration::from_millis(2);
        config
    }

    #[test]
    fn test_invalid_config_fails_before_device_is_touched() {
        let mut config = test_config();
        config.scan.high_channel = 12;
        let controller = AcquisitionController::new(config);

        let err = controller.start_session(MockScanDevice::new()).unwrap_err();
        assert!(err.is_setup_failure());
    }

    #[test]
    fn test_rejected_command_is_configuration_error() {
        let controller = AcquisitionController::new(test_config());
        let device = MockScanDevice::new().reject_commands("AISCAN:RANGE");

        let err = controller.start_session(device).unwrap_err();
        assert!(matches!(err, StreamError::Configuration(ref m) if m.contains("RANGE")));
    }

    #[test]
    fn test_calibration_error_fails_start() {
        let controller = AcquisitionController::new(test_config());
        let err = controller
            .start_session_with(MockScanDevice::new(), |_source, _params| {
                Err(CalibrationError::MalformedResponse {
                    channel: 0,
                    response: "AI{0}:SLOPE".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, StreamError::Calibration(_)));
        assert!(err.is_setup_failure());
    }

    #[test]
    #[traced_test]
    fn test_session_start_and_stop() {
        let controller = AcquisitionController::new(test_config());
        let device = MockScanDevice::new().with_calibration(ChannelCalibration {
            slope: 1.0,
            offset: 0.0,
        });

        let mut session = controller.start_session(device).unwrap();
        assert_eq!(session.producer_state(), ProducerState::Running);
        assert_eq!(session.buffer().capacity(), 320);
        assert_eq!(session.calibration().channel_count(), 2);

        let mut sink = Counting::default();
        for _ in 0..50 {
            session.poll(&mut sink).unwrap();
        }
        assert!(sink.halves > 0);

        let (summary, source) = session.close();
        let device = source.unwrap();
        assert!(!device.is_scanning());
        assert_eq!(device.commands().last().unwrap(), "AISCAN:STOP");
        assert!(summary.fault.is_none());
        assert!(summary.scan_stop_error.is_none());
        assert!(summary.producer.units_transferred > 0);
        assert!(logs_contain("Acquisition session stopped"));
    }

    #[test]
    fn test_run_until_stop_signal() {
        let controller = AcquisitionController::new(test_config());
        let mut session = controller.start_session(MockScanDevice::new()).unwrap();
        let stop = StopSignal::new();

        let trigger = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                stop.trigger();
            })
        };

        let mut sink = Counting::default();
        session.run(&mut sink, &stop).unwrap();
        trigger.join().unwrap();
        assert!(sink.finished);

        let summary = controller.stop_session(session);
        assert_eq!(summary.consumer.halves_delivered() as usize, sink.halves);
    }

    #[test]
    fn test_producer_fault_stops_session() {
        let controller = AcquisitionController::new(test_config());
        let device = MockScanDevice::new().fail_after_transfers(3);
        let mut session = controller.start_session(device).unwrap();

        let mut sink = Counting::default();
        let err = loop {
            match session.poll(&mut sink) {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };

        assert!(matches!(err, StreamError::Device(DeviceError::Transfer { .. })));
        assert!(session.is_stopped());
        assert_eq!(session.producer_state(), ProducerState::Stopped);
        assert!(matches!(
            session.poll(&mut sink),
            Err(StreamError::SessionStopped)
        ));

        let summary = session.stop();
        assert!(summary.fault.is_some());
        assert_eq!(summary.producer.units_transferred, 3 * 64);
    }

    #[test]
    fn test_fault_survives_failed_stop_command() {
        let controller = AcquisitionController::new(test_config());
        let device = MockScanDevice::new().disconnect_after_transfers(2);
        let mut session = controller.start_session(device).unwrap();

        let mut sink = Counting::default();
        let err = loop {
            if let Err(e) = session.poll(&mut sink) {
                break e;
            }
        };

        // The stop command also fails on a vanished device; the transfer fault
        // is what reaches the caller
        assert!(matches!(err, StreamError::Device(DeviceError::Disconnected)));
        assert!(session.is_stopped());

        let (summary, source) = session.close();
        assert_eq!(summary.fault, Some(DeviceError::Disconnected));
        assert_eq!(summary.scan_stop_error, Some(DeviceError::Disconnected));
        assert_eq!(summary.producer.units_transferred, 2 * 64);

        let device = source.unwrap();
        assert_eq!(device.commands().last().unwrap(), "AISCAN:STOP");
        assert!(device.is_scanning());
    }

    #[test]
    fn test_calibration_must_cover_every_channel() {
        let controller = AcquisitionController::new(test_config());
        let err = controller
            .start_session_with(MockScanDevice::new(), |_source, params| {
                Ok(CalibrationTable::new(
                    params.low_channel,
                    params.voltage_range,
                    vec![ChannelCalibration::IDENTITY],
                ))
            })
            .unwrap_err();

        assert!(
            matches!(err, StreamError::Configuration(ref m) if m.contains("covers 1 channels but the scan has 2"))
        );
    }

    #[test]
    fn test_sink_error_stops_producer() {
        struct Failing;
        impl DownstreamSink for Failing {
            fn consume(&mut self, _block: &HalfBlock<'_>) -> Result<()> {
                Err(StreamError::Sink("disk full".into()))
            }
        }

        let controller = AcquisitionController::new(test_config());
        let mut session = controller.start_session(MockScanDevice::new()).unwrap();
        let err = session.run(&mut Failing, &StopSignal::new()).unwrap_err();

        assert!(matches!(err, StreamError::Sink(_)));
        assert_eq!(session.producer_state(), ProducerState::Stopped);
    }

    #[test]
    fn test_drop_stops_producer() {
        let controller = AcquisitionController::new(test_config());
        let session = controller.start_session(MockScanDevice::new()).unwrap();
        assert_eq!(session.producer_state(), ProducerState::Running);
        drop(session);
    }
}
