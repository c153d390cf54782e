//! Integration tests for the start/stop protocol and fault propagation.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use daq_stream::config::{ScanConfig, StreamConfig};
use daq_stream::controller::AcquisitionController;
use daq_stream::hardware::mock::{MockScanDevice, Pacing};
use daq_stream::hardware::{HardwareSource, ScanParameters};
use daq_stream::signal::{ProgressSignal, StopSignal};
use daq_stream::sink::{CalibrationTable, DownstreamSink, HalfBlock};
use daq_stream::{
    AcquisitionProducer, CircularBuffer, DeviceError, ProducerState, Result, StreamError,
};

struct Discard;

impl DownstreamSink for Discard {
    fn consume(&mut self, _block: &HalfBlock<'_>) -> Result<()> {
        Ok(())
    }
}

fn config() -> StreamConfig {
    let mut config = StreamConfig::default();
    config.scan = ScanConfig {
        samples_per_half: 80,
        ..ScanConfig::default()
    };
    config.producer.transfer_units = 64;
    config.producer.poll_delay = Duration::from_millis(1);
    config.consumer.poll_interval = Duration::from_millis(2);
    config
}

#[test]
fn test_device_sees_full_command_sequence() {
    let controller = AcquisitionController::new(config());
    let session = controller.start_session(MockScanDevice::new()).unwrap();
    let (_summary, device) = session.close();

    let device = device.unwrap();
    assert_eq!(
        device.commands(),
        [
            "AISCAN:XFRMODE=BLOCKIO",
            "AISCAN:RANGE=BIP10V",
            "AISCAN:LOWCHAN=0",
            "AISCAN:HIGHCHAN=1",
            "AISCAN:RATE=22050",
            "AISCAN:SAMPLES=0",
            "?AI{0}:SLOPE",
            "?AI{0}:OFFSET",
            "?AI{1}:SLOPE",
            "?AI{1}:OFFSET",
            "AISCAN:START",
            "AISCAN:STOP",
        ]
    );
}

#[test]
fn test_stop_mid_delay_blocks_until_stopped() {
    let mut slow = config();
    slow.producer.poll_delay = Duration::from_secs(60);
    let controller = AcquisitionController::new(slow);
    let session = controller.start_session(MockScanDevice::new()).unwrap();
    assert_eq!(session.producer_state(), ProducerState::Running);

    let start = Instant::now();
    let summary = controller.stop_session(session);

    // The 60 s delay was interrupted rather than waited out
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.producer.transfers, 0);
}

#[test]
fn test_producer_stop_acknowledged_before_return() {
    let buffer = Arc::new(CircularBuffer::new(320).unwrap());
    let progress = Arc::new(ProgressSignal::new());
    let mut device = MockScanDevice::new().with_pacing(Pacing::Realtime);
    device.configure(&config().scan.scan_parameters()).unwrap();
    device.start_scan().unwrap();

    let mut producer =
        AcquisitionProducer::new(device, buffer, progress, config().producer.clone());
    producer.start().unwrap();
    thread::sleep(Duration::from_millis(20));

    producer.stop().unwrap();
    assert_eq!(producer.state(), ProducerState::Stopped);
    assert!(producer.take_source().is_some());
}

#[test]
fn test_fault_surfaces_and_tears_down() {
    let controller = AcquisitionController::new(config());
    let device = MockScanDevice::new().fail_after_transfers(10);
    let mut session = controller.start_session(device).unwrap();

    let err = session.run(&mut Discard, &StopSignal::new()).unwrap_err();
    assert!(matches!(
        err,
        StreamError::Device(DeviceError::Transfer { ref message, .. }) if message.contains("PIPE")
    ));
    assert!(session.is_stopped());
    assert_eq!(session.producer_state(), ProducerState::Stopped);

    let (summary, device) = session.close();
    assert_eq!(summary.producer.units_transferred, 640);
    assert!(matches!(summary.fault, Some(DeviceError::Transfer { .. })));

    // The scan is stopped even though the session ended in a fault
    let device = device.unwrap();
    assert!(!device.is_scanning());
    assert_eq!(device.commands().last().unwrap(), "AISCAN:STOP");
}

#[test]
fn test_realtime_session_runs_until_signal() {
    let mut realtime = config();
    realtime.scan.rate = 20_000;
    let controller = AcquisitionController::new(realtime);
    let device = MockScanDevice::new().with_pacing(Pacing::Realtime);
    let mut session = controller.start_session(device).unwrap();

    let stop = StopSignal::new();
    let timer = {
        let stop = stop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            stop.trigger();
        })
    };

    session.run(&mut Discard, &stop).unwrap();
    timer.join().unwrap();
    let summary = session.stop();

    // 40 kS/s aggregate for ~200 ms; one half is 160 samples
    assert!(summary.producer.units_transferred > 1_000);
    assert!(summary.consumer.halves_delivered() > 4);
    assert!(summary.fault.is_none());
    assert!(summary.elapsed >= Duration::from_millis(200));
}

#[test]
fn test_rejected_setup_command_fails_start() {
    let controller = AcquisitionController::new(config());
    let device = MockScanDevice::new().reject_commands("AISCAN:RATE");
    let err = controller.start_session(device).unwrap_err();
    assert!(err.is_setup_failure());
    assert!(err.to_string().contains("AISCAN:RATE=22050"));
}

#[test]
fn test_disconnect_reports_fault_even_when_stop_fails() {
    let controller = AcquisitionController::new(config());
    let device = MockScanDevice::new().disconnect_after_transfers(5);
    let mut session = controller.start_session(device).unwrap();

    let err = session.run(&mut Discard, &StopSignal::new()).unwrap_err();
    assert!(matches!(err, StreamError::Device(DeviceError::Disconnected)));

    let summary = controller.stop_session(session);
    assert_eq!(summary.fault, Some(DeviceError::Disconnected));
    assert_eq!(summary.scan_stop_error, Some(DeviceError::Disconnected));
    assert_eq!(summary.producer.units_transferred, 5 * 64);
}

#[test]
fn test_short_calibration_table_fails_start() {
    let controller = AcquisitionController::new(config());
    let err = controller
        .start_session_with(MockScanDevice::new(), |_device, params| {
            Ok(CalibrationTable::identity(&ScanParameters {
                high_channel: params.low_channel,
                ..*params
            }))
        })
        .unwrap_err();

    assert!(matches!(err, StreamError::Configuration(_)));
    assert!(err.is_setup_failure());
}
