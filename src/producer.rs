//! Background producer thread.
//!
//! The producer owns the [`HardwareSource`] for the lifetime of a scan. Each
//! iteration waits the configured inter-poll delay, requests up to
//! `transfer_units` raw samples and appends whatever arrived to the
//! [`CircularBuffer`]:
//!
//! - a transfer that hits its timeout after delivering data is a success;
//! - a transfer that hits its timeout with no data appends nothing and retries;
//! - any [`DeviceError`] is fatal: it is recorded, the thread stops, and the
//!   controller sees it on its next check.
//!
//! ```text
//!  Idle --start()--> Running --request_stop()--> StopRequested --> Stopped
//!                       |                                             ^
//!                       +------------- device error ------------------+
//! ```
//!
//! The inter-poll delay is an interruptible wait on the state condition variable,
//! so a stop requested mid-delay takes effect at once. `Stopped` is published
//! before the thread exits (also on panic), and [`AcquisitionProducer::stop`]
//! blocks until it is reached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace};

use crate::buffer::CircularBuffer;
use crate::config::ProducerConfig;
use crate::error::{DeviceError, Result, StreamError};
use crate::hardware::{HardwareSource, RawSample};
use crate::signal::ProgressSignal;

/// Producer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    /// Constructed, thread not started
    Idle,
    /// Polling the hardware source
    Running,
    /// Stop requested, current iteration finishing
    StopRequested,
    /// Thread has left its loop
    Stopped,
}

/// Producer-side counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProducerStats {
    /// Transfer requests issued
    pub transfers: u64,
    /// Raw units appended to the buffer
    pub units_transferred: u64,
    /// Timed-out transfers that still delivered data
    pub partial_timeouts: u64,
    /// Timed-out transfers that delivered nothing
    pub empty_timeouts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    transfers: AtomicU64,
    units_transferred: AtomicU64,
    partial_timeouts: AtomicU64,
    empty_timeouts: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ProducerStats {
        ProducerStats {
            transfers: self.transfers.load(Ordering::Relaxed),
            units_transferred: self.units_transferred.load(Ordering::Relaxed),
            partial_timeouts: self.partial_timeouts.load(Ordering::Relaxed),
            empty_timeouts: self.empty_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the producer thread and its handle.
#[derive(Debug)]
struct Shared {
    state: Mutex<ProducerState>,
    state_changed: Condvar,
    fault: Mutex<Option<DeviceError>>,
    counters: Counters,
}

impl Shared {
    fn state(&self) -> ProducerState {
        *self.state.lock()
    }

    fn set_state(&self, next: ProducerState) {
        let mut state = self.state.lock();
        *state = next;
        self.state_changed.notify_all();
    }

    /// Sleep for `delay` unless a stop arrives first. Returns `true` if the loop
    /// should exit.
    fn pause(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        while *state == ProducerState::Running {
            if self.state_changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state != ProducerState::Running
    }

    fn record_fault(&self, err: DeviceError) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(err);
        }
    }
}

/// Publishes `Stopped` when the producer loop exits, including by panic.
struct StoppedOnExit<'a> {
    shared: &'a Shared,
    progress: &'a ProgressSignal,
}

impl Drop for StoppedOnExit<'_> {
    fn drop(&mut self) {
        self.shared.set_state(ProducerState::Stopped);
        // Wake the consumer so it notices the stop (or fault) promptly
        self.progress.notify();
    }
}

/// Handle to the background producer.
#[derive(Debug)]
pub struct AcquisitionProducer<S> {
    shared: Arc<Shared>,
    buffer: Arc<CircularBuffer>,
    progress: Arc<ProgressSignal>,
    config: ProducerConfig,
    source: Option<S>,
    handle: Option<JoinHandle<S>>,
}

impl<S: HardwareSource + 'static> AcquisitionProducer<S> {
    /// Create an idle producer that will feed `buffer` from `source`.
    pub fn new(
        source: S,
        buffer: Arc<CircularBuffer>,
        progress: Arc<ProgressSignal>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ProducerState::Idle),
                state_changed: Condvar::new(),
                fault: Mutex::new(None),
                counters: Counters::default(),
            }),
            buffer,
            progress,
            config,
            source: Some(source),
            handle: None,
        }
    }

    /// Spawn the producer thread. Only valid from `Idle`.
    pub fn start(&mut self) -> Result<()> {
        let mut source = match (self.state(), self.source.take()) {
            (ProducerState::Idle, Some(source)) => source,
            (state, source) => {
                self.source = source;
                return Err(StreamError::Configuration(format!(
                    "producer cannot start from state {state:?}"
                )));
            }
        };

        self.shared.set_state(ProducerState::Running);

        let shared = Arc::clone(&self.shared);
        let buffer = Arc::clone(&self.buffer);
        let progress = Arc::clone(&self.progress);
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name("daq-producer".to_string())
            .spawn(move || {
                run_loop(&mut source, &shared, &buffer, &progress, &config);
                source
            });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                info!(
                    transfer_units = self.config.transfer_units,
                    poll_delay = ?self.config.poll_delay,
                    "Producer started"
                );
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(ProducerState::Stopped);
                Err(e.into())
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProducerState {
        self.shared.state()
    }

    /// Fatal error recorded by the producer thread, if any.
    pub fn fault(&self) -> Option<DeviceError> {
        self.shared.fault.lock().clone()
    }

    /// Counters so far.
    pub fn stats(&self) -> ProducerStats {
        self.shared.counters.snapshot()
    }

    /// Ask the producer to stop after its current iteration. Non-blocking.
    pub fn request_stop(&self) {
        let mut state = self.shared.state.lock();
        match *state {
            ProducerState::Running => *state = ProducerState::StopRequested,
            ProducerState::Idle => *state = ProducerState::Stopped,
            ProducerState::StopRequested | ProducerState::Stopped => {}
        }
        self.shared.state_changed.notify_all();
    }

    /// Block until the producer reaches `Stopped` or `timeout` elapses.
    ///
    /// Returns whether `Stopped` was reached. `None` waits indefinitely.
    pub fn wait_stopped(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        while *state != ProducerState::Stopped {
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .state_changed
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return *state == ProducerState::Stopped;
                    }
                }
                None => self.shared.state_changed.wait(&mut state),
            }
        }
        true
    }

    /// Request a stop, wait for `Stopped`, and join the thread.
    ///
    /// Returns the counters on a clean stop, or the fault that ended the loop.
    pub fn stop(&mut self) -> std::result::Result<ProducerStats, DeviceError> {
        self.request_stop();
        self.wait_stopped(None);

        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(source) => self.source = Some(source),
                Err(_) => {
                    error!("Producer thread panicked");
                    self.shared.record_fault(DeviceError::ProducerPanicked);
                }
            }
        }

        let stats = self.stats();
        info!(
            transfers = stats.transfers,
            units = stats.units_transferred,
            partial_timeouts = stats.partial_timeouts,
            empty_timeouts = stats.empty_timeouts,
            "Producer stopped"
        );

        match self.fault() {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    /// Give back the hardware source. `None` while the thread is running or if
    /// it panicked.
    pub fn take_source(&mut self) -> Option<S> {
        self.source.take()
    }
}

impl<S> Drop for AcquisitionProducer<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            {
                let mut state = self.shared.state.lock();
                if *state == ProducerState::Running {
                    *state = ProducerState::StopRequested;
                }
                self.shared.state_changed.notify_all();
            }
            if handle.join().is_err() {
                error!("Producer thread panicked during drop");
            }
        }
    }
}

fn run_loop<S: HardwareSource>(
    source: &mut S,
    shared: &Shared,
    buffer: &CircularBuffer,
    progress: &ProgressSignal,
    config: &ProducerConfig,
) {
    let _stopped = StoppedOnExit { shared, progress };
    let mut scratch: Vec<RawSample> = vec![0; config.transfer_units];
    let counters = &shared.counters;

    loop {
        if shared.pause(config.poll_delay) {
            debug!("Producer observed stop request");
            break;
        }

        let result = source.request_transfer(&mut scratch, config.transfer_timeout);
        counters.transfers.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(transfer) => {
                let units = transfer.units.min(scratch.len());
                if units > 0 {
                    buffer.append(&scratch[..units]);
                    counters
                        .units_transferred
                        .fetch_add(units as u64, Ordering::Relaxed);
                    progress.notify();
                }
                if transfer.timed_out {
                    if units > 0 {
                        counters.partial_timeouts.fetch_add(1, Ordering::Relaxed);
                    } else {
                        counters.empty_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                }
                trace!(units, timed_out = transfer.timed_out, "Transfer complete");
            }
            Err(err) => {
                error!(error = %err, "Producer fault, stopping acquisition");
                shared.record_fault(err);
                break;
            }
        }
    }
}
