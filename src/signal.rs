//! Cross-thread signals used by the acquisition loop.
//!
//! - [`StopSignal`] is the external cancellation token observed by the consumer loop
//!   (set from a keypress handler, Ctrl+C, or a run-duration timer).
//! - [`ProgressSignal`] lets the producer wake the consumer after each append
//!   without ever blocking itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Cooperative stop request shared between threads.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether a stop has been requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Generation counter bumped by the producer after every append.
#[derive(Debug, Default)]
pub struct ProgressSignal {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl ProgressSignal {
    /// Create a signal at generation 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Advance the generation and wake all waiters.
    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.condvar.notify_all();
    }

    /// Block until the generation moves past `seen` or `timeout` elapses.
    ///
    /// Returns the generation observed on wake-up.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.condvar.wait_until(&mut generation, deadline).timed_out() {
                break;
            }
        }
        *generation
    }
}
