//! Monotonic stopwatch used by the throttle
//!
//! Thread-safe so the locked-time watch can be stopped from a lock guard's
//! Drop impl while another thread reads the elapsed time.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Inner {
    accumulated: Duration,
    started_at: Option<Instant>,
}

/// Accumulating stopwatch over the monotonic clock
#[derive(Debug, Default)]
pub struct StopWatch {
    inner: Mutex<Inner>,
}

impl StopWatch {
    /// Create a stopped stopwatch at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) accumulating. No-op if already running.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.started_at.is_none() {
            inner.started_at = Some(Instant::now());
        }
    }

    /// Stop accumulating. No-op if not running.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if let Some(started) = inner.started_at.take() {
            inner.accumulated += started.elapsed();
        }
    }

    /// Reset to zero and stop
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.accumulated = Duration::ZERO;
        inner.started_at = None;
    }

    /// Total accumulated time, including the currently running span
    pub fn now(&self) -> Duration {
        let inner = self.inner.lock();
        match inner.started_at {
            Some(started) => inner.accumulated + started.elapsed(),
            None => inner.accumulated,
        }
    }
}
