//! Injectable time source.
//!
//! Every timeout, backoff, and periodic tick in the system goes through a
//! [`Clock`] so that tests can run time-dependent logic without real sleeps.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::Timestamp;

/// Time source abstraction.
///
/// All methods take `&self` to support `Arc<dyn Clock>` sharing across async
/// tasks. Implementations must be thread-safe.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> Timestamp;

    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the system time and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock for tests.
///
/// `sleep` returns immediately after advancing the internal time and
/// recording the requested duration, so backoff sequences can be asserted
/// without waiting.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualClockState>>,
}

#[derive(Debug)]
struct ManualClockState {
    now: Timestamp,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a manual clock starting at the given instant.
    pub fn starting_at(now: Timestamp) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualClockState {
                now,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Create a manual clock starting at the real current time.
    pub fn new() -> Self {
        Self::starting_at(Timestamp::now())
    }

    /// Move the clock forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.inner.lock().expect("manual clock poisoned");
        state.now = state.now.add_duration(duration);
    }

    /// All durations passed to `sleep` so far, in call order.
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.inner.lock().expect("manual clock poisoned").sleeps.clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.inner.lock().expect("manual clock poisoned").now
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.inner.lock().expect("manual clock poisoned");
        state.now = state.now.add_duration(duration);
        state.sleeps.push(duration);
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
