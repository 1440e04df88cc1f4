//! Time source for the harness
//!
//! Every wait in the harness is a real blocking sleep in production. The
//! [`ManualClock`] advances instantly on `sleep` so waits measured in
//! lifecycle days can be exercised in unit tests.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Wall clock plus blocking sleep
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);

    /// Block until `deadline`; returns immediately if it already passed
    fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(remaining) = (deadline - self.now()).to_std() {
            if !remaining.is_zero() {
                self.sleep(remaining);
            }
        }
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// System time and `std::thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock that only moves when slept on or advanced.
///
/// Clones share the same time, so a test can hand one clone to the code
/// under test and inspect the other.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    slept: Duration,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                now,
                slept: Duration::ZERO,
            })),
        }
    }

    /// Move time forward without counting it as a sleep
    pub fn advance(&self, duration: Duration) {
        let mut state = self.inner.lock();
        state.now = state.now + to_chrono(duration);
    }

    /// Total time spent in `sleep`
    pub fn total_slept(&self) -> Duration {
        self.inner.lock().slept
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.inner.lock();
        state.now = state.now + to_chrono(duration);
        state.slept += duration;
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
