//! Injected wall-clock capability.
//!
//! Every expiry decision in the crate (notification age, session lifetime,
//! inactivity) reads time through [`Clock`] so tests can drive it with a
//! [`ManualClock`] instead of sleeping.

use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Source of the current wall-clock instant.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock to `instant`.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.lock() = instant;
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: std::time::Duration) {
        let delta = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::MAX);
        let mut now = self.lock();
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// Elapsed time from `earlier` to `now`, clamped at zero.
///
/// A timestamp in the future (client clock moved backwards) counts as no
/// time elapsed rather than a negative duration.
#[must_use]
pub fn elapsed_since(now: DateTime<Utc>, earlier: DateTime<Utc>) -> std::time::Duration {
    (now - earlier).to_std().unwrap_or(std::time::Duration::ZERO)
}
