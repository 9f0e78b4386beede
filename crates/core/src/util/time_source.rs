//! Wall-clock abstraction.
//!
//! Accrual windows are measured against persisted timestamps, so the clock has to
//! be a real calendar time (`DateTime<Utc>`), not a monotonic instant. Everything
//! that needs "now" receives a `TimeSource` so tests can drive time by hand.

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub trait TimeSource: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealTime;

impl TimeSource for RealTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock shared between the code under test and the test body.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Clone)]
pub struct SharedMockTimeSource {
    now: Arc<parking_lot::Mutex<DateTime<Utc>>>,
}

#[cfg(any(test, feature = "testing"))]
impl SharedMockTimeSource {
    /// Starts at a fixed instant (2025-01-01T00:00:00Z) so tests are reproducible.
    pub fn new() -> Self {
        let start = DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default();
        Self::starting_at(start)
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(parking_lot::Mutex::new(start)),
        }
    }

    pub fn advance_time(&self, by: std::time::Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock();
        let next = now.checked_add_signed(delta).unwrap_or(*now);
        *now = next;
    }
}

#[cfg(any(test, feature = "testing"))]
impl Default for SharedMockTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "testing"))]
impl TimeSource for SharedMockTimeSource {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Convenience for handing a clock to components that take `Arc<dyn TimeSource>`.
pub fn shared<T: TimeSource>(source: T) -> Arc<dyn TimeSource> {
    Arc::new(source)
}
