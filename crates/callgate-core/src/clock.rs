//! Time source abstraction.
//!
//! Components never call `Instant::now()` or `Utc::now()` directly. Monotonic
//! time drives rate and breaker windows; wall time drives TTL records that
//! outlive the process and the day/month boundaries of quotas and alerts.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync + 'static {
    /// Monotonic instant
    fn now(&self) -> Instant;

    /// Wall-clock time in UTC
    fn wall(&self) -> DateTime<Utc>;

    /// Wall-clock time as unix milliseconds
    fn wall_ms(&self) -> i64 {
        self.wall().timestamp_millis()
    }
}

/// Clock shared between components
pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a shareable system clock
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "test-helpers"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "test-helpers"))]
mod mock {
    use super::Clock;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// Manually driven clock for deterministic tests.
    ///
    /// Clones share the same time. `advance` moves monotonic and wall time
    /// together so TTL, breaker and quota-period logic stay consistent.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        current: Arc<Mutex<(Instant, DateTime<Utc>)>>,
    }

    impl MockClock {
        /// Start at the real current time
        pub fn new() -> Self {
            Self::starting_at(Utc::now())
        }

        /// Start at a specific wall-clock time
        pub fn starting_at(wall: DateTime<Utc>) -> Self {
            Self {
                current: Arc::new(Mutex::new((Instant::now(), wall))),
            }
        }

        /// Move time forward
        pub fn advance(&self, by: Duration) {
            let mut current = self.current.lock();
            current.0 += by;
            current.1 += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        }

        /// Shareable handle to this clock
        pub fn shared(&self) -> Arc<dyn Clock> {
            Arc::new(self.clone())
        }
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            self.current.lock().0
        }

        fn wall(&self) -> DateTime<Utc> {
            self.current.lock().1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_mock_clock_advances_both_times() {
        let start = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 0).unwrap();
        let clock = MockClock::starting_at(start);
        let before = clock.now();

        clock.advance(Duration::from_secs(120));

        assert_eq!(clock.now() - before, Duration::from_secs(120));
        assert_eq!(clock.wall(), Utc.with_ymd_and_hms(2024, 4, 1, 0, 1, 0).unwrap());
    }

    #[test]
    fn test_clones_share_time() {
        let clock = MockClock::new();
        let other = clock.clone();
        other.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), other.now());
    }
}
