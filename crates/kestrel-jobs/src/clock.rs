//! Time sources for the queue.
//!
//! Every store operation takes `now` explicitly; the queue reads it from a
//! [`Clock`] so tests can drive time deterministically.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = saturating_offset(*now, by);
    }

    /// Sets the clock to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Wall-clock anchor advanced by tokio's monotonic time.
///
/// Under `tokio::time::pause` the timestamps it produces follow the runtime's
/// virtual time, which keeps backoff and lease timers in step with job
/// timestamps.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TokioClock {
    /// Creates a clock anchored at the current wall time.
    pub fn new() -> Self {
        Self {
            anchor: Utc::now(),
            started: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        saturating_offset(self.anchor, self.started.elapsed())
    }
}

/// `now + duration`, or `None` if the result is past the representable range.
pub(crate) fn checked_offset(now: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    ChronoDuration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
}

/// `now + duration`, clamped to the latest representable time.
pub(crate) fn saturating_offset(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    checked_offset(now, duration).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time remaining until `at`, or zero if it has passed.
pub(crate) fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, ChronoDuration::seconds(5));
    }

    #[test]
    fn test_until_saturates_at_zero() {
        let now = Utc::now();
        assert_eq!(until(now - ChronoDuration::seconds(1), now), Duration::ZERO);
        assert_eq!(until(now + ChronoDuration::seconds(2), now), Duration::from_secs(2));
    }

    #[test]
    fn test_offsets_past_range() {
        let now = Utc::now();
        assert_eq!(checked_offset(now, Duration::from_secs(1)), Some(now + ChronoDuration::seconds(1)));
        assert_eq!(checked_offset(now, Duration::MAX), None);
        assert_eq!(saturating_offset(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            saturating_offset(now, Duration::from_secs(u64::MAX / 1000)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let before = clock.now();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(clock.now() - before, ChronoDuration::seconds(30));
    }
}
