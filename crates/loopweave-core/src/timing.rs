//! Timing primitives for loop scheduling.
//!
//! This module provides the fundamental timing types used throughout LoopWeave:
//!
//! - [`Timestamp`] - Fixed-point monotonic instant in microseconds
//! - [`Clock`] - Source of monotonic "now" for a session
//! - [`SystemClock`] - Wall-clock backed monotonic clock
//! - [`ManualClock`] - Shared, settable clock for tests and offline stepping

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic instant with microsecond resolution, measured from the session origin.
///
/// Stored as fixed-point so that timestamps are totally ordered and can key
/// the timer queue without floating-point comparison issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// The session origin.
    pub const ZERO: Timestamp = Timestamp { micros: 0 };

    /// Create a timestamp from a millisecond value.
    #[inline]
    pub fn from_millis(ms: f64) -> Self {
        Self {
            micros: (ms * 1000.0).round() as i64,
        }
    }

    /// Create a timestamp from whole microseconds.
    #[inline]
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Milliseconds since the session origin.
    #[inline]
    pub fn as_millis(self) -> f64 {
        self.micros as f64 / 1000.0
    }

    /// Whole microseconds since the session origin.
    #[inline]
    pub fn as_micros(self) -> i64 {
        self.micros
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        let delta = self.micros.saturating_sub(earlier.micros);
        Duration::from_micros(delta.max(0) as u64)
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        let delta = i64::try_from(rhs.as_micros()).unwrap_or(i64::MAX);
        Self {
            micros: self.micros.saturating_add(delta),
        }
    }
}

impl std::ops::Sub<Duration> for Timestamp {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        let delta = i64::try_from(rhs.as_micros()).unwrap_or(i64::MAX);
        Self {
            micros: self.micros.saturating_sub(delta),
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1}ms", self.as_millis())
    }
}

/// Source of monotonic time for a session.
pub trait Clock: Send {
    /// Current monotonic instant.
    fn now(&self) -> Timestamp;
}

/// Monotonic clock anchored at the instant it was created.
#[derive(Clone, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Convert a timestamp on this clock back into an `Instant`.
    pub fn instant_at(&self, at: Timestamp) -> Instant {
        self.origin + at.saturating_duration_since(Timestamp::ZERO)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.origin.elapsed().as_micros();
        Timestamp::from_micros(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }
}

/// Settable clock shared between a session and its driver.
///
/// Clones share the same underlying time, so a test can keep one handle
/// while the session owns another.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    micros: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock standing at the session origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock standing at the given instant.
    pub fn starting_at(at: Timestamp) -> Self {
        let clock = Self::new();
        clock.set(at);
        clock
    }

    /// Move the clock to an absolute instant.
    ///
    /// Moving backwards is ignored; the clock is monotonic.
    pub fn set(&self, at: Timestamp) {
        self.micros.fetch_max(at.as_micros(), Ordering::SeqCst);
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let now = self.now();
        self.set(now + delta);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_millis() {
        let ts = Timestamp::from_millis(3970.0);
        assert_eq!(ts.as_micros(), 3_970_000);
        assert!((ts.as_millis() - 3970.0).abs() < 1e-9);
    }

    #[test]
    fn test_timestamp_duration_arithmetic() {
        let start = Timestamp::from_millis(3970.0);
        let boundary = start + Duration::from_millis(4000);
        assert_eq!(boundary, Timestamp::from_millis(7970.0));
        assert_eq!(boundary - Duration::from_millis(30), Timestamp::from_millis(7940.0));
        assert_eq!(
            boundary.saturating_duration_since(start),
            Duration::from_millis(4000)
        );
        assert_eq!(start.saturating_duration_since(boundary), Duration::ZERO);
    }

    #[test]
    fn test_manual_clock_is_shared_and_monotonic() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.set(Timestamp::from_millis(100.0));
        assert_eq!(other.now(), Timestamp::from_millis(100.0));

        other.set(Timestamp::from_millis(50.0));
        assert_eq!(clock.now(), Timestamp::from_millis(100.0));

        clock.advance(Duration::from_millis(25));
        assert_eq!(other.now(), Timestamp::from_millis(125.0));
    }

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now();
        assert!(b > a);
    }
}
