//! Monotonic time for components that integrate values over wall-clock
//! intervals.
//!
//! All time-sensitive code in the lumen crates reads time through the
//! [`Clock`] trait instead of calling into the operating system directly.
//! Production code uses [`System`], which is anchored on a
//! `std::time::Instant` and can never go backwards. Tests use
//! [`deterministic::Clock`], which only moves when the test advances it,
//! so integration schedules can be driven step by step.

pub mod deterministic;
pub mod mocks;

use std::{
    ops::Add,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("closed")]
    Closed,
}

/// A monotonic instant with nanosecond resolution.
///
/// `AbsTime` is an offset from an arbitrary epoch (process start for
/// [`System`], zero for the deterministic clock). It is only meaningful
/// relative to other instants read from the same clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsTime(u64);

impl AbsTime {
    pub const ZERO: AbsTime = AbsTime(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Duration elapsed since `earlier`, or zero if `earlier` is in the
    /// future. Integration paths rely on this to absorb clock skew instead
    /// of going backwards.
    pub fn saturating_since(&self, earlier: AbsTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for AbsTime {
    type Output = AbsTime;

    fn add(self, rhs: Duration) -> AbsTime {
        AbsTime(
            self.0
                .saturating_add(rhs.as_nanos().min(u64::MAX as u128) as u64),
        )
    }
}

/// Source of monotonic time.
///
/// Implementations must be cheap to clone; every component that integrates
/// over time holds its own handle.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> AbsTime;
}

/// Clock backed by the operating system's monotonic clock.
#[derive(Clone, Copy, Debug)]
pub struct System {
    anchor: Instant,
}

impl System {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for System {
    fn now(&self) -> AbsTime {
        AbsTime(self.anchor.elapsed().as_nanos().min(u64::MAX as u128) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abs_time_arithmetic() {
        let t = AbsTime::from_nanos(1_000);
        assert_eq!(t + Duration::from_nanos(500), AbsTime::from_nanos(1_500));
        assert_eq!(
            (t + Duration::from_nanos(500)).saturating_since(t),
            Duration::from_nanos(500)
        );

        // An earlier instant yields zero, not a negative duration
        assert_eq!(
            t.saturating_since(AbsTime::from_nanos(2_000)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_system_monotonic() {
        let clock = System::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
