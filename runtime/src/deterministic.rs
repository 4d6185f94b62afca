//! A manually driven clock for deterministic tests.
//!
//! # Example
//! ```rust
//! use lumen_runtime::{deterministic, Clock as _};
//! use std::time::Duration;
//!
//! let clock = deterministic::Clock::new();
//! let start = clock.now();
//! clock.advance(Duration::from_millis(15));
//! assert_eq!(clock.now().saturating_since(start), Duration::from_millis(15));
//! ```

use crate::AbsTime;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// A clock that only moves when told to.
///
/// Handles are cheap clones sharing the same underlying time, so a test can
/// hand one to the component under test and keep another to drive it.
#[derive(Clone, Debug, Default)]
pub struct Clock {
    now: Arc<Mutex<AbsTime>>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + duration;
    }

    /// Jump to an absolute instant. Panics if `time` is in the past; the
    /// clock is monotonic like the real one.
    pub fn set(&self, time: AbsTime) {
        let mut now = self.now.lock().unwrap();
        assert!(time >= *now, "deterministic clock cannot go backwards");
        *now = time;
    }
}

impl crate::Clock for Clock {
    fn now(&self) -> AbsTime {
        *self.now.lock().unwrap()
    }
}
