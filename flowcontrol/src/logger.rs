//! Short-lived event logs for debugging flow-control decisions.

use lumen_runtime::AbsTime;
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, enabled, Level};

/// Ring buffer of recent events attached to a client or server node.
///
/// Events are only captured while the `lumen_flowcontrol::events` target
/// has trace logging enabled, keeping the hot path free of string
/// formatting otherwise. Entries older than `keep` are expired on every
/// insert, so a dump shows the window leading up to an interesting
/// decision (typically a rejection) rather than the whole connection
/// history.
pub(crate) struct EventLog {
    keep: Duration,
    events: VecDeque<(AbsTime, String)>,
}

impl EventLog {
    pub fn new(keep: Duration) -> Self {
        Self {
            keep,
            events: VecDeque::new(),
        }
    }

    pub fn add(&mut self, now: AbsTime, event: impl FnOnce() -> String) {
        if !enabled!(target: "lumen_flowcontrol::events", Level::TRACE) {
            return;
        }
        self.expire(now);
        self.events.push_back((now, event()));
    }

    pub fn dump(&mut self, now: AbsTime) {
        self.expire(now);
        for (time, event) in &self.events {
            debug!(target: "lumen_flowcontrol::events", t = time.as_nanos(), %event);
        }
    }

    fn expire(&mut self, now: AbsTime) {
        while let Some((time, _)) = self.events.front() {
            if now.saturating_since(*time) <= self.keep {
                break;
            }
            self.events.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let mut log = EventLog::new(Duration::from_secs(1));
        // Bypass the tracing gate by inserting directly
        log.events.push_back((AbsTime::ZERO, "old".into()));
        log.events
            .push_back((AbsTime::from_nanos(900_000_000), "recent".into()));

        log.expire(AbsTime::from_nanos(1_500_000_000));
        assert_eq!(log.events.len(), 1);
        assert_eq!(log.events[0].1, "recent");
    }
}
