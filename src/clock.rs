//! Monotonic clock reference
//!
//! Every frame and audio chunk entering the system is stamped against one
//! shared monotonic reference so the two streams can be correlated later,
//! regardless of wall-clock adjustments.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Host time in clock-reference ticks since the clock was created.
pub type HostTime = Duration;

enum ClockSource {
    /// Live mode: derived from a process-start `Instant`.
    System { origin: Instant },
    /// Manual mode: advanced explicitly, for deterministic tests.
    Manual { now: Mutex<Duration> },
}

/// A single monotonic time source shared by both ingestors.
///
/// Constructed once at startup and passed to every component that needs to
/// stamp or interpret host times. Cloning is cheap; clones observe the same
/// timeline.
#[derive(Clone)]
pub struct MonotonicClock {
    source: Arc<ClockSource>,
}

impl MonotonicClock {
    /// Create a clock anchored at the current instant.
    pub fn new() -> Self {
        Self {
            source: Arc::new(ClockSource::System {
                origin: Instant::now(),
            }),
        }
    }

    /// Create a manually advanced clock starting at zero.
    pub fn manual() -> Self {
        Self {
            source: Arc::new(ClockSource::Manual {
                now: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Current host time in clock-reference ticks.
    pub fn now(&self) -> HostTime {
        match &*self.source {
            ClockSource::System { origin } => origin.elapsed(),
            ClockSource::Manual { now } => *now.lock(),
        }
    }

    /// Advance a manual clock. No-op on a system clock.
    pub fn advance(&self, by: Duration) {
        if let ClockSource::Manual { now } = &*self.source {
            *now.lock() += by;
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MonotonicClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicClock")
            .field("now", &self.now())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = MonotonicClock::manual();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Duration::from_millis(250));
    }

    #[test]
    fn test_clones_share_timeline() {
        let clock = MonotonicClock::manual();
        let other = clock.clone();
        clock.advance(Duration::from_secs(1));
        assert_eq!(other.now(), Duration::from_secs(1));
    }
}
