//! Wall-clock abstraction for session timestamps.
//!
//! Every timestamp written to the shared blob (`created`, `expire`) is epoch
//! milliseconds, because other execution contexts compare against it with
//! their own clocks.

use std::time::Duration;

use chrono::Utc;

/// Milliseconds since the Unix epoch.
pub type TimeStamp = i64;

/// Source of "now" for the session subsystem.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> TimeStamp;
}

/// Reads the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp {
        Utc::now().timestamp_millis()
    }
}

/// Wall clock anchored to the tokio timer.
///
/// The epoch origin is sampled once; afterwards time advances with
/// `tokio::time::Instant`, so a paused runtime (`start_paused = true`) drives
/// it deterministically.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    origin_ms: TimeStamp,
    origin: tokio::time::Instant,
}

impl RuntimeClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now().timestamp_millis())
    }

    pub fn starting_at(origin_ms: TimeStamp) -> Self {
        RuntimeClock {
            origin_ms,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> TimeStamp {
        self.origin_ms + duration_ms(self.origin.elapsed())
    }
}

/// Converts a duration to whole milliseconds, saturating at `i64::MAX`.
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
