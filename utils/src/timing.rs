// Helpers for timestamps and measuring intervals
//
use nix::time::{clock_gettime, ClockId};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Nanoseconds on the monotonic clock
///
/// This is the clock display hardware stamps vsync events with, so
/// software generated vsyncs use it too.
pub fn get_monotonic_nanos() -> i64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as i64 * 1_000_000_000 + ts.tv_nsec() as i64,
        Err(_) => get_current_time().as_nanos() as i64,
    }
}

// A stopclock for measuring time intervals
//
// The order of use MUST be `new`, `start`, `end`
// after that the recorded duration can be
// got with `get_duration`
pub struct StopWatch {
    sw_start: i64,
    sw_end: i64,
}

impl StopWatch {
    // Create an empty stopwatch
    pub fn new() -> StopWatch {
        StopWatch {
            sw_start: 0,
            sw_end: 0,
        }
    }

    pub fn start(&mut self) {
        self.sw_start = get_monotonic_nanos();
    }

    pub fn end(&mut self) {
        self.sw_end = get_monotonic_nanos();
    }

    pub fn get_duration(&self) -> Duration {
        Duration::from_nanos((self.sw_end - self.sw_start).max(0) as u64)
    }
}
