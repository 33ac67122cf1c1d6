//! Simulation / wall clock.
//!
//! Nanosecond-resolution clock shared by every component. In backtest mode
//! it is purely virtual (`set_virtual_time` drives it); in live mode it
//! tracks wall-clock time. No component outside this module constructs a
//! zoned datetime itself — the engine depends on the `TimeService`
//! collaborator (`time_service.rs`) for calendar semantics, and on this
//! clock for "what time is it right now" (spec §6.1: "Core must never
//! construct zoned datetimes itself").

use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Nanos = i64;

pub const NANOS_PER_MICRO: i64 = 1_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Engine clock. Backtest mode never calls system time; live mode follows
/// it but the same `Nanos` representation is used throughout so the rest
/// of the engine is mode-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMode {
    Backtest,
    Live,
}

#[derive(Debug, Clone)]
pub struct EngineClock {
    mode: ClockMode,
    current: Nanos,
}

impl EngineClock {
    pub fn backtest(start_time: Nanos) -> Self {
        Self { mode: ClockMode::Backtest, current: start_time }
    }

    pub fn live_at(now: Nanos) -> Self {
        Self { mode: ClockMode::Live, current: now }
    }

    #[inline]
    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        self.current
    }

    #[inline]
    pub fn now_secs(&self) -> i64 {
        self.current / NANOS_PER_SEC
    }

    /// Advance the clock. In backtest mode this is the only way time moves
    /// forward; in live mode it is called whenever the caller observes a
    /// fresh wall-clock reading. Panics on backward movement: a clock that
    /// goes backward indicates a bug in the caller, not recoverable state.
    #[inline]
    pub fn advance_to(&mut self, new_time: Nanos) {
        debug_assert!(
            new_time >= self.current,
            "EngineClock: cannot go backward from {} to {}",
            self.current,
            new_time
        );
        self.current = new_time;
    }

    #[inline]
    pub fn elapsed_since(&self, past: Nanos) -> Nanos {
        (self.current - past).max(0)
    }
}

impl fmt::Display for EngineClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.current / NANOS_PER_SEC;
        let nanos = self.current % NANOS_PER_SEC;
        write!(f, "{secs}.{nanos:09}s ({:?})", self.mode)
    }
}

/// Convert a chrono UTC datetime to `Nanos`.
#[inline]
pub fn datetime_to_nanos(dt: &chrono::DateTime<chrono::Utc>) -> Nanos {
    dt.timestamp_nanos_opt().unwrap_or(0)
}

/// Convert `Nanos` to a chrono UTC datetime.
#[inline]
pub fn nanos_to_datetime(nanos: Nanos) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let nsecs = nanos.rem_euclid(NANOS_PER_SEC) as u32;
    chrono::Utc.timestamp_opt(secs, nsecs).unwrap()
}
