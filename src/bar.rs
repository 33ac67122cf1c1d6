//! Bar model and per-(symbol, interval) bar storage.
//!
//! Timestamps are `Nanos` (nanoseconds since Unix epoch, see `clock.rs`) —
//! the engine never stores a timezone-tagged `DateTime` per bar. Exchange
//! timezone conversion happens exactly once, at the point where a nanos
//! value is grouped into an exchange-local calendar day (`storage.rs`,
//! `quality.rs`); the bar itself carries the same instant everyone agrees
//! on, nothing is silently re-interpreted as UTC along the way.

use crate::clock::Nanos;
use crate::interval::Interval;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: Nanos,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl Bar {
    pub fn new(timestamp: Nanos, open: f64, high: f64, low: f64, close: f64, volume: i64) -> Self {
        Self { timestamp, open, high, low, close, volume }
    }
}

/// A maximal missing contiguous range of bars within an expected trading
/// window. Gap spans never overlap and are kept sorted by `start_time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GapInfo {
    pub start_time: Nanos,
    pub end_time: Nanos,
    pub missing_count: u32,
}

/// Bounded-growth historical archive for one interval, keyed by session
/// date. Populated by `SessionData::roll_session`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoricalBars {
    pub by_date: std::collections::BTreeMap<chrono::NaiveDate, Vec<Bar>>,
}

/// Per-symbol, per-interval bar record. Self-describing: every interval
/// carries its own `derived`/`base`/`quality`/`gaps`, so a reader never
/// needs to consult a separate index to know what an interval is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarIntervalData {
    pub interval: Interval,
    pub derived: bool,
    pub base: Option<Interval>,
    pub data: VecDeque<Bar>,
    pub quality: f64,
    pub gaps: Vec<GapInfo>,
    pub updated: bool,
    /// Session-day capacity before overflow moves into `historical`.
    pub capacity: usize,
}

impl BarIntervalData {
    pub fn new_base(interval: Interval, capacity: usize) -> Self {
        Self {
            interval,
            derived: false,
            base: None,
            data: VecDeque::with_capacity(capacity.min(4096)),
            quality: 0.0,
            gaps: Vec::new(),
            updated: false,
            capacity,
        }
    }

    pub fn new_derived(interval: Interval, base: Interval, capacity: usize) -> Self {
        Self {
            interval,
            derived: true,
            base: Some(base),
            data: VecDeque::with_capacity(capacity.min(4096)),
            quality: 0.0,
            gaps: Vec::new(),
            updated: false,
            capacity,
        }
    }

    pub fn last_timestamp(&self) -> Option<Nanos> {
        self.data.back().map(|b| b.timestamp)
    }

    /// Append a bar, enforcing invariant 2 of spec §3: strictly increasing
    /// timestamp, no duplicates. Returns the overflowed bar (to be moved
    /// into historical storage) when `capacity` is exceeded.
    pub fn append(&mut self, bar: Bar) -> Result<Option<Bar>, (Nanos, Nanos)> {
        if let Some(last) = self.last_timestamp() {
            if bar.timestamp <= last {
                return Err((bar.timestamp, last));
            }
        }
        self.data.push_back(bar);
        self.updated = true;
        if self.data.len() > self.capacity {
            return Ok(self.data.pop_front());
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::NANOS_PER_SEC;

    fn ts(secs: i64) -> Nanos {
        secs * NANOS_PER_SEC
    }

    #[test]
    fn append_enforces_monotone_timestamps() {
        let mut data = BarIntervalData::new_base(Interval::parse("1m").unwrap(), 10);
        data.append(Bar::new(ts(100), 1.0, 1.0, 1.0, 1.0, 10)).unwrap();
        let err = data.append(Bar::new(ts(100), 1.0, 1.0, 1.0, 1.0, 10));
        assert!(err.is_err());
        let err2 = data.append(Bar::new(ts(50), 1.0, 1.0, 1.0, 1.0, 10));
        assert!(err2.is_err());
        assert_eq!(data.data.len(), 1);
    }

    #[test]
    fn append_overflow_returns_oldest() {
        let mut data = BarIntervalData::new_base(Interval::parse("1m").unwrap(), 2);
        data.append(Bar::new(ts(100), 1.0, 1.0, 1.0, 1.0, 10)).unwrap();
        data.append(Bar::new(ts(200), 1.0, 1.0, 1.0, 1.0, 10)).unwrap();
        let overflowed = data.append(Bar::new(ts(300), 1.0, 1.0, 1.0, 1.0, 10)).unwrap();
        assert!(overflowed.is_some());
        assert_eq!(data.data.len(), 2);
    }
}
