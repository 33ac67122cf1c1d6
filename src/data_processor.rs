//! Bar derivation pipeline (spec §4.5).
//!
//! Polls `SessionData` for symbols with derived intervals, aggregates
//! unconsumed base bars into complete derived bars, appends them, and
//! drives the indicator engine. Never told what to generate — every
//! cycle re-derives its work list from `SessionData.get_symbols_with_derived()`.

use crate::bar::Bar;
use crate::clock::Nanos;
use crate::indicator::{Indicator, IndicatorRegistry};
use crate::interval::Interval;
use crate::session_data::SessionData;
use crate::time_service::TimeService;
use chrono::Datelike;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-(symbol, derived interval) cursor into the base deque, so that a
/// base bar already consumed by one derived interval is not re-aggregated
/// when the processor examines another derived interval depending on the
/// same base.
#[derive(Default)]
struct Cursors {
    consumed_base_timestamp: BTreeMap<(String, Interval), Nanos>,
}

pub struct DataProcessor {
    session: SessionData,
    time_service: Arc<dyn TimeService>,
    cursors: parking_lot::Mutex<Cursors>,
}

impl DataProcessor {
    pub fn new(session: SessionData, time_service: Arc<dyn TimeService>) -> Self {
        Self { session, time_service, cursors: parking_lot::Mutex::new(Cursors::default()) }
    }

    /// One polling cycle. Returns the number of derived bars emitted
    /// across all symbols, for the caller's backoff decision.
    pub fn poll_once(&self) -> usize {
        let mut emitted = 0;
        for (symbol, derived_intervals) in self.session.get_symbols_with_derived() {
            for derived in derived_intervals {
                emitted += self.process_symbol_interval(&symbol, derived);
            }
            self.clear_fully_consumed_bases(&symbol, &derived_intervals);
        }
        emitted
    }

    /// Force-emits the trailing, otherwise-incomplete derivation period
    /// for every (symbol, derived interval) — called once at session
    /// close (spec §4.5 step 1: "OR the coordinator signals session/day
    /// close"). A derived bar produced this way still only covers the
    /// base bars actually observed; quality scoring already reflects
    /// that period being short.
    pub fn flush_at_session_close(&self) -> usize {
        let mut emitted = 0;
        for (symbol, derived_intervals) in self.session.get_symbols_with_derived() {
            for derived in derived_intervals {
                emitted += self.flush_symbol_interval(&symbol, derived);
            }
        }
        emitted
    }

    fn flush_symbol_interval(&self, symbol: &str, derived: Interval) -> usize {
        let Some(base) = derived.required_base() else { return 0 };
        let base_bars = self.session.get_bars_ref(symbol, base, true);
        if base_bars.is_empty() {
            return 0;
        }

        let last_consumed = {
            let cursors = self.cursors.lock();
            cursors.consumed_base_timestamp.get(&(symbol.to_string(), derived)).copied()
        };
        let unconsumed: Vec<Bar> = base_bars
            .iter()
            .copied()
            .filter(|b| last_consumed.map(|ts| b.timestamp > ts).unwrap_or(true))
            .collect();
        if unconsumed.is_empty() {
            return 0;
        }

        let Some(derived_bar) = aggregate(&unconsumed) else { return 0 };
        let emitted = match self.session.append_bar(symbol, derived, derived_bar) {
            Ok(()) => {
                self.update_indicators(symbol, derived);
                1
            }
            Err(e) => {
                warn!(symbol, %derived, error = %e, "session-close flush failed");
                0
            }
        };

        let mut cursors = self.cursors.lock();
        cursors.consumed_base_timestamp.insert((symbol.to_string(), derived), unconsumed.last().unwrap().timestamp);
        emitted
    }

    /// Clears `bars[base].updated` once every derived interval that
    /// depends on it has consumed the latest base bar — never before, so
    /// a slower derived consumer never misses an update (spec §4.5 step 3).
    fn clear_fully_consumed_bases(&self, symbol: &str, derived_intervals: &[Interval]) {
        let mut by_base: BTreeMap<Interval, Vec<Interval>> = BTreeMap::new();
        for derived in derived_intervals {
            if let Some(base) = derived.required_base() {
                by_base.entry(base).or_default().push(*derived);
            }
        }
        for (base, derived_children) in by_base {
            let Some(last_base_ts) = self.session.get_bars_ref(symbol, base, true).last().map(|b| b.timestamp) else { continue };
            let cursors = self.cursors.lock();
            let all_caught_up = derived_children.iter().all(|derived| {
                cursors.consumed_base_timestamp.get(&(symbol.to_string(), *derived)).copied() == Some(last_base_ts)
            });
            drop(cursors);
            if all_caught_up {
                self.session.clear_updated(symbol, base);
            }
        }
    }

    fn process_symbol_interval(&self, symbol: &str, derived: Interval) -> usize {
        let Some(base) = derived.required_base() else { return 0 };
        if !self.session.is_updated(symbol, base) {
            return 0;
        }

        let base_bars = self.session.get_bars_ref(symbol, base, true);
        if base_bars.is_empty() {
            return 0;
        }

        let last_consumed = {
            let cursors = self.cursors.lock();
            cursors.consumed_base_timestamp.get(&(symbol.to_string(), derived)).copied()
        };

        let unconsumed: Vec<Bar> = base_bars
            .iter()
            .copied()
            .filter(|b| last_consumed.map(|ts| b.timestamp > ts).unwrap_or(true))
            .collect();
        if unconsumed.is_empty() {
            return 0;
        }

        let complete_groups = self.group_complete_periods(symbol, derived, &unconsumed);
        let mut emitted = 0;
        for group in &complete_groups {
            let Some(derived_bar) = aggregate(group) else { continue };
            match self.session.append_bar(symbol, derived, derived_bar) {
                Ok(()) => {
                    emitted += 1;
                    self.update_indicators(symbol, derived);
                }
                Err(e) => warn!(symbol, %derived, error = %e, "derivation append failed, skipping this cycle"),
            }
        }

        if let Some(last) = complete_groups.iter().flatten().last() {
            let mut cursors = self.cursors.lock();
            cursors.consumed_base_timestamp.insert((symbol.to_string(), derived), last.timestamp);
        }

        emitted
    }

    /// Groups unconsumed base bars into complete derivation periods. A
    /// period is complete once a bar belonging to the *next* period is
    /// observed — the leading bar of an incomplete trailing period is
    /// left unconsumed (no partial derived bars leak to consumers).
    fn group_complete_periods(&self, _symbol: &str, derived: Interval, bars: &[Bar]) -> Vec<Vec<Bar>> {
        let tz = self.time_service.get_exchange_timezone();
        let mut groups: Vec<Vec<Bar>> = Vec::new();
        let mut current: Vec<Bar> = Vec::new();
        let mut current_key: Option<PeriodKey> = None;

        for bar in bars {
            let key = period_key(derived, bar.timestamp, tz);
            match &current_key {
                Some(k) if *k == key => current.push(*bar),
                Some(_) => {
                    groups.push(std::mem::take(&mut current));
                    current.push(*bar);
                    current_key = Some(key);
                }
                None => {
                    current.push(*bar);
                    current_key = Some(key);
                }
            }
        }
        // `current` (the trailing, possibly-incomplete period) is dropped:
        // it stays in the base deque as unconsumed until the next period starts.
        debug!(count = groups.len(), %derived, "derivation groups ready");
        groups
    }

    /// Updates indicators configured directly on `interval` right after a
    /// bar append to it. Derived-interval appends already call this from
    /// `process_symbol_interval`/`flush_symbol_interval` above; the
    /// coordinator calls this one for base-interval appends, so an
    /// indicator configured on the base interval itself (e.g. `sma_20`
    /// on `1m` when `base_interval == 1m`) is updated too (spec §5).
    pub fn update_indicators_for(&self, symbol: &str, interval: Interval) {
        self.update_indicators(symbol, interval);
    }

    fn update_indicators(&self, symbol: &str, interval: Interval) {
        let bars: std::collections::VecDeque<Bar> = self.session.get_bars_ref(symbol, interval, true).into_iter().collect();
        let Some(snapshot) = self.session.with_symbol(symbol, |s| s.indicators.clone()) else { return };
        for (key, mut data) in snapshot {
            if data.config.interval != interval {
                continue;
            }
            let Some(indicator): Option<Box<dyn Indicator>> = IndicatorRegistry::build(&data.config) else { continue };
            if let Some(value) = indicator.update(&mut data.state, &bars) {
                data.current_value = Some(value);
                data.valid = true;
                data.last_updated = bars.back().map(|b| b.timestamp);
            }
            self.session.set_indicator(symbol, key, data);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeriodKey {
    Seconds(i64),
    Day(chrono::NaiveDate),
    /// Bucket of `count` consecutive calendar days, for `Nd` (N>1)
    /// derived from `1d`.
    MultiDay(i64),
    /// Bucket of `count` consecutive 7-day weeks, for any `Nw` derived
    /// from `1d`/`1w`.
    Week(i64),
}

/// Groups a timestamp into its derivation period. Sub-daily intervals
/// bucket by a fixed-seconds window; `1d` buckets by exchange-local
/// calendar day; `Nd` (N>1) and `Nw` bucket by a fixed-size run of
/// exchange-local days, anchored to the proleptic Gregorian day count so
/// buckets are deterministic across years (spec §4.1: `1w` aggregates
/// from `1d`).
fn period_key(interval: Interval, timestamp: Nanos, tz: chrono_tz::Tz) -> PeriodKey {
    match interval.nominal_seconds() {
        Some(seconds) if interval.is_sub_daily() => {
            let secs = timestamp.div_euclid(crate::clock::NANOS_PER_SEC);
            PeriodKey::Seconds(secs.div_euclid(seconds))
        }
        _ => {
            let local_date = crate::clock::nanos_to_datetime(timestamp).with_timezone(&tz).date_naive();
            match interval {
                Interval::Bar { count: 1, unit: crate::interval::Unit::Day } => PeriodKey::Day(local_date),
                Interval::Bar { count, unit: crate::interval::Unit::Day } => {
                    let epoch_day = local_date.num_days_from_ce() as i64;
                    PeriodKey::MultiDay(epoch_day.div_euclid(count as i64))
                }
                Interval::Bar { count, unit: crate::interval::Unit::Week } => {
                    let epoch_day = local_date.num_days_from_ce() as i64;
                    let week_index = epoch_day.div_euclid(7);
                    PeriodKey::Week(week_index.div_euclid(count as i64))
                }
                _ => PeriodKey::Day(local_date),
            }
        }
    }
}

/// OHLCV aggregation: open=first, high=max, low=min, close=last, volume=sum.
fn aggregate(bars: &[Bar]) -> Option<Bar> {
    let first = bars.first()?;
    let last = bars.last()?;
    let high = bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let volume = bars.iter().map(|b| b.volume).sum();
    Some(Bar::new(first.timestamp, first.open, high, low, last.close, volume))
}
