//! Gap detection & quality scoring (spec §4.6).
//!
//! `recalculate` is called synchronously and directly by the coordinator
//! after each base-interval append; quality calculation only fires for
//! base intervals (`1s`, `1m`, `1d`). Derived intervals inherit their
//! base's quality rather than being scored independently — a derived bar
//! can only exist once its source period is fully covered.

use crate::bar::{Bar, GapInfo};
use crate::interval::{Interval, Unit};
use crate::session_data::SessionData;
use crate::time_service::TimeService;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Per-(symbol, interval) quality-recalculation throttle: avoid
/// rescoring on every single bar when many arrive in a burst.
pub struct QualityManager {
    session: SessionData,
    time_service: Arc<dyn TimeService>,
    last_quality_calc: parking_lot::Mutex<BTreeMap<(String, Interval), Instant>>,
    throttle: std::time::Duration,
}

impl QualityManager {
    pub fn new(session: SessionData, time_service: Arc<dyn TimeService>) -> Self {
        Self {
            session,
            time_service,
            last_quality_calc: parking_lot::Mutex::new(BTreeMap::new()),
            throttle: std::time::Duration::from_millis(200),
        }
    }

    /// Recompute quality/gaps for one (symbol, base interval) pair. Only
    /// called for base intervals per spec §4.6's last bullet; derived
    /// propagation happens separately in `propagate_to_derived`.
    pub fn recalculate(&self, symbol: &str, base_interval: Interval) {
        if !self.should_recalculate(symbol, base_interval) {
            return;
        }
        let bars = self.session.get_bars_ref(symbol, base_interval, true);
        let Some(date) = self.session.session_date() else { return };

        let (quality, gaps) = match base_interval {
            Interval::Bar { count: 1, unit: Unit::Day } | Interval::Bar { unit: Unit::Week, .. } => {
                self.score_calendar_interval(base_interval, &bars, date)
            }
            _ => self.score_intraday(base_interval, &bars, date),
        };

        self.session.set_quality(symbol, base_interval, quality);
        self.session.set_gaps(symbol, base_interval, gaps);
        self.propagate_to_derived(symbol, base_interval, quality);
    }

    fn should_recalculate(&self, symbol: &str, interval: Interval) -> bool {
        let mut throttles = self.last_quality_calc.lock();
        let key = (symbol.to_string(), interval);
        let now = Instant::now();
        match throttles.get(&key) {
            Some(last) if now.duration_since(*last) < self.throttle => false,
            _ => {
                throttles.insert(key, now);
                true
            }
        }
    }

    /// Sub-daily quality: `actual_bars / expected_bars * 100` over the
    /// session window, expected bars computed from market hours.
    fn score_intraday(&self, interval: Interval, bars: &[Bar], date: chrono::NaiveDate) -> (f64, Vec<GapInfo>) {
        let Some(session) = self.time_service.get_trading_session(date) else {
            return (0.0, Vec::new());
        };
        let period = interval.nominal_seconds().unwrap_or(60) * crate::clock::NANOS_PER_SEC;
        let expected = ((session.regular_close - session.regular_open) / period).max(0) as f64 + 1.0;
        let actual = bars.len() as f64;
        let quality = (actual / expected * 100.0).min(100.0);

        let mut gaps = Vec::new();
        for pair in bars.windows(2) {
            let delta = pair[1].timestamp - pair[0].timestamp;
            if delta > period {
                let missing = (delta / period).saturating_sub(1) as u32;
                gaps.push(GapInfo { start_time: pair[0].timestamp, end_time: pair[1].timestamp, missing_count: missing });
            }
        }
        (quality, gaps)
    }

    /// Daily/weekly quality: `actual_trading_days / expected_trading_days
    /// * 100`; gaps are missing trading days/weeks rather than minute
    /// gaps (spec §4.6, last bullet). A week counts as "expected" if it
    /// contains at least one trading day, since `TimeService` only
    /// exposes per-day queries (resolved Open Question, see DESIGN.md).
    fn score_calendar_interval(&self, _interval: Interval, bars: &[Bar], date: chrono::NaiveDate) -> (f64, Vec<GapInfo>) {
        let session_start = bars.first().map(|b| crate::clock::nanos_to_datetime(b.timestamp).date_naive()).unwrap_or(date);
        let expected = self.time_service.count_trading_days(session_start, date).max(1) as f64;
        let actual = bars.len() as f64;
        let quality = (actual / expected * 100.0).min(100.0);
        (quality, Vec::new())
    }

    fn propagate_to_derived(&self, symbol: &str, base_interval: Interval, quality: f64) {
        for (sym, derived_intervals) in self.session.get_symbols_with_derived() {
            if sym != symbol {
                continue;
            }
            for derived in derived_intervals {
                if derived.required_base() == Some(base_interval) {
                    self.session.set_quality(symbol, derived, quality);
                }
            }
        }
    }
}
