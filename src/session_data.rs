//! `SessionData` — the single source of truth (spec §3, §4.4).
//!
//! Guarded by one `parking_lot::RwLock`, the same pattern
//! `cooprefr-bettersys`'s `AppState` uses for its process-wide shared
//! state: writers (`append_bar`, `register_symbol`, `set_quality`) take
//! the write lock, readers (`get_bars`, `get_indicator`) take the read
//! lock, and no critical section spans an `.await`. There is no secondary
//! index anywhere in the system of "which symbols are active" — per spec
//! §9's explicit pitfall warning, `get_active_symbols()` is always derived
//! from `symbols.keys()`.

use crate::bar::{Bar, BarIntervalData, GapInfo, HistoricalBars};
use crate::clock::Nanos;
use crate::error::EngineError;
use crate::indicator::IndicatorData;
use crate::interval::Interval;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddedBy {
    Config,
    Strategy,
    Scanner,
    Adhoc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub bars_processed: u64,
    pub volume: i64,
    pub high: f64,
    pub low: f64,
}

impl SessionMetrics {
    pub fn observe(&mut self, bar: &Bar) {
        self.bars_processed += 1;
        self.volume += bar.volume;
        self.high = if self.bars_processed == 1 { bar.high } else { self.high.max(bar.high) };
        self.low = if self.bars_processed == 1 { bar.low } else { self.low.min(bar.low) };
    }

    pub fn reset(&mut self) {
        *self = SessionMetrics::default();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoricalData {
    pub bars: BTreeMap<Interval, HistoricalBars>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMetadata {
    pub meets_session_config_requirements: bool,
    pub added_by: AddedBy,
    pub auto_provisioned: bool,
    pub added_at: Nanos,
    pub upgraded_from_adhoc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSessionData {
    pub symbol: String,
    pub base_interval: Interval,
    pub bars: BTreeMap<Interval, BarIntervalData>,
    pub indicators: BTreeMap<String, IndicatorData>,
    pub metrics: SessionMetrics,
    pub historical: HistoricalData,
    pub metadata: SymbolMetadata,
}

impl SymbolSessionData {
    pub fn new(symbol: String, base_interval: Interval, capacity: usize, metadata: SymbolMetadata) -> Self {
        let mut bars = BTreeMap::new();
        bars.insert(base_interval, BarIntervalData::new_base(base_interval, capacity));
        Self {
            symbol,
            base_interval,
            bars,
            indicators: BTreeMap::new(),
            metrics: SessionMetrics::default(),
            historical: HistoricalData::default(),
            metadata,
        }
    }

    pub fn ensure_derived(&mut self, interval: Interval, capacity: usize) -> &mut BarIntervalData {
        self.bars
            .entry(interval)
            .or_insert_with(|| BarIntervalData::new_derived(interval, self.base_interval, capacity))
    }

    pub fn intervals_with_derived(&self) -> Vec<Interval> {
        self.bars.values().filter(|b| b.derived).map(|b| b.interval).collect()
    }
}

/// Read-only JSON projection of one symbol's state (spec §6.4).
#[derive(Debug, Clone, Serialize)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub base_interval: Interval,
    pub bars: BTreeMap<Interval, BarIntervalData>,
    pub indicators: BTreeMap<String, IndicatorData>,
    pub metrics: SessionMetrics,
    pub metadata: SymbolMetadata,
}

/// Read-only JSON projection of `SessionData`, consumed by external
/// analysis (spec §6.4). Taken under a single read-lock acquisition so no
/// half-updated symbol is ever observable.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_active: bool,
    pub session_date: Option<chrono::NaiveDate>,
    pub symbols: BTreeMap<String, SymbolSnapshot>,
}

#[derive(Debug, Default)]
struct SessionState {
    symbols: BTreeMap<String, SymbolSessionData>,
    session_active: bool,
    session_date: Option<chrono::NaiveDate>,
}

/// Process-wide snapshot. Cheaply cloneable (`Arc`-backed); every clone
/// shares the same lock and the same underlying state.
#[derive(Clone)]
pub struct SessionData {
    inner: Arc<RwLock<SessionState>>,
}

impl Default for SessionData {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionData {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(SessionState::default())) }
    }

    pub fn register_symbol(&self, data: SymbolSessionData) {
        let mut state = self.inner.write();
        state.symbols.insert(data.symbol.clone(), data);
    }

    pub fn remove_symbol(&self, symbol: &str) {
        let mut state = self.inner.write();
        state.symbols.remove(symbol);
    }

    pub fn clear(&self) {
        let mut state = self.inner.write();
        state.symbols.clear();
    }

    pub fn set_session_active(&self, active: bool) {
        self.inner.write().session_active = active;
    }

    pub fn is_session_active(&self) -> bool {
        self.inner.read().session_active
    }

    pub fn activate_session(&self) {
        self.set_session_active(true);
    }

    pub fn deactivate_session(&self) {
        self.set_session_active(false);
    }

    pub fn set_session_date(&self, date: chrono::NaiveDate) {
        self.inner.write().session_date = Some(date);
    }

    pub fn session_date(&self) -> Option<chrono::NaiveDate> {
        self.inner.read().session_date
    }

    pub fn symbol_exists(&self, symbol: &str) -> bool {
        self.inner.read().symbols.contains_key(symbol)
    }

    /// Derived purely from `symbols.keys()` — no duplicate tracking
    /// anywhere else in the system (spec §9).
    pub fn get_active_symbols(&self) -> Vec<String> {
        self.inner.read().symbols.keys().cloned().collect()
    }

    /// For each symbol, the list of intervals with `derived=true`.
    pub fn get_symbols_with_derived(&self) -> Vec<(String, Vec<Interval>)> {
        self.inner
            .read()
            .symbols
            .iter()
            .map(|(sym, data)| (sym.clone(), data.intervals_with_derived()))
            .collect()
    }

    /// Appends a bar and sets `bars[interval].updated = true`. Enforces
    /// strictly increasing timestamps per interval (invariant 2, spec §3).
    pub fn append_bar(&self, symbol: &str, interval: Interval, bar: Bar) -> Result<(), EngineError> {
        let mut state = self.inner.write();
        let sym_data = state
            .symbols
            .get_mut(symbol)
            .ok_or_else(|| EngineError::SymbolNotFound(symbol.to_string()))?;
        let capacity = sym_data
            .bars
            .get(&interval)
            .map(|b| b.capacity)
            .unwrap_or(390);
        let is_base = interval == sym_data.base_interval;
        let entry = sym_data.bars.entry(interval).or_insert_with(|| {
            if is_base {
                BarIntervalData::new_base(interval, capacity)
            } else {
                BarIntervalData::new_derived(interval, sym_data.base_interval, capacity)
            }
        });
        let overflowed = entry.append(bar).map_err(|(new_ts, last_ts)| EngineError::OutOfOrderBar {
            symbol: symbol.to_string(),
            interval,
            new_ts,
            last_ts,
        })?;
        if let Some(old) = overflowed {
            let date = crate::clock::nanos_to_datetime(old.timestamp).date_naive();
            sym_data.historical.bars.entry(interval).or_default().by_date.entry(date).or_default().push(old);
        }
        if is_base {
            sym_data.metrics.observe(&bar);
        }
        Ok(())
    }

    /// Zero-copy-in-spirit reference read: external callers (`internal =
    /// false`) get nothing back while the session is inactive (spec §4.4,
    /// §4.7.4); internal readers (`DataProcessor`, `QualityManager`)
    /// always see current state.
    pub fn get_bars_ref(&self, symbol: &str, interval: Interval, internal: bool) -> Vec<Bar> {
        let state = self.inner.read();
        if !internal && !state.session_active {
            return Vec::new();
        }
        state
            .symbols
            .get(symbol)
            .and_then(|s| s.bars.get(&interval))
            .map(|b| b.data.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get_bars(
        &self,
        symbol: &str,
        interval: Interval,
        since: Option<Nanos>,
        limit: Option<usize>,
        internal: bool,
    ) -> Vec<Bar> {
        let mut bars = self.get_bars_ref(symbol, interval, internal);
        if let Some(since) = since {
            bars.retain(|b| b.timestamp >= since);
        }
        if let Some(limit) = limit {
            if bars.len() > limit {
                let start = bars.len() - limit;
                bars = bars[start..].to_vec();
            }
        }
        bars
    }

    pub fn clear_updated(&self, symbol: &str, interval: Interval) {
        let mut state = self.inner.write();
        if let Some(sym) = state.symbols.get_mut(symbol) {
            if let Some(bar_data) = sym.bars.get_mut(&interval) {
                bar_data.updated = false;
            }
        }
    }

    pub fn is_updated(&self, symbol: &str, interval: Interval) -> bool {
        self.inner
            .read()
            .symbols
            .get(symbol)
            .and_then(|s| s.bars.get(&interval))
            .map(|b| b.updated)
            .unwrap_or(false)
    }

    pub fn set_quality(&self, symbol: &str, interval: Interval, quality: f64) {
        let mut state = self.inner.write();
        if let Some(sym) = state.symbols.get_mut(symbol) {
            if let Some(bar_data) = sym.bars.get_mut(&interval) {
                bar_data.quality = quality;
            }
        }
    }

    pub fn get_quality(&self, symbol: &str, interval: Interval) -> Option<f64> {
        self.inner.read().symbols.get(symbol).and_then(|s| s.bars.get(&interval)).map(|b| b.quality)
    }

    pub fn set_gaps(&self, symbol: &str, interval: Interval, gaps: Vec<GapInfo>) {
        let mut state = self.inner.write();
        if let Some(sym) = state.symbols.get_mut(symbol) {
            if let Some(bar_data) = sym.bars.get_mut(&interval) {
                bar_data.gaps = gaps;
            }
        }
    }

    pub fn get_indicator(&self, symbol: &str, key: &str) -> Option<IndicatorData> {
        self.inner.read().symbols.get(symbol).and_then(|s| s.indicators.get(key)).cloned()
    }

    pub fn set_indicator(&self, symbol: &str, key: String, data: IndicatorData) {
        let mut state = self.inner.write();
        if let Some(sym) = state.symbols.get_mut(symbol) {
            sym.indicators.insert(key, data);
        }
    }

    pub fn with_symbol_mut<R>(&self, symbol: &str, f: impl FnOnce(&mut SymbolSessionData) -> R) -> Option<R> {
        let mut state = self.inner.write();
        state.symbols.get_mut(symbol).map(f)
    }

    pub fn with_symbol<R>(&self, symbol: &str, f: impl FnOnce(&SymbolSessionData) -> R) -> Option<R> {
        let state = self.inner.read();
        state.symbols.get(symbol).map(f)
    }

    /// Archive current-session bars into `historical`, reset per-symbol
    /// metrics, reset indicator *values* to invalid while leaving
    /// indicator *structures* (config + internal state objects) in place
    /// — spec invariant 6: historical indicator values are never
    /// recomputed on rollover, only session-reset.
    pub fn roll_session(&self, new_date: chrono::NaiveDate) {
        let mut state = self.inner.write();
        for sym in state.symbols.values_mut() {
            for (interval, bar_data) in sym.bars.iter_mut() {
                if !bar_data.data.is_empty() {
                    let entry = sym.historical.bars.entry(*interval).or_default();
                    for bar in bar_data.data.drain(..) {
                        let date = crate::clock::nanos_to_datetime(bar.timestamp).date_naive();
                        entry.by_date.entry(date).or_default().push(bar);
                    }
                }
                bar_data.updated = false;
                bar_data.gaps.clear();
                bar_data.quality = 0.0;
            }
            sym.metrics.reset();
            for indicator in sym.indicators.values_mut() {
                indicator.valid = false;
                indicator.current_value = None;
                indicator.state = Default::default();
            }
        }
        state.session_date = Some(new_date);
        state.session_active = false;
    }

    /// Builds the read-only projection consumed by external analysis
    /// (spec §6.4). A single read-lock acquisition over every symbol, so
    /// the snapshot is internally consistent even under concurrent writes.
    pub fn to_snapshot(&self) -> SessionSnapshot {
        let state = self.inner.read();
        let symbols = state
            .symbols
            .iter()
            .map(|(symbol, data)| {
                (
                    symbol.clone(),
                    SymbolSnapshot {
                        symbol: data.symbol.clone(),
                        base_interval: data.base_interval,
                        bars: data.bars.clone(),
                        indicators: data.indicators.clone(),
                        metrics: data.metrics.clone(),
                        metadata: data.metadata.clone(),
                    },
                )
            })
            .collect();
        SessionSnapshot { session_active: state.session_active, session_date: state.session_date, symbols }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::NANOS_PER_SEC;

    fn metadata() -> SymbolMetadata {
        SymbolMetadata {
            meets_session_config_requirements: true,
            added_by: AddedBy::Config,
            auto_provisioned: false,
            added_at: 0,
            upgraded_from_adhoc: false,
        }
    }

    fn bar(secs: i64) -> Bar {
        Bar::new(secs * NANOS_PER_SEC, 1.0, 1.0, 1.0, 1.0, 100)
    }

    #[test]
    fn append_bar_rejects_out_of_order() {
        let session = SessionData::new();
        let base = Interval::parse("1m").unwrap();
        session.register_symbol(SymbolSessionData::new("AAPL".into(), base, 10, metadata()));
        session.append_bar("AAPL", base, bar(100)).unwrap();
        let err = session.append_bar("AAPL", base, bar(100));
        assert!(matches!(err, Err(EngineError::OutOfOrderBar { .. })));
        assert_eq!(session.get_bars_ref("AAPL", base, true).len(), 1);
    }

    #[test]
    fn external_reads_empty_when_session_inactive() {
        let session = SessionData::new();
        let base = Interval::parse("1m").unwrap();
        session.register_symbol(SymbolSessionData::new("AAPL".into(), base, 10, metadata()));
        session.append_bar("AAPL", base, bar(100)).unwrap();
        session.deactivate_session();
        assert!(session.get_bars("AAPL", base, None, None, false).is_empty());
        assert_eq!(session.get_bars("AAPL", base, None, None, true).len(), 1);
        session.activate_session();
        assert_eq!(session.get_bars("AAPL", base, None, None, false).len(), 1);
    }

    #[test]
    fn remove_symbol_clears_all_structures() {
        let session = SessionData::new();
        let base = Interval::parse("1m").unwrap();
        session.register_symbol(SymbolSessionData::new("AAPL".into(), base, 10, metadata()));
        session.remove_symbol("AAPL");
        assert!(!session.get_active_symbols().contains(&"AAPL".to_string()));
        assert!(session.get_bars_ref("AAPL", base, true).is_empty());
    }

    #[test]
    fn roll_session_archives_bars_and_resets_metrics() {
        let session = SessionData::new();
        let base = Interval::parse("1m").unwrap();
        session.register_symbol(SymbolSessionData::new("AAPL".into(), base, 10, metadata()));
        session.append_bar("AAPL", base, bar(100)).unwrap();
        session.roll_session(chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap());
        assert!(session.get_bars_ref("AAPL", base, true).is_empty());
        let archived = session.with_symbol("AAPL", |s| s.historical.bars.get(&base).map(|h| h.by_date.len())).flatten();
        assert_eq!(archived, Some(1));
    }

    #[test]
    fn to_snapshot_reflects_current_state_and_serializes() {
        let session = SessionData::new();
        let base = Interval::parse("1m").unwrap();
        session.register_symbol(SymbolSessionData::new("AAPL".into(), base, 10, metadata()));
        session.append_bar("AAPL", base, bar(100)).unwrap();
        session.activate_session();

        let snapshot = session.to_snapshot();
        assert!(snapshot.session_active);
        let aapl = snapshot.symbols.get("AAPL").expect("AAPL present in snapshot");
        assert_eq!(aapl.base_interval, base);
        assert_eq!(aapl.metrics.bars_processed, 1);
        serde_json::to_string(&snapshot).expect("snapshot must serialize to JSON");
    }

    #[test]
    fn roll_session_twice_is_idempotent_beyond_valid_flags() {
        let session = SessionData::new();
        let base = Interval::parse("1m").unwrap();
        session.register_symbol(SymbolSessionData::new("AAPL".into(), base, 10, metadata()));
        session.roll_session(chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap());
        session.roll_session(chrono::NaiveDate::from_ymd_opt(2026, 1, 3).unwrap());
        assert!(session.get_bars_ref("AAPL", base, true).is_empty());
    }
}
