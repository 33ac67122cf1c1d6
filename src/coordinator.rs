//! `SessionCoordinator` — the chronological event loop (spec §4.7).
//!
//! Owns the per-(symbol,interval) bar queues, the virtual clock,
//! `_pending_symbols`, and the lag-detection counters. Drains queues in
//! timestamp order, advances the clock, and gates external readers via
//! `SessionData::deactivate_session` when any processed symbol falls
//! behind `catchup_threshold_seconds`.

use crate::bar::Bar;
use crate::clock::{EngineClock, Nanos};
use crate::config::SessionConfig;
use crate::data_processor::DataProcessor;
use crate::data_source::DataSource;
use crate::events::{self, CoordinatorEvent};
use crate::interval::Interval;
use crate::provisioning::{ProvisioningExecutor, SymbolRequest};
use crate::quality::QualityManager;
use crate::requirement::IndicatorRequest;
use crate::session_data::{AddedBy, SessionData};
use crate::time_service::TimeService;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast::Sender;
use tracing::{error, info, warn};

/// A single queued bar awaiting drain, tagged with its (symbol, interval).
#[derive(Debug, Clone, Copy)]
struct QueuedBar {
    interval: Interval,
    bar: Bar,
}

pub struct SessionCoordinator {
    session: SessionData,
    data_source: Arc<dyn DataSource>,
    time_service: Arc<dyn TimeService>,
    events: Sender<CoordinatorEvent>,
    config: SessionConfig,
    queues: parking_lot::Mutex<BTreeMap<String, VecDeque<QueuedBar>>>,
    pending_symbols: parking_lot::Mutex<Vec<SymbolRequest>>,
    symbol_check_counters: parking_lot::Mutex<BTreeMap<String, u64>>,
    stream_paused: std::sync::atomic::AtomicBool,
    data_processor: DataProcessor,
    quality_manager: QualityManager,
}

impl SessionCoordinator {
    pub fn new(
        session: SessionData,
        data_source: Arc<dyn DataSource>,
        time_service: Arc<dyn TimeService>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = events::channel(256);
        let data_processor = DataProcessor::new(session.clone(), time_service.clone());
        let quality_manager = QualityManager::new(session.clone(), time_service.clone());
        Self {
            session,
            data_source,
            time_service,
            events,
            config,
            queues: parking_lot::Mutex::new(BTreeMap::new()),
            pending_symbols: parking_lot::Mutex::new(Vec::new()),
            symbol_check_counters: parking_lot::Mutex::new(BTreeMap::new()),
            stream_paused: std::sync::atomic::AtomicBool::new(false),
            data_processor,
            quality_manager,
        }
    }

    /// Exposes the coordinator's `DataProcessor` so a caller running the
    /// streaming loop and the derivation poll on separate tasks can
    /// still share the same consumption cursors.
    pub fn data_processor(&self) -> &DataProcessor {
        &self.data_processor
    }

    /// Exposes the shared `SessionData` snapshot (spec §4.4's read-only
    /// surface for downstream analysis).
    pub fn session(&self) -> &SessionData {
        &self.session
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Phase 0 — stream validation. Rejects hourly/contradictory/empty
    /// configurations up front, before any symbol is touched.
    pub fn validate_streams(&self) -> Result<Vec<Interval>, crate::error::EngineError> {
        events::emit(&self.events, CoordinatorEvent::PhaseStart { phase: "stream_validation".into() });
        let streams = self.config.parsed_streams()?;
        let indicators: Vec<IndicatorRequest> = Vec::new();
        crate::requirement::RequirementAnalyzer::analyze(&streams, &indicators)?;
        events::emit(&self.events, CoordinatorEvent::PhaseComplete { phase: "stream_validation".into() });
        Ok(streams)
    }

    /// Phase 1 — teardown. No cross-session persistence besides the
    /// config symbol list (spec §3 Lifecycle).
    pub fn teardown(&self, next_date: chrono::NaiveDate) {
        events::emit(&self.events, CoordinatorEvent::PhaseStart { phase: "teardown".into() });
        self.session.clear();
        self.queues.lock().clear();
        self.symbol_check_counters.lock().clear();
        self.pending_symbols.lock().clear();
        self.session.set_session_date(next_date);
        events::emit(&self.events, CoordinatorEvent::PhaseComplete { phase: "teardown".into() });
    }

    /// Phase 2 — initialization: three-phase add for every config symbol.
    /// Fails the day if none survive.
    pub async fn initialize_session(&self, symbols: &[String], streams: &[Interval]) -> Result<(), crate::error::EngineError> {
        events::emit(&self.events, CoordinatorEvent::PhaseStart { phase: "initialization".into() });
        let executor = ProvisioningExecutor::new(self.session.clone(), self.data_source.clone(), self.time_service.clone());

        let requests: Vec<SymbolRequest> = symbols
            .iter()
            .map(|symbol| SymbolRequest {
                symbol: symbol.clone(),
                added_by: AddedBy::Config,
                streams: streams.to_vec(),
                indicators: Vec::new(),
                needs_historical: self.config.session_data_config.historical.as_ref().map(|h| h.enabled).unwrap_or(false),
            })
            .collect();

        let (outcomes, failures) = executor.provision_batch(requests).await?;
        for outcome in &outcomes {
            match outcome {
                crate::provisioning::ProvisioningOutcome::Created { symbol }
                | crate::provisioning::ProvisioningOutcome::Upgraded { symbol }
                | crate::provisioning::ProvisioningOutcome::ShortCircuited { symbol } => {
                    events::emit(&self.events, CoordinatorEvent::SymbolAdded { symbol: symbol.clone() });
                    self.queues.lock().entry(symbol.clone()).or_default();
                }
            }
        }
        for failure in failures {
            events::emit(&self.events, CoordinatorEvent::SymbolFailed { symbol: failure.symbol, reason: failure.reason });
        }

        self.session.activate_session();
        events::emit(&self.events, CoordinatorEvent::PhaseComplete { phase: "initialization".into() });
        Ok(())
    }

    pub fn load_queue(&self, symbol: &str, interval: Interval, bars: Vec<Bar>) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(symbol.to_string()).or_default();
        queue.extend(bars.into_iter().map(|bar| QueuedBar { interval, bar }));
    }

    /// Phase 3 — chronological streaming loop (spec §4.7.2). Returns the
    /// number of timestamps drained.
    pub async fn run_streaming_loop(&self, clock: &mut EngineClock) -> usize {
        let mut iterations = 0;
        loop {
            self.process_pending_symbols().await;

            let Some(t) = self.earliest_head_timestamp() else { break };
            self.time_service.set_virtual_time(t);
            clock.advance_to(t);

            let processed_symbols = self.process_bars_at(t);
            self.data_processor.poll_once();
            self.check_lag_for_processed_symbols(&processed_symbols, t);
            self.apply_speed_delay().await;
            iterations += 1;
        }
        iterations
    }

    fn earliest_head_timestamp(&self) -> Option<Nanos> {
        let queues = self.queues.lock();
        queues.values().filter_map(|q| q.front().map(|qb| qb.bar.timestamp)).min()
    }

    /// Pops every queue head with timestamp == `t` and appends it.
    /// Returns the symbols touched this iteration, for lag checking.
    /// Base-interval appends additionally trigger a (throttled) quality
    /// recalculation (spec §4.6) and an inline indicator update for any
    /// indicator configured directly on the base interval (spec §5:
    /// "indicator updates — executed inline by the data-processor task
    /// after each bar append"; derived-interval appends already trigger
    /// this from within `DataProcessor` itself).
    fn process_bars_at(&self, t: Nanos) -> Vec<(String, Bar)> {
        let mut touched = Vec::new();
        let mut base_appends = Vec::new();
        let mut queues = self.queues.lock();
        for (symbol, queue) in queues.iter_mut() {
            while let Some(head) = queue.front() {
                if head.bar.timestamp != t {
                    break;
                }
                let QueuedBar { interval, bar } = queue.pop_front().unwrap();
                match self.session.append_bar(symbol, interval, bar) {
                    Ok(()) => {
                        touched.push((symbol.clone(), bar));
                        if self.session.with_symbol(symbol, |s| s.base_interval) == Some(interval) {
                            base_appends.push((symbol.clone(), interval));
                        }
                    }
                    Err(e) => error!(symbol, %interval, error = %e, "out-of-order bar rejected"),
                }
            }
        }
        drop(queues);
        for (symbol, interval) in base_appends {
            self.quality_manager.recalculate(&symbol, interval);
            self.data_processor.update_indicators_for(&symbol, interval);
        }
        touched
    }

    /// Mid-session adds (spec §4.7.3): full adds queue in
    /// `_pending_symbols` and process under the `stream_paused` gate at
    /// the top of the next iteration — entered *before* the next
    /// timestamp is drained, never mid-timestamp (resolved Open Question,
    /// see DESIGN.md).
    async fn process_pending_symbols(&self) {
        let pending: Vec<SymbolRequest> = std::mem::take(&mut *self.pending_symbols.lock());
        if pending.is_empty() {
            return;
        }
        self.stream_paused.store(true, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let executor = ProvisioningExecutor::new(self.session.clone(), self.data_source.clone(), self.time_service.clone());
        match executor.provision_batch(pending).await {
            Ok((outcomes, failures)) => {
                for outcome in outcomes {
                    let symbol = match outcome {
                        crate::provisioning::ProvisioningOutcome::Created { symbol }
                        | crate::provisioning::ProvisioningOutcome::Upgraded { symbol }
                        | crate::provisioning::ProvisioningOutcome::ShortCircuited { symbol } => symbol,
                    };
                    events::emit(&self.events, CoordinatorEvent::SymbolAdded { symbol: symbol.clone() });
                    self.queues.lock().entry(symbol).or_default();
                }
                for failure in failures {
                    events::emit(&self.events, CoordinatorEvent::SymbolFailed { symbol: failure.symbol, reason: failure.reason });
                }
            }
            Err(e) => warn!(error = %e, "pending-symbol batch failed"),
        }

        self.stream_paused.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Queues a full add, processed at the top of the next iteration.
    pub fn add_symbol(&self, request: SymbolRequest) {
        self.pending_symbols.lock().push(request);
    }

    /// Adhoc bar addition: bypasses `_pending_symbols`, never pauses the
    /// stream (spec §4.7.3).
    pub fn add_adhoc_bar(&self, symbol: &str, interval: Interval, bar: Bar) -> Result<(), crate::error::EngineError> {
        let executor = ProvisioningExecutor::new(self.session.clone(), self.data_source.clone(), self.time_service.clone());
        let now = self.time_service.get_current_time();
        executor.add_adhoc_bar(symbol, interval, bar, now)
    }

    pub fn remove_symbol(&self, symbol: &str) {
        self.session.remove_symbol(symbol);
        self.queues.lock().remove(symbol);
        self.symbol_check_counters.lock().remove(symbol);
    }

    /// Lag detection (spec §4.7.4). Counter is checked *before*
    /// increment so counter 0 triggers on the very first processed bar
    /// of a symbol. Reactivation requires an actual recheck that found no
    /// lag this iteration — a round where every symbol's counter lands
    /// off the check boundary must leave the session exactly as it was
    /// ("on a subsequent *check* where all processed symbols are caught
    /// up, activate", spec §4.7.4), not reactivate by default.
    fn check_lag_for_processed_symbols(&self, processed: &[(String, Bar)], virtual_time: Nanos) {
        let streaming = &self.config.session_data_config.streaming;
        let mut any_checked = false;
        let mut any_lagging = false;
        let mut counters = self.symbol_check_counters.lock();

        for (symbol, bar) in processed {
            let counter = counters.entry(symbol.clone()).or_insert(0);
            let should_check = *counter % streaming.catchup_check_interval as u64 == 0;
            *counter += 1;

            if should_check {
                any_checked = true;
                let lag_seconds = (virtual_time - bar.timestamp) / crate::clock::NANOS_PER_SEC;
                if lag_seconds > streaming.catchup_threshold_seconds {
                    any_lagging = true;
                    events::emit(&self.events, CoordinatorEvent::LagDetected { symbol: symbol.clone(), lag_seconds });
                }
            }
        }
        drop(counters);

        if any_lagging {
            if self.session.is_session_active() {
                self.session.deactivate_session();
                events::emit(&self.events, CoordinatorEvent::SessionDeactivated);
            }
        } else if any_checked && !processed.is_empty() && !self.session.is_session_active() {
            self.session.activate_session();
            events::emit(&self.events, CoordinatorEvent::SessionActivated);
        }
    }

    /// Clock-driven mode: sleep `60 / speed_multiplier` seconds per
    /// minute of virtual advance. `speed_multiplier == 0` is data-driven
    /// (no delay).
    async fn apply_speed_delay(&self) {
        let multiplier = self.config.backtest_config.as_ref().map(|b| b.speed_multiplier).unwrap_or(0.0);
        if multiplier <= 0.0 {
            return;
        }
        let delay = std::time::Duration::from_secs_f64(60.0 / multiplier / 60.0);
        if delay.as_millis() >= 1 {
            tokio::time::sleep(delay).await;
        }
    }

    /// Phase 4 — session end. Flushes any trailing incomplete derived
    /// periods, marks the session inactive, rolls current bars into
    /// historical, and emits `SessionEnd`.
    pub fn end_session(&self, date: chrono::NaiveDate) {
        events::emit(&self.events, CoordinatorEvent::PhaseStart { phase: "session_end".into() });
        let flushed = self.data_processor.flush_at_session_close();
        info!(flushed, "flushed trailing derived periods at session close");
        self.session.deactivate_session();
        self.session.roll_session(date);
        events::emit(&self.events, CoordinatorEvent::SessionEnd { date });
        events::emit(&self.events, CoordinatorEvent::PhaseComplete { phase: "session_end".into() });
    }

    pub fn is_stream_paused(&self) -> bool {
        self.stream_paused.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BacktestConfig, SessionDataConfig, SessionMode, StreamingConfig};
    use crate::time_service::ExchangeCalendar;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    struct EmptyDataSource;

    #[async_trait]
    impl DataSource for EmptyDataSource {
        async fn load_historical_bars(&self, _s: &str, _i: Interval, _a: NaiveDate, _b: NaiveDate) -> anyhow::Result<Vec<Bar>> {
            Ok(Vec::new())
        }
        async fn stream_bars(&self, _s: &[String], _i: &[Interval]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn write_bars(&self, _b: &[Bar], _i: Interval, _s: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn read_bars(&self, _i: Interval, _s: &str, _a: NaiveDate, _b: NaiveDate) -> anyhow::Result<Vec<Bar>> {
            Ok(Vec::new())
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            mode: SessionMode::Backtest,
            exchange_group: "US_EQUITY".into(),
            backtest_config: Some(BacktestConfig { start_date: NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(), end_date: NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(), speed_multiplier: 0.0 }),
            session_data_config: SessionDataConfig {
                symbols: vec!["AAPL".into()],
                streams: vec!["1m".into(), "5m".into()],
                historical: None,
                streaming: StreamingConfig { catchup_threshold_seconds: 60, catchup_check_interval: 10 },
                indicators: Default::default(),
            },
        }
    }

    fn coordinator() -> SessionCoordinator {
        let session = SessionData::new();
        let data_source = Arc::new(EmptyDataSource);
        let time_service = Arc::new(ExchangeCalendar::new(chrono_tz::America::New_York, crate::clock::ClockMode::Backtest));
        SessionCoordinator::new(session, data_source, time_service, config())
    }

    #[tokio::test]
    async fn empty_queue_completes_in_zero_iterations() {
        let coordinator = coordinator();
        let mut clock = EngineClock::backtest(0);
        let iterations = coordinator.run_streaming_loop(&mut clock).await;
        assert_eq!(iterations, 0);
    }

    #[tokio::test]
    async fn drains_queue_in_timestamp_order() {
        let coordinator = coordinator();
        coordinator.initialize_session(&["AAPL".to_string()], &[Interval::parse("1m").unwrap(), Interval::parse("5m").unwrap()]).await.unwrap();

        let base = Interval::parse("1m").unwrap();
        let bars = (0..3).map(|m| Bar::new(m * 60 * crate::clock::NANOS_PER_SEC, 100.0, 101.0, 99.0, 100.5, 1000)).collect();
        coordinator.load_queue("AAPL", base, bars);

        let mut clock = EngineClock::backtest(0);
        let iterations = coordinator.run_streaming_loop(&mut clock).await;
        assert_eq!(iterations, 3);
        assert_eq!(coordinator.session.get_bars_ref("AAPL", base, true).len(), 3);
    }

    #[test]
    fn lag_check_triggers_on_first_bar_of_each_symbol() {
        let coordinator = coordinator();
        coordinator.session.register_symbol(crate::session_data::SymbolSessionData::new(
            "AAPL".into(),
            Interval::parse("1m").unwrap(),
            10,
            crate::session_data::SymbolMetadata { meets_session_config_requirements: true, added_by: AddedBy::Config, auto_provisioned: false, added_at: 0, upgraded_from_adhoc: false },
        ));
        coordinator.session.activate_session();
        let old_bar = Bar::new(0, 1.0, 1.0, 1.0, 1.0, 1);
        coordinator.check_lag_for_processed_symbols(&[("AAPL".to_string(), old_bar)], 9000 * crate::clock::NANOS_PER_SEC);
        assert!(!coordinator.session.is_session_active());
    }

    /// Drives the counter past several non-check iterations while a
    /// symbol is genuinely lagging, then past the next check boundary
    /// once it has genuinely caught up. Reactivation must wait for the
    /// second boundary, not happen on any of the non-check rounds in
    /// between (`catchup_check_interval = 10` from `config()`).
    #[test]
    fn reactivation_requires_a_genuine_recheck_not_a_skipped_one() {
        let coordinator = coordinator();
        coordinator.session.register_symbol(crate::session_data::SymbolSessionData::new(
            "AAPL".into(),
            Interval::parse("1m").unwrap(),
            10,
            crate::session_data::SymbolMetadata { meets_session_config_requirements: true, added_by: AddedBy::Config, auto_provisioned: false, added_at: 0, upgraded_from_adhoc: false },
        ));
        coordinator.session.activate_session();

        let virtual_time = 9000 * crate::clock::NANOS_PER_SEC;
        let lagging_bar = Bar::new(0, 1.0, 1.0, 1.0, 1.0, 1);

        // counter=0: a real check, genuinely lagging -> deactivate.
        coordinator.check_lag_for_processed_symbols(&[("AAPL".to_string(), lagging_bar)], virtual_time);
        assert!(!coordinator.session.is_session_active());

        // counters 1..=9: none land on a check boundary (catchup_check_interval=10).
        // Still feeding the lagging bar, the session must stay deactivated
        // since no recheck ever runs here.
        for _ in 1..=9 {
            coordinator.check_lag_for_processed_symbols(&[("AAPL".to_string(), lagging_bar)], virtual_time);
            assert!(!coordinator.session.is_session_active(), "must not reactivate without an actual recheck finding no lag");
        }

        // counter=10: the next real check boundary. Feed a bar that is
        // actually caught up with virtual time -> genuine reactivation.
        let caught_up_bar = Bar::new(virtual_time, 1.0, 1.0, 1.0, 1.0, 1);
        coordinator.check_lag_for_processed_symbols(&[("AAPL".to_string(), caught_up_bar)], virtual_time);
        assert!(coordinator.session.is_session_active());
    }
}
