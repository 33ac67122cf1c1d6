//! End-to-end scenario tests exercising `SessionCoordinator` end to end
//! against an in-memory `DataSource` fake.

use async_trait::async_trait;
use chrono::NaiveDate;
use session_engine::{
    Bar, ClockMode, DataSource, EngineClock, EngineError, ExchangeCalendar, Interval, SessionConfig, SessionCoordinator,
};
use session_engine::config::{BacktestConfig, SessionDataConfig, SessionMode, StreamingConfig};
use session_engine::provisioning::SymbolRequest;
use session_engine::session_data::AddedBy;
use std::collections::BTreeMap;
use std::sync::Arc;

struct FakeDataSource {
    historical: parking_lot::Mutex<BTreeMap<String, Vec<Bar>>>,
}

impl FakeDataSource {
    fn new() -> Self {
        Self { historical: parking_lot::Mutex::new(BTreeMap::new()) }
    }

    fn with_history(self, symbol: &str, bars: Vec<Bar>) -> Self {
        self.historical.lock().insert(symbol.to_string(), bars);
        self
    }
}

#[async_trait]
impl DataSource for FakeDataSource {
    async fn load_historical_bars(&self, symbol: &str, _interval: Interval, _start: NaiveDate, _end: NaiveDate) -> anyhow::Result<Vec<Bar>> {
        Ok(self.historical.lock().get(symbol).cloned().unwrap_or_default())
    }
    async fn stream_bars(&self, _symbols: &[String], _intervals: &[Interval]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn write_bars(&self, _bars: &[Bar], _interval: Interval, _symbol: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn read_bars(&self, _interval: Interval, _symbol: &str, _start: NaiveDate, _end: NaiveDate) -> anyhow::Result<Vec<Bar>> {
        Ok(Vec::new())
    }
}

fn minute_bar(hour: i64, minute: i64, close: f64, volume: i64) -> Bar {
    let ts = (hour * 3600 + minute * 60) * session_engine::clock::NANOS_PER_SEC;
    Bar::new(ts, close - 0.5, close + 0.5, close - 1.0, close, volume)
}

fn base_config(symbols: Vec<&str>, streams: Vec<&str>) -> SessionConfig {
    SessionConfig {
        mode: SessionMode::Backtest,
        exchange_group: "US_EQUITY".into(),
        backtest_config: Some(BacktestConfig { start_date: NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(), end_date: NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(), speed_multiplier: 0.0 }),
        session_data_config: SessionDataConfig {
            symbols: symbols.into_iter().map(String::from).collect(),
            streams: streams.into_iter().map(String::from).collect(),
            historical: None,
            streaming: StreamingConfig { catchup_threshold_seconds: 60, catchup_check_interval: 10 },
            indicators: Default::default(),
        },
    }
}

fn calendar() -> Arc<ExchangeCalendar> {
    Arc::new(ExchangeCalendar::new(chrono_tz::America::New_York, ClockMode::Backtest))
}

/// Scenario A — single-symbol 1m stream, 3 bars; 5m incomplete until
/// session close flushes the trailing partial period.
#[tokio::test]
async fn scenario_a_single_symbol_stream_and_session_close_flush() {
    let config = base_config(vec!["AAPL"], vec!["1m", "5m"]);
    let data_source = Arc::new(FakeDataSource::new());
    let coordinator = SessionCoordinator::new(session_engine::SessionData::new(), data_source, calendar(), config);

    coordinator.validate_streams().unwrap();
    coordinator.initialize_session(&["AAPL".to_string()], &[Interval::parse("1m").unwrap(), Interval::parse("5m").unwrap()]).await.unwrap();

    let base = Interval::parse("1m").unwrap();
    let derived = Interval::parse("5m").unwrap();
    let bars = vec![
        minute_bar(9, 30, 100.5, 1000),
        minute_bar(9, 31, 100.8, 800),
        minute_bar(9, 32, 101.0, 1200),
    ];
    coordinator.load_queue("AAPL", base, bars);

    let mut clock = EngineClock::backtest(0);
    let iterations = coordinator.run_streaming_loop(&mut clock).await;
    assert_eq!(iterations, 3);

    assert_eq!(coordinator.session().get_bars_ref("AAPL", base, true).len(), 3);
    coordinator.data_processor().poll_once();
    assert_eq!(coordinator.session().get_bars_ref("AAPL", derived, true).len(), 0, "5m period incomplete");

    coordinator.end_session(NaiveDate::from_ymd_opt(2026, 1, 2).unwrap());
    // roll_session archives current bars; the flush happened before the roll.
}

/// Scenario B — provisioning failure for one symbol does not block the
/// batch; the batch only fails if every symbol fails.
#[tokio::test]
async fn scenario_b_provisioning_failure_drops_one_symbol() {
    let config = base_config(vec!["AAPL", "INVALID", "MSFT"], vec!["1m"]);
    let data_source = Arc::new(
        FakeDataSource::new()
            .with_history("AAPL", vec![Bar::new(0, 1.0, 1.0, 1.0, 1.0, 1)])
            .with_history("MSFT", vec![Bar::new(0, 1.0, 1.0, 1.0, 1.0, 1)]),
    );
    let session = session_engine::SessionData::new();
    let coordinator = SessionCoordinator::new(session, data_source, calendar(), config);

    // This config requires historical data (needs_historical derives from
    // session_data_config.historical.enabled, which defaults to false in
    // base_config — force the requirement through a direct provisioning
    // call so INVALID is actually exercised).
    let executor = session_engine::ProvisioningExecutor::new(
        coordinator.session().clone(),
        Arc::new(
            FakeDataSource::new()
                .with_history("AAPL", vec![Bar::new(0, 1.0, 1.0, 1.0, 1.0, 1)])
                .with_history("MSFT", vec![Bar::new(0, 1.0, 1.0, 1.0, 1.0, 1)]),
        ),
        calendar(),
    );
    let requests = ["AAPL", "INVALID", "MSFT"]
        .iter()
        .map(|s| SymbolRequest { symbol: s.to_string(), added_by: AddedBy::Config, streams: vec![Interval::parse("1m").unwrap()], indicators: Vec::new(), needs_historical: true })
        .collect();
    let (outcomes, failures) = executor.provision_batch(requests).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].symbol, "INVALID");
    assert!(coordinator.session().symbol_exists("AAPL"));
    assert!(coordinator.session().symbol_exists("MSFT"));
    assert!(!coordinator.session().symbol_exists("INVALID"));
}

/// Scenario C — mid-session adhoc bar, then an upgrade to full symbol;
/// the pre-existing adhoc bar survives the upgrade.
#[tokio::test]
async fn scenario_c_adhoc_then_upgrade_preserves_bar() {
    let config = base_config(vec![], vec!["1m"]);
    let data_source = Arc::new(FakeDataSource::new().with_history("TSLA", vec![Bar::new(0, 1.0, 1.0, 1.0, 1.0, 1)]));
    let coordinator = SessionCoordinator::new(session_engine::SessionData::new(), data_source, calendar(), config);

    let base = Interval::parse("1m").unwrap();
    coordinator.add_adhoc_bar("TSLA", base, minute_bar(12, 0, 200.0, 500)).unwrap();

    let meta = coordinator.session().with_symbol("TSLA", |s| s.metadata.clone()).unwrap();
    assert_eq!(meta.added_by, AddedBy::Adhoc);
    assert!(meta.auto_provisioned);
    assert!(!meta.meets_session_config_requirements);

    coordinator.add_symbol(SymbolRequest { symbol: "TSLA".to_string(), added_by: AddedBy::Strategy, streams: vec![base], indicators: Vec::new(), needs_historical: true });
    // process_pending_symbols runs at the top of run_streaming_loop; with
    // no queued bars the loop exits after the pending-symbol pass.
    let mut clock = EngineClock::backtest(0);
    coordinator.run_streaming_loop(&mut clock).await;

    let meta = coordinator.session().with_symbol("TSLA", |s| s.metadata.clone()).unwrap();
    assert!(meta.meets_session_config_requirements);
    assert!(meta.upgraded_from_adhoc);
    assert_eq!(coordinator.session().get_bars_ref("TSLA", base, true).len(), 1, "pre-existing adhoc bar preserved");
}

/// Scenario D — the streaming loop drives virtual time from the earliest
/// queued bar's own timestamp, so a bar processed this iteration is never
/// lagging against this same iteration's virtual time: the loop alone
/// cannot manufacture real lag. This exercises the loop end to end and
/// asserts the (honest) consequence — a normally-advancing single symbol
/// never trips lag gating. The actual lag-gating state machine (a check
/// genuinely finding lag, versus a skipped check that must not be mistaken
/// for catching up) is covered directly against
/// `check_lag_for_processed_symbols` in `coordinator.rs`'s own test module.
#[tokio::test]
async fn scenario_d_normal_streaming_never_trips_lag_gating() {
    let config = base_config(vec!["TSLA"], vec!["1m"]);
    let data_source = Arc::new(FakeDataSource::new());
    let coordinator = SessionCoordinator::new(session_engine::SessionData::new(), data_source, calendar(), config);
    coordinator.initialize_session(&["TSLA".to_string()], &[Interval::parse("1m").unwrap()]).await.unwrap();

    let base = Interval::parse("1m").unwrap();
    coordinator.load_queue(
        "TSLA",
        base,
        vec![minute_bar(9, 30, 100.0, 100), minute_bar(9, 31, 100.2, 120), minute_bar(9, 32, 100.4, 90)],
    );

    let mut clock = EngineClock::backtest(0);
    let iterations = coordinator.run_streaming_loop(&mut clock).await;

    assert_eq!(iterations, 3);
    assert!(coordinator.session().is_session_active());
}

/// Scenario F — hourly streams are rejected at Phase 0, before any
/// symbol is touched.
#[tokio::test]
async fn scenario_f_hourly_rejected_at_validation() {
    let config = base_config(vec!["AAPL"], vec!["1h"]);
    let data_source = Arc::new(FakeDataSource::new());
    let coordinator = SessionCoordinator::new(session_engine::SessionData::new(), data_source, calendar(), config);

    let err = coordinator.validate_streams().unwrap_err();
    match err {
        EngineError::InvalidInterval { reason, .. } => assert!(reason.contains("use minute intervals")),
        other => panic!("expected InvalidInterval, got {other:?}"),
    }
}

/// Scenario E — teardown clears all symbols; a symbol added mid-day does
/// not survive into the next day's initialization.
#[tokio::test]
async fn scenario_e_teardown_drops_mid_session_additions() {
    let config = base_config(vec!["AAPL"], vec!["1m"]);
    let data_source = Arc::new(FakeDataSource::new().with_history("TSLA", vec![Bar::new(0, 1.0, 1.0, 1.0, 1.0, 1)]));
    let coordinator = SessionCoordinator::new(session_engine::SessionData::new(), data_source, calendar(), config);

    coordinator.initialize_session(&["AAPL".to_string()], &[Interval::parse("1m").unwrap()]).await.unwrap();
    coordinator.add_adhoc_bar("TSLA", Interval::parse("1m").unwrap(), minute_bar(12, 0, 100.0, 10)).unwrap();
    assert!(coordinator.session().symbol_exists("TSLA"));

    coordinator.teardown(NaiveDate::from_ymd_opt(2026, 1, 3).unwrap());
    assert!(!coordinator.session().symbol_exists("TSLA"));
    assert!(!coordinator.session().symbol_exists("AAPL"));

    coordinator.initialize_session(&["AAPL".to_string()], &[Interval::parse("1m").unwrap()]).await.unwrap();
    assert!(coordinator.session().symbol_exists("AAPL"));
    assert!(!coordinator.session().symbol_exists("TSLA"));
}
