//! Three-phase provisioning (spec §4.3).
//!
//! Every symbol addition — pre-session config load, mid-session full add,
//! or adhoc bar/indicator — goes through the same analyze → validate →
//! provision pipeline. Adhoc additions skip historical loading, quality,
//! and non-requested indicators.

use crate::bar::Bar;
use crate::clock::Nanos;
use crate::data_source::DataSource;
use crate::indicator::{IndicatorConfig, IndicatorData, IndicatorRegistry, IndicatorState};
use crate::interval::Interval;
use crate::requirement::{IndicatorRequest, ProvisioningRequirements, RequirementAnalyzer};
use crate::session_data::{AddedBy, SessionData, SymbolMetadata, SymbolSessionData};
use crate::time_service::TimeService;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SymbolRequest {
    pub symbol: String,
    pub added_by: AddedBy,
    pub streams: Vec<Interval>,
    pub indicators: Vec<IndicatorRequest>,
    pub needs_historical: bool,
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum ProvisioningOutcome {
    Created { symbol: String },
    Upgraded { symbol: String },
    ShortCircuited { symbol: String },
}

/// Drives the three phases for a batch of symbol requests. Holds no
/// state of its own beyond its collaborators — `SessionData` is the
/// only durable state touched.
pub struct ProvisioningExecutor {
    session: SessionData,
    data_source: Arc<dyn DataSource>,
    time_service: Arc<dyn TimeService>,
    bars_per_interval_capacity: usize,
}

impl ProvisioningExecutor {
    pub fn new(session: SessionData, data_source: Arc<dyn DataSource>, time_service: Arc<dyn TimeService>) -> Self {
        Self { session, data_source, time_service, bars_per_interval_capacity: 390 }
    }

    /// Phase A + B + C for a batch of symbols. Per-symbol failures are
    /// dropped from `SessionData` but reported back to the caller (so the
    /// coordinator can emit `SymbolFailed`); if every symbol in the batch
    /// fails, returns `ErrAllSymbolsFailed`.
    pub async fn provision_batch(
        &self,
        requests: Vec<SymbolRequest>,
    ) -> Result<(Vec<ProvisioningOutcome>, Vec<ValidationError>), crate::error::EngineError> {
        let mut outcomes = Vec::new();
        let mut failures = Vec::new();

        for request in requests {
            match self.provision_one(request.clone()).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(symbol = %request.symbol, reason = %e.reason, "symbol dropped from provisioning batch");
                    failures.push(e);
                }
            }
        }

        if outcomes.is_empty() && !failures.is_empty() {
            return Err(crate::error::EngineError::AllSymbolsFailed);
        }
        Ok((outcomes, failures))
    }

    /// Phase A: build requirements. Phase B: validate. Phase C: provision
    /// and load. Returns the per-symbol validation failure without
    /// touching `SessionData` if Phase B rejects the symbol.
    async fn provision_one(&self, request: SymbolRequest) -> Result<ProvisioningOutcome, ValidationError> {
        // Phase A.
        let requirements = RequirementAnalyzer::analyze(&request.streams, &request.indicators).map_err(|e| ValidationError {
            symbol: request.symbol.clone(),
            reason: e.to_string(),
        })?;

        // Phase B.1 — already active?
        let existing = self.session.with_symbol(&request.symbol, |s| {
            (s.metadata.clone(), s.base_interval, s.bars.keys().copied().collect::<std::collections::BTreeSet<_>>())
        });
        let is_upgrade = matches!(&existing, Some((meta, _, _)) if !meta.meets_session_config_requirements);
        if let Some((meta, existing_base, tracked)) = &existing {
            if meta.meets_session_config_requirements {
                let requested: std::collections::BTreeSet<Interval> =
                    std::iter::once(requirements.base_interval).chain(requirements.derivable_intervals.iter().copied()).collect();
                if *existing_base != requirements.base_interval || !requested.is_subset(tracked) {
                    let err = crate::error::EngineError::DuplicateSymbol {
                        symbol: request.symbol.clone(),
                        reason: format!(
                            "active base {existing_base} / streams {tracked:?} incompatible with requested base {} / streams {requested:?}",
                            requirements.base_interval
                        ),
                    };
                    return Err(ValidationError { symbol: request.symbol.clone(), reason: err.to_string() });
                }
                return Ok(ProvisioningOutcome::ShortCircuited { symbol: request.symbol });
            }
        }

        // Phase B.2 — data-source availability, best-effort historical probe.
        if request.needs_historical {
            let today = self.time_service.local_date(self.time_service.get_current_time());
            let lookback = requirements
                .historical_lookback_days
                .values()
                .copied()
                .max()
                .unwrap_or(1);
            let start = today - chrono::Duration::days(lookback as i64);
            let historical = self
                .data_source
                .load_historical_bars(&request.symbol, requirements.base_interval, start, today)
                .await
                .map_err(|e| ValidationError { symbol: request.symbol.clone(), reason: format!("no_historical_data: {e}") })?;
            if historical.is_empty() {
                return Err(ValidationError { symbol: request.symbol.clone(), reason: "no_historical_data".into() });
            }
            return self.run_phase_c(request, requirements, is_upgrade, Some(historical)).await;
        }

        self.run_phase_c(request, requirements, is_upgrade, None).await
    }

    async fn run_phase_c(
        &self,
        request: SymbolRequest,
        requirements: ProvisioningRequirements,
        is_upgrade: bool,
        historical: Option<Vec<Bar>>,
    ) -> Result<ProvisioningOutcome, ValidationError> {
        let now = self.time_service.get_current_time();

        if is_upgrade {
            self.upgrade_symbol(&request, &requirements, historical, now);
            info!(symbol = %request.symbol, "symbol upgraded from adhoc");
            return Ok(ProvisioningOutcome::Upgraded { symbol: request.symbol });
        }

        self.create_symbol(&request, &requirements, historical, now);
        info!(symbol = %request.symbol, base = %requirements.base_interval, "symbol provisioned");
        Ok(ProvisioningOutcome::Created { symbol: request.symbol })
    }

    fn create_symbol(
        &self,
        request: &SymbolRequest,
        requirements: &ProvisioningRequirements,
        historical: Option<Vec<Bar>>,
        now: Nanos,
    ) {
        let metadata = SymbolMetadata {
            meets_session_config_requirements: true,
            added_by: request.added_by,
            auto_provisioned: matches!(request.added_by, AddedBy::Adhoc),
            added_at: now,
            upgraded_from_adhoc: false,
        };
        let mut data = SymbolSessionData::new(request.symbol.clone(), requirements.base_interval, self.bars_per_interval_capacity, metadata);
        for interval in &requirements.derivable_intervals {
            data.ensure_derived(*interval, self.bars_per_interval_capacity);
        }
        self.register_indicators(&mut data, &request.indicators);
        self.session.register_symbol(data);
        self.load_historical(&request.symbol, requirements.base_interval, historical);
    }

    fn upgrade_symbol(
        &self,
        request: &SymbolRequest,
        requirements: &ProvisioningRequirements,
        historical: Option<Vec<Bar>>,
        _now: Nanos,
    ) {
        self.session.with_symbol_mut(&request.symbol, |data| {
            for interval in &requirements.derivable_intervals {
                data.ensure_derived(*interval, self.bars_per_interval_capacity);
            }
            data.metadata.meets_session_config_requirements = true;
            data.metadata.upgraded_from_adhoc = true;
            data.metadata.added_by = request.added_by;
        });
        self.register_indicators_by_symbol(&request.symbol, &request.indicators);
        self.load_historical(&request.symbol, requirements.base_interval, historical);
    }

    fn register_indicators(&self, data: &mut SymbolSessionData, requests: &[IndicatorRequest]) {
        for req in requests {
            let key = IndicatorRegistry::key(&req.config);
            if IndicatorRegistry::build(&req.config).is_none() {
                warn!(indicator = %req.config.name, "unknown indicator kind, skipped");
                continue;
            }
            data.indicators.insert(
                key,
                IndicatorData { config: req.config.clone(), state: IndicatorState::default(), current_value: None, last_updated: None, valid: false },
            );
        }
    }

    fn register_indicators_by_symbol(&self, symbol: &str, requests: &[IndicatorRequest]) {
        self.session.with_symbol_mut(symbol, |data| {
            self.register_indicators(data, requests);
        });
    }

    fn load_historical(&self, symbol: &str, base_interval: Interval, historical: Option<Vec<Bar>>) {
        let Some(bars) = historical else { return };
        for bar in bars {
            let date = crate::clock::nanos_to_datetime(bar.timestamp).date_naive();
            self.session.with_symbol_mut(symbol, |data| {
                data.historical.bars.entry(base_interval).or_default().by_date.entry(date).or_default().push(bar);
            });
        }
    }

    /// Adhoc bar addition: auto-provisions a minimal `SymbolSessionData`
    /// (no historical, no indicators) if the symbol is missing, then
    /// appends the bar. Does not pause the stream.
    pub fn add_adhoc_bar(&self, symbol: &str, interval: Interval, bar: Bar, now: Nanos) -> Result<(), crate::error::EngineError> {
        if !self.session.symbol_exists(symbol) {
            let metadata = SymbolMetadata {
                meets_session_config_requirements: false,
                added_by: AddedBy::Adhoc,
                auto_provisioned: true,
                added_at: now,
                upgraded_from_adhoc: false,
            };
            let base = interval.ultimate_base().unwrap_or(interval);
            let data = SymbolSessionData::new(symbol.to_string(), base, self.bars_per_interval_capacity, metadata);
            self.session.register_symbol(data);
            if interval != base {
                self.session.with_symbol_mut(symbol, |d| {
                    d.ensure_derived(interval, self.bars_per_interval_capacity);
                });
            }
            info!(symbol, "adhoc symbol auto-provisioned");
        }
        self.session.append_bar(symbol, interval, bar)
    }

    pub fn add_adhoc_indicator(&self, symbol: &str, config: IndicatorConfig) {
        let key = IndicatorRegistry::key(&config);
        if IndicatorRegistry::build(&config).is_none() {
            warn!(indicator = %config.name, "unknown indicator kind, skipped");
            return;
        }
        self.session.with_symbol_mut(symbol, |data| {
            data.indicators.insert(key, IndicatorData { config, state: IndicatorState::default(), current_value: None, last_updated: None, valid: false });
        });
    }
}
