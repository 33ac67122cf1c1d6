//! Requirement analysis (spec §4.2).
//!
//! Given requested streams and indicator descriptors, compute the base
//! interval actually streamed, the derivation targets, and a historical
//! lookback in calendar days per interval. Used by `ProvisioningExecutor`
//! for both config-time symbol loading and mid-session adds — the same
//! analysis drives both paths, per spec §4.3.

use crate::error::EngineError;
use crate::indicator::{IndicatorConfig, IndicatorRegistry};
use crate::interval::Interval;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

const BARS_PER_TRADING_DAY_1M: f64 = 390.0;

#[derive(Debug, Clone)]
pub struct IndicatorRequest {
    pub config: IndicatorConfig,
    pub historical: bool,
}

#[derive(Debug, Clone)]
pub struct ProvisioningRequirements {
    pub base_interval: Interval,
    pub derivable_intervals: Vec<Interval>,
    pub historical_lookback_days: BTreeMap<Interval, u32>,
    pub implicit_additions: Vec<Interval>,
    pub reasons: Vec<String>,
}

pub struct RequirementAnalyzer;

impl RequirementAnalyzer {
    /// Run the analysis. `requested_streams` are explicitly configured
    /// intervals; `indicators` are session + historical indicator
    /// descriptors, each of which implicitly requires its own interval.
    pub fn analyze(
        requested_streams: &[Interval],
        indicators: &[IndicatorRequest],
    ) -> Result<ProvisioningRequirements, EngineError> {
        let mut reasons = Vec::new();
        let mut all_intervals: BTreeSet<Interval> = requested_streams.iter().copied().collect();

        let mut implicit_additions = Vec::new();
        for req in indicators {
            let interval = req.config.interval;
            if interval.is_quotes() {
                continue;
            }
            if all_intervals.insert(interval) {
                implicit_additions.push(interval);
                reasons.push(format!(
                    "indicator {} on {} implicitly requires stream {}",
                    req.config.name, interval, interval
                ));
            }
        }

        let bar_intervals: Vec<Interval> = all_intervals.iter().copied().filter(|i| !i.is_quotes()).collect();
        if bar_intervals.is_empty() {
            return Err(EngineError::NoBarIntervals);
        }

        // Step 2/3: minimum base by priority, derivable = everything else.
        let mut base_interval = bar_intervals[0].ultimate_base().unwrap_or(bar_intervals[0]);
        for interval in &bar_intervals {
            let candidate = interval.ultimate_base().unwrap_or(*interval);
            if candidate.base_priority() < base_interval.base_priority() {
                base_interval = candidate;
            }
        }
        reasons.push(format!("selected base interval {base_interval} (minimum priority across {} requested intervals)", bar_intervals.len()));

        let derivable_intervals: Vec<Interval> = bar_intervals.iter().copied().filter(|i| *i != base_interval).collect();

        // Step 4: warmup → calendar days, per indicator's own interval.
        let mut historical_lookback_days: BTreeMap<Interval, u32> = BTreeMap::new();
        for req in indicators {
            let Some(warmup_bars) = IndicatorRegistry::warmup_bars(&req.config) else {
                continue;
            };
            let days = calendar_days_for_warmup(req.config.interval, warmup_bars);
            let entry = historical_lookback_days.entry(req.config.interval).or_insert(0);
            *entry = (*entry).max(days);
        }

        Ok(ProvisioningRequirements { base_interval, derivable_intervals, historical_lookback_days, implicit_additions, reasons })
    }
}

/// Warmup-bars → calendar-days conversion per spec §4.2:
/// intraday divides by bars/trading-day (390 for 1m) then ×1.5;
/// daily multiplies warmup_bars by 1.5; weekly multiplies warmup_weeks
/// by 7 × 1.1.
fn calendar_days_for_warmup(interval: Interval, warmup_bars: u32) -> u32 {
    match interval {
        Interval::Quotes => 0,
        Interval::Bar { unit: crate::interval::Unit::Week, .. } => {
            (warmup_bars as f64 * 7.0 * 1.1).ceil() as u32
        }
        Interval::Bar { unit: crate::interval::Unit::Day, .. } => {
            (warmup_bars as f64 * 1.5).ceil() as u32
        }
        Interval::Bar { .. } => {
            (warmup_bars as f64 / BARS_PER_TRADING_DAY_1M * 1.5).ceil() as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn cfg(name: &str, period: Option<u32>, interval: &str) -> IndicatorConfig {
        IndicatorConfig { name: name.into(), period, interval: Interval::parse(interval).unwrap(), params: Map::new() }
    }

    #[test]
    fn picks_minimum_priority_base() {
        let streams = [Interval::parse("1m").unwrap(), Interval::parse("5m").unwrap(), Interval::parse("1d").unwrap()];
        let result = RequirementAnalyzer::analyze(&streams, &[]).unwrap();
        assert_eq!(result.base_interval, Interval::parse("1m").unwrap());
        assert_eq!(result.derivable_intervals.len(), 2);
    }

    #[test]
    fn no_bar_intervals_errors() {
        let streams = [Interval::Quotes];
        let err = RequirementAnalyzer::analyze(&streams, &[]).unwrap_err();
        assert!(matches!(err, EngineError::NoBarIntervals));
    }

    #[test]
    fn indicator_implicitly_adds_its_interval() {
        let streams = [Interval::parse("1m").unwrap()];
        let indicators = vec![IndicatorRequest { config: cfg("sma", Some(20), "5m"), historical: false }];
        let result = RequirementAnalyzer::analyze(&streams, &indicators).unwrap();
        assert!(result.implicit_additions.contains(&Interval::parse("5m").unwrap()));
        assert!(result.derivable_intervals.contains(&Interval::parse("5m").unwrap()));
    }

    #[test]
    fn warmup_days_intraday_vs_daily() {
        let streams = [Interval::parse("1m").unwrap(), Interval::parse("1d").unwrap()];
        let indicators = vec![
            IndicatorRequest { config: cfg("sma", Some(20), "1m"), historical: true },
            IndicatorRequest { config: cfg("sma", Some(20), "1d"), historical: true },
        ];
        let result = RequirementAnalyzer::analyze(&streams, &indicators).unwrap();
        let intraday_days = result.historical_lookback_days[&Interval::parse("1m").unwrap()];
        let daily_days = result.historical_lookback_days[&Interval::parse("1d").unwrap()];
        assert_eq!(intraday_days, 1);
        assert_eq!(daily_days, 30);
    }
}
