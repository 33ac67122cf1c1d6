//! Session configuration (spec §6.2). External: parsed by a CLI/config
//! front-end outside this crate and handed in as a `SessionConfig`.

use crate::interval::Interval;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Backtest,
    Live,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BacktestConfig {
    pub start_date: chrono::NaiveDate,
    pub end_date: chrono::NaiveDate,
    #[serde(default)]
    pub speed_multiplier: f64,
}

fn default_catchup_threshold() -> i64 {
    60
}

fn default_catchup_check_interval() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_catchup_threshold")]
    pub catchup_threshold_seconds: i64,
    #[serde(default = "default_catchup_check_interval")]
    pub catchup_check_interval: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { catchup_threshold_seconds: default_catchup_threshold(), catchup_check_interval: default_catchup_check_interval() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalConfig {
    pub enabled: bool,
    pub trailing_days: u32,
    #[serde(default)]
    pub intervals: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorDescriptor {
    pub name: String,
    pub period: Option<u32>,
    pub interval: String,
    #[serde(default)]
    pub params: std::collections::BTreeMap<String, f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndicatorsConfig {
    #[serde(default)]
    pub session: Vec<IndicatorDescriptor>,
    #[serde(default)]
    pub historical: Vec<IndicatorDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionDataConfig {
    pub symbols: Vec<String>,
    pub streams: Vec<String>,
    pub historical: Option<HistoricalConfig>,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub indicators: IndicatorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub mode: SessionMode,
    pub exchange_group: String,
    pub backtest_config: Option<BacktestConfig>,
    pub session_data_config: SessionDataConfig,
}

impl SessionConfig {
    /// Parse `streams` into canonical `Interval`s, surfacing the first
    /// parse failure — including the hourly-rejection path exercised by
    /// Scenario F.
    pub fn parsed_streams(&self) -> Result<Vec<Interval>, crate::error::EngineError> {
        self.session_data_config.streams.iter().map(|s| Interval::parse(s)).collect()
    }

    /// Maps the exchange group to an IANA timezone. A production
    /// deployment would load this table from configuration; a handful of
    /// equity/crypto groups cover the test suite and a small live
    /// deployment.
    pub fn exchange_timezone(&self) -> chrono_tz::Tz {
        match self.exchange_group.as_str() {
            "US_EQUITY" => chrono_tz::America::New_York,
            "EU_EQUITY" => chrono_tz::Europe::London,
            "CRYPTO" => chrono_tz::UTC,
            _ => chrono_tz::UTC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_json() {
        let json = r#"
        {
            "mode": "backtest",
            "exchange_group": "US_EQUITY",
            "backtest_config": { "start_date": "2026-01-02", "end_date": "2026-01-09", "speed_multiplier": 0.0 },
            "session_data_config": {
                "symbols": ["AAPL", "MSFT"],
                "streams": ["1m", "5m", "1d"],
                "streaming": { "catchup_threshold_seconds": 60, "catchup_check_interval": 10 },
                "indicators": { "session": [{ "name": "sma", "period": 20, "interval": "5m" }] }
            }
        }"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.session_data_config.symbols.len(), 2);
        assert_eq!(config.parsed_streams().unwrap().len(), 3);
    }

    #[test]
    fn rejects_hourly_stream() {
        let config = SessionConfig {
            mode: SessionMode::Backtest,
            exchange_group: "US_EQUITY".into(),
            backtest_config: None,
            session_data_config: SessionDataConfig {
                symbols: vec!["AAPL".into()],
                streams: vec!["1h".into()],
                historical: None,
                streaming: StreamingConfig::default(),
                indicators: IndicatorsConfig::default(),
            },
        };
        assert!(config.parsed_streams().is_err());
    }

    #[test]
    fn streaming_defaults_match_spec() {
        let defaults = StreamingConfig::default();
        assert_eq!(defaults.catchup_threshold_seconds, 60);
        assert_eq!(defaults.catchup_check_interval, 10);
    }
}
