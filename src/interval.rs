//! Interval parsing and classification.
//!
//! Canonical interval strings match `^\d+[smdw]$`, plus the non-bar sentinel
//! `"quotes"`. Hourly intervals (`h`) are rejected outright: the source
//! system only ever streamed minute-granularity or finer, so an `h` request
//! is always a misconfiguration, not a supported derivation target.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single time unit recognised by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Unit {
    Second,
    Minute,
    Day,
    Week,
}

impl Unit {
    fn from_char(c: char) -> Option<Unit> {
        match c {
            's' => Some(Unit::Second),
            'm' => Some(Unit::Minute),
            'd' => Some(Unit::Day),
            'w' => Some(Unit::Week),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            Unit::Second => 's',
            Unit::Minute => 'm',
            Unit::Day => 'd',
            Unit::Week => 'w',
        }
    }

    /// Priority used to pick the minimum base interval across a requested
    /// set: `1s < 1m < 1d < 1w`.
    fn priority(self) -> u8 {
        match self {
            Unit::Second => 0,
            Unit::Minute => 1,
            Unit::Day => 2,
            Unit::Week => 3,
        }
    }
}

/// A parsed, canonical interval (e.g. `5m`, `1d`, `52w`), or the `quotes`
/// sentinel. `Interval` is `Copy` since it only carries a count+unit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Interval {
    Bar { count: u32, unit: Unit },
    Quotes,
}

impl Interval {
    /// Parse a canonical interval string. Rejects hourly intervals and
    /// anything not matching `^\d+[smdw]$` (besides the `quotes` sentinel).
    pub fn parse(raw: &str) -> Result<Interval, EngineError> {
        if raw == "quotes" {
            return Ok(Interval::Quotes);
        }

        if raw.is_empty() {
            return Err(EngineError::InvalidInterval {
                raw: raw.to_string(),
                reason: "empty interval string".into(),
            });
        }

        let split_at = raw
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| EngineError::InvalidInterval {
                raw: raw.to_string(),
                reason: "missing unit suffix".into(),
            })?;
        let (count_str, unit_str) = raw.split_at(split_at);

        if unit_str == "h" || unit_str.starts_with('h') {
            return Err(EngineError::InvalidInterval {
                raw: raw.to_string(),
                reason: "hourly intervals are not supported; use minute intervals (60m, 120m, ...)".into(),
            });
        }

        if unit_str.chars().count() != 1 {
            return Err(EngineError::InvalidInterval {
                raw: raw.to_string(),
                reason: format!("unrecognized unit {unit_str:?}"),
            });
        }
        let unit_char = unit_str.chars().next().unwrap();
        let unit = Unit::from_char(unit_char).ok_or_else(|| EngineError::InvalidInterval {
            raw: raw.to_string(),
            reason: format!("unrecognized unit {unit_char:?}"),
        })?;

        let count: u32 = count_str.parse().map_err(|_| EngineError::InvalidInterval {
            raw: raw.to_string(),
            reason: format!("invalid count {count_str:?}"),
        })?;
        if count == 0 {
            return Err(EngineError::InvalidInterval {
                raw: raw.to_string(),
                reason: "count must be positive".into(),
            });
        }

        Ok(Interval::Bar { count, unit })
    }

    #[inline]
    pub fn is_quotes(self) -> bool {
        matches!(self, Interval::Quotes)
    }

    /// True if this is one of the four base intervals: `1s`, `1m`, `1d`, `1w`.
    #[inline]
    pub fn is_base(self) -> bool {
        matches!(self, Interval::Bar { count: 1, .. })
    }

    /// Interval length in seconds, for sub-daily intervals. Daily/weekly
    /// intervals use calendar semantics instead (see `time_windows`-style
    /// callers in `quality.rs`), but the nominal seconds value is still
    /// useful for ordering and gap-threshold math.
    pub fn nominal_seconds(self) -> Option<i64> {
        match self {
            Interval::Quotes => None,
            Interval::Bar { count, unit } => {
                let base = match unit {
                    Unit::Second => 1,
                    Unit::Minute => 60,
                    Unit::Day => 86_400,
                    Unit::Week => 7 * 86_400,
                };
                Some(base * count as i64)
            }
        }
    }

    /// The base interval this interval must derive from, per spec §3/§4.1:
    /// `Ns` from `1s`; `Nm` from `1m`; `Nd` (N>1) from `1d`, and `1d` itself
    /// aggregates from `1m`; `Nw` (N>1) from `1w`, and `1w` itself
    /// aggregates from `1d` (and transitively `1m`).
    pub fn required_base(self) -> Option<Interval> {
        match self {
            Interval::Quotes => None,
            Interval::Bar { count: 1, unit: Unit::Second } => None,
            Interval::Bar { count: 1, unit: Unit::Minute } => None,
            Interval::Bar { unit: Unit::Second, .. } => Some(Interval::Bar { count: 1, unit: Unit::Second }),
            Interval::Bar { unit: Unit::Minute, .. } => Some(Interval::Bar { count: 1, unit: Unit::Minute }),
            Interval::Bar { count: 1, unit: Unit::Day } => Some(Interval::Bar { count: 1, unit: Unit::Minute }),
            Interval::Bar { unit: Unit::Day, .. } => Some(Interval::Bar { count: 1, unit: Unit::Day }),
            Interval::Bar { count: 1, unit: Unit::Week } => Some(Interval::Bar { count: 1, unit: Unit::Day }),
            Interval::Bar { unit: Unit::Week, .. } => Some(Interval::Bar { count: 1, unit: Unit::Week }),
        }
    }

    /// Transitively resolve down to the ultimate base interval actually
    /// streamed (i.e. walk `required_base` until it returns `None`).
    pub fn ultimate_base(self) -> Option<Interval> {
        let mut current = self.required_base()?;
        loop {
            match current.required_base() {
                Some(next) => current = next,
                None => return Some(current),
            }
        }
    }

    /// Priority used to pick the minimum base across a requested set.
    pub fn base_priority(self) -> u8 {
        match self {
            Interval::Quotes => u8::MAX,
            Interval::Bar { unit, .. } => unit.priority(),
        }
    }

    /// Granularity classification for storage layout (spec §4.1): sub-daily
    /// intervals (seconds, minutes) live in daily files; daily-and-up
    /// intervals live in yearly files.
    pub fn is_sub_daily(self) -> bool {
        matches!(
            self,
            Interval::Bar { unit: Unit::Second, .. } | Interval::Bar { unit: Unit::Minute, .. }
        )
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Quotes => write!(f, "quotes"),
            Interval::Bar { count, unit } => write!(f, "{count}{}", unit.as_char()),
        }
    }
}
