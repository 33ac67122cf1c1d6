//! Domain error types
//!
//! Tagged errors for the cases the engine must recover from locally
//! (per-symbol provisioning failures, out-of-order bars) versus the cases
//! that abort a session (bad config, no survivors in a batch).

use crate::interval::Interval;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("invalid interval {raw:?}: {reason}")]
    InvalidInterval { raw: String, reason: String },

    #[error("no bar intervals requested (only quotes)")]
    NoBarIntervals,

    #[error("out-of-order bar for {symbol}/{interval}: new={new_ts} last={last_ts}")]
    OutOfOrderBar {
        symbol: String,
        interval: Interval,
        new_ts: i64,
        last_ts: i64,
    },

    #[error("symbol {0} not found")]
    SymbolNotFound(String),

    #[error("symbol {symbol} already active with incompatible requirements: {reason}")]
    DuplicateSymbol { symbol: String, reason: String },

    #[error("validation failed for {symbol}: {reason}")]
    ValidationFailed { symbol: String, reason: String },

    #[error("all symbols failed validation in this batch")]
    AllSymbolsFailed,

    #[error("aggregation incomplete for {symbol}/{interval} (internal, not surfaced)")]
    AggregationIncomplete { symbol: String, interval: Interval },
}

pub type Result<T> = std::result::Result<T, EngineError>;
