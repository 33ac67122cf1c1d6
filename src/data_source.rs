//! `DataSource` collaborator (spec §6.1).
//!
//! Raw Parquet I/O is never the core's job; every load/store goes through
//! this trait. `storage.rs` provides a concrete `ParquetDataSource`; tests
//! use an in-memory fake (see `tests/scenarios.rs`).

use crate::bar::Bar;
use crate::interval::Interval;
use async_trait::async_trait;
use chrono::NaiveDate;

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn load_historical_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> anyhow::Result<Vec<Bar>>;

    /// Live-mode handle; implementations push bars into per-queue FIFOs
    /// upstream of the coordinator. Not exercised in backtest mode.
    async fn stream_bars(&self, symbols: &[String], intervals: &[Interval]) -> anyhow::Result<()>;

    async fn write_bars(&self, bars: &[Bar], interval: Interval, symbol: &str) -> anyhow::Result<()>;

    async fn read_bars(
        &self,
        interval: Interval,
        symbol: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> anyhow::Result<Vec<Bar>>;
}
