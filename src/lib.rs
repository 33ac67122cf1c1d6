//! Core engine of a market-data backtesting and live-trading platform.
//!
//! Ingests OHLCV bars for a set of instruments, derives additional
//! timeframes from a streamed base interval, maintains per-symbol
//! session state, computes technical indicators incrementally, tracks
//! data quality, and exposes a thread-safe snapshot to downstream
//! analysis. See `SessionCoordinator` for the top-level entry point.

pub mod bar;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod data_processor;
pub mod data_source;
pub mod error;
pub mod events;
pub mod indicator;
pub mod interval;
pub mod provisioning;
pub mod quality;
pub mod requirement;
pub mod session_data;
pub mod storage;
pub mod time_service;

pub use bar::{Bar, BarIntervalData, GapInfo};
pub use clock::{ClockMode, EngineClock, Nanos};
pub use config::SessionConfig;
pub use coordinator::SessionCoordinator;
pub use data_processor::DataProcessor;
pub use data_source::DataSource;
pub use error::{EngineError, Result};
pub use events::CoordinatorEvent;
pub use indicator::{Indicator, IndicatorData, IndicatorRegistry};
pub use interval::Interval;
pub use provisioning::ProvisioningExecutor;
pub use quality::QualityManager;
pub use requirement::RequirementAnalyzer;
pub use session_data::{SessionData, SessionSnapshot, SymbolSnapshot};
pub use storage::{IntervalStorageStrategy, ParquetDataSource};
pub use time_service::{ExchangeCalendar, TimeService};
