//! Coordinator event stream (spec §7, "User-visible behaviour").
//!
//! Every phase transition and symbol-level outcome is both logged via
//! `tracing` and published on a bounded broadcast channel so external
//! tools can observe the session without polling the snapshot.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorEvent {
    PhaseStart { phase: String },
    PhaseComplete { phase: String },
    SymbolAdded { symbol: String },
    SymbolFailed { symbol: String, reason: String },
    LagDetected { symbol: String, lag_seconds: i64 },
    SessionActivated,
    SessionDeactivated,
    SessionEnd { date: chrono::NaiveDate },
}

/// Bounded so a stalled subscriber cannot backpressure the coordinator;
/// the coordinator drops and logs on `SendError` (no receivers), never
/// blocks.
pub fn channel(capacity: usize) -> (tokio::sync::broadcast::Sender<CoordinatorEvent>, tokio::sync::broadcast::Receiver<CoordinatorEvent>) {
    tokio::sync::broadcast::channel(capacity)
}

pub fn emit(sender: &tokio::sync::broadcast::Sender<CoordinatorEvent>, event: CoordinatorEvent) {
    match &event {
        CoordinatorEvent::SymbolFailed { symbol, reason } => {
            tracing::warn!(symbol = %symbol, reason = %reason, "symbol failed");
        }
        CoordinatorEvent::LagDetected { symbol, lag_seconds } => {
            tracing::warn!(symbol = %symbol, lag_seconds, "lag detected");
        }
        CoordinatorEvent::PhaseStart { phase } => tracing::info!(phase = %phase, "phase start"),
        CoordinatorEvent::PhaseComplete { phase } => tracing::info!(phase = %phase, "phase complete"),
        CoordinatorEvent::SymbolAdded { symbol } => tracing::info!(symbol = %symbol, "symbol added"),
        CoordinatorEvent::SessionActivated => tracing::info!("session activated"),
        CoordinatorEvent::SessionDeactivated => tracing::info!("session deactivated"),
        CoordinatorEvent::SessionEnd { date } => tracing::info!(%date, "session end"),
    }
    // Dropped silently when there are no subscribers; that's expected
    // between test runs and whenever no external tool is attached.
    let _ = sender.send(event);
}
