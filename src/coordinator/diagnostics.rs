//! Point-in-time view of coordinator state for logs and the CLI.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::health::HealthState;
use crate::request::RequestType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchDiagnostics {
    pub kind: RequestType,
    pub queued: usize,
    pub in_flight: usize,
    pub flush_scheduled: bool,
    pub flush_deferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub health: HealthState,
    pub health_age_ms: u64,
    pub health_transitions: u64,
    pub health_timer_armed: bool,
    pub wakeup_sent: bool,
    pub bootstrapping: bool,
    pub executor_registered: bool,
    pub active_handler: Option<String>,
    pub pending: usize,
    pub pending_capacity: usize,
    pub in_flight_keys: usize,
    pub in_flight_waiters: usize,
    pub cached_results: usize,
    pub tracked_callers: usize,
    pub batch: BatchDiagnostics,
}

impl DiagnosticsSnapshot {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize diagnostics: {}", e);
            serde_json::Value::Null
        })
    }
}

impl std::fmt::Display for DiagnosticsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "health={} pending={}/{} in_flight={} waiters={} cached={} batch_queued={}",
            self.health,
            self.pending,
            self.pending_capacity,
            self.in_flight_keys,
            self.in_flight_waiters,
            self.cached_results,
            self.batch.queued,
        )
    }
}
