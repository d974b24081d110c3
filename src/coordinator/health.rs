//! Signer health tracking.

use serde::Serialize;
use tokio::time::Instant;

/// Whether the signer front-end is believed to be responsive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus when it was entered. Starts unhealthy: nothing has
/// proven the signer responsive yet.
#[derive(Debug, Clone)]
pub(crate) struct HealthTracker {
    state: HealthState,
    since: Instant,
    transitions: u64,
}

impl HealthTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: HealthState::Unhealthy,
            since: Instant::now(),
            transitions: 0,
        }
    }

    pub(crate) fn state(&self) -> HealthState {
        self.state
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.state.is_healthy()
    }

    pub(crate) fn since(&self) -> Instant {
        self.since
    }

    pub(crate) fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Returns true if the state changed.
    pub(crate) fn mark_healthy(&mut self) -> bool {
        self.transition(HealthState::Healthy)
    }

    /// Returns true if the state changed.
    pub(crate) fn mark_unhealthy(&mut self) -> bool {
        self.transition(HealthState::Unhealthy)
    }

    fn transition(&mut self, next: HealthState) -> bool {
        if self.state == next {
            return false;
        }
        self.state = next;
        self.since = Instant::now();
        self.transitions += 1;
        true
    }
}
