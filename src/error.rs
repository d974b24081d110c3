//! Error types for the signing broker.
//!
//! Nothing in this module crosses the submission boundary as an `Err`: every
//! request-level failure is converted into a [`SignResult`](crate::request::SignResult)
//! carrying a [`FailureKind`]. The `thiserror` enums cover construction,
//! configuration, and collaborator failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for the broker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Wake signal error: {0}")]
    Wake(#[from] WakeError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),
}

/// Failure taxonomy surfaced to callers through `SignResult { ok: false, .. }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Caller exceeded its admission window.
    RateLimited,
    /// Pending queue at capacity while the signer is unavailable.
    QueueFull,
    /// No executor registered at dispatch time.
    ExecutorUnavailable,
    /// Executor raised an error, panicked, or returned a failure result.
    ExecutionFailed,
    /// No answer within the blocking adapter's bound.
    Timeout,
    /// Out-of-band approval flow rejected the request.
    Denied,
    /// Coordinator was reset while the request was outstanding.
    Reset,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::QueueFull => "queue_full",
            Self::ExecutorUnavailable => "executor_unavailable",
            Self::ExecutionFailed => "execution_failed",
            Self::Timeout => "timeout",
            Self::Denied => "denied",
            Self::Reset => "reset",
        }
    }

    /// Human-readable reason used when no more specific message exists.
    pub fn default_reason(self) -> &'static str {
        match self {
            Self::RateLimited => "rate limit exceeded",
            Self::QueueFull => "queue full",
            Self::ExecutorUnavailable => "signer not available",
            Self::ExecutionFailed => "execution failed",
            Self::Timeout => "signer unavailable: timed out",
            Self::Denied => "request denied",
            Self::Reset => "coordinator reset",
        }
    }

    /// Transient failures say nothing about the request itself and must never
    /// be served from the result cache.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ExecutorUnavailable | Self::ExecutionFailed | Self::Timeout | Self::Reset
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coordinator construction errors.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Coordinator must be built inside a Tokio runtime: {0}")]
    NoRuntime(String),
}

/// Failures raised by a signer executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Signer not ready: {0}")]
    NotReady(String),

    #[error("Invalid request parameters: {0}")]
    InvalidParameters(String),

    #[error("Signing failed: {0}")]
    Failed(String),
}

/// Failures raised when asking the host to activate the signer sandbox.
#[derive(Debug, thiserror::Error)]
pub enum WakeError {
    #[error("Wake signal could not be delivered: {0}")]
    SendFailed(String),
}

/// Errors returned by the blocking query adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Signer unavailable after waiting {}ms", timeout.as_millis())]
    Unavailable { timeout: Duration },

    #[error("Request rejected: {reason}")]
    Rejected { kind: FailureKind, reason: String },
}

/// Result type alias for the broker.
pub type Result<T> = std::result::Result<T, Error>;
