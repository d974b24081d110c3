//! Blocking bridge for synchronous callers.
//!
//! Host surfaces that must answer on the calling thread (content-provider
//! style queries) submit through here and park on a one-shot channel instead
//! of polling. When the bound expires the caller is told the signer is
//! unavailable; the request itself stays registered and its eventual result
//! is discarded.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use crate::coordinator::Coordinator;
use crate::error::{AdapterError, FailureKind};
use crate::request::{SignRequest, SignResult};

#[derive(Debug, Clone)]
pub struct BlockingQuery {
    coordinator: Coordinator,
    timeout: Duration,
}

impl BlockingQuery {
    /// Bridge bounded by the coordinator's configured blocking timeout.
    pub fn new(coordinator: Coordinator) -> Self {
        let timeout = coordinator.config().blocking_timeout;
        Self::with_timeout(coordinator, timeout)
    }

    pub fn with_timeout(coordinator: Coordinator, timeout: Duration) -> Self {
        Self {
            coordinator,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Submit `request` and block until its result arrives or the bound
    /// expires. Must not be called from a runtime worker thread.
    ///
    /// Rejections at admission (rate limit, full queue) are returned as
    /// [`AdapterError::Rejected`]; results that went through the signer,
    /// failed or not, are returned as `Ok`.
    pub fn query(&self, request: SignRequest) -> Result<SignResult, AdapterError> {
        let request_id = request.id.clone();
        let (tx, rx) = mpsc::sync_channel(1);

        let accepted = self.coordinator.submit(request, move |result| {
            let _ = tx.send(result);
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) if !accepted => Err(AdapterError::Rejected {
                kind: result.failure.unwrap_or(FailureKind::ExecutionFailed),
                reason: result.reason.unwrap_or_default(),
            }),
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    request_id = %request_id,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "Blocking query timed out, reporting signer unavailable"
                );
                Err(AdapterError::Unavailable {
                    timeout: self.timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!(request_id = %request_id, "Result callback dropped without a result");
                Err(AdapterError::Unavailable {
                    timeout: self.timeout,
                })
            }
        }
    }
}
