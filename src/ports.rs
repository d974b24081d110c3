//! Capabilities the coordinator consumes but does not implement.
//!
//! The signer sandbox and the host that activates it live outside this crate;
//! the coordinator only sees them through these traits.

use async_trait::async_trait;

use crate::error::{ExecutorError, WakeError};
use crate::request::{SignRequest, SignResult};

/// The signer front-end that actually performs an operation.
///
/// Implementations may return `Ok` with `ok == false` for request-level
/// refusals (those can be cached) and `Err` for signer trouble (never cached).
#[async_trait]
pub trait SignerExecutor: Send + Sync {
    async fn execute(&self, request: &SignRequest) -> Result<SignResult, ExecutorError>;
}

/// Asks the host environment to activate the signer sandbox.
pub trait WakeSignal: Send + Sync {
    fn send(&self) -> Result<(), WakeError>;
}

/// Wake signal for hosts that keep the signer resident.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeSignal;

impl WakeSignal for NoopWakeSignal {
    fn send(&self) -> Result<(), WakeError> {
        tracing::debug!("Wake signal requested with no host integration attached");
        Ok(())
    }
}
