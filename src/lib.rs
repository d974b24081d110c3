//! Request coordination engine between NIP-55 callers and a signer sandbox
//! that may be asleep, cold-starting or briefly unresponsive.
//!
//! Callers hand requests to a [`Coordinator`]; it rate-limits them, collapses
//! duplicates into one execution, caches results briefly, parks work while the
//! signer is unavailable and probes it carefully on cold start.

pub mod adapter;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod ports;
pub mod request;
pub mod settings;

pub use adapter::BlockingQuery;
pub use config::BrokerConfig;
pub use coordinator::{BootstrapOutcome, Coordinator, DiagnosticsSnapshot, HealthState};
pub use error::{Error, FailureKind, Result};
pub use ports::{NoopWakeSignal, SignerExecutor, WakeSignal};
pub use request::{DedupeKey, RequestType, SignRequest, SignResult};
