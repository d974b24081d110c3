//! `igloo-broker simulate` - replay a cold-start burst in-process.
//!
//! Queues a burst of requests against a sleeping demo signer (including a
//! caller that retries the same event under fresh ids), bootstraps it and
//! prints what each caller received plus the final diagnostics.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::Args;
use tokio::sync::oneshot;

use crate::config::BrokerConfig;
use crate::coordinator::Coordinator;
use crate::error::{ExecutorError, WakeError};
use crate::ports::{SignerExecutor, WakeSignal};
use crate::request::{RequestType, SignRequest, SignResult};

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Retries of one sign_event, each under a new request id.
    #[arg(long, default_value_t = 5)]
    pub duplicates: usize,

    /// Distinct nip44_encrypt requests queued alongside.
    #[arg(long, default_value_t = 3)]
    pub distinct: usize,

    /// Executions the demo signer fails before it is ready.
    #[arg(long, default_value_t = 1)]
    pub fail_first: usize,

    /// Simulated signer latency per execution.
    #[arg(long, default_value_t = 20)]
    pub latency_ms: u64,
}

/// Deterministic stand-in for the signer front-end. Produces blake3 digests
/// in place of real signatures and ciphertexts.
#[derive(Debug)]
pub struct DemoSigner {
    latency: Duration,
    warmup_failures: AtomicUsize,
    calls: AtomicUsize,
}

impl DemoSigner {
    pub fn new(latency: Duration, fail_first: usize) -> Self {
        Self {
            latency,
            warmup_failures: AtomicUsize::new(fail_first),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn digest(parts: &[&str]) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

#[async_trait]
impl SignerExecutor for DemoSigner {
    async fn execute(&self, request: &SignRequest) -> Result<SignResult, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        let warming = self
            .warmup_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if warming {
            return Err(ExecutorError::NotReady("demo signer warming up".to_string()));
        }

        let param = |name: &str| {
            request
                .param(name)
                .ok_or_else(|| ExecutorError::InvalidParameters(format!("missing '{name}'")))
        };

        let result = match request.request_type {
            RequestType::GetPublicKey => SignResult::success(request, Self::digest(&["pubkey"])),
            RequestType::SignEvent => {
                let event = param("event")?;
                SignResult::success(request, Self::digest(&["sig", event])).with_event(event)
            }
            RequestType::Nip04Encrypt | RequestType::Nip44Encrypt => SignResult::success(
                request,
                Self::digest(&[param("pubkey")?, param("plaintext")?]),
            ),
            RequestType::Nip04Decrypt | RequestType::Nip44Decrypt => SignResult::success(
                request,
                Self::digest(&[param("pubkey")?, param("ciphertext")?]),
            ),
            RequestType::DecryptZapEvent => {
                SignResult::success(request, Self::digest(&["zap", param("event")?]))
            }
        };
        Ok(result)
    }
}

struct ConsoleWake;

impl WakeSignal for ConsoleWake {
    fn send(&self) -> Result<(), WakeError> {
        println!("  -> wake signal sent to signer host");
        Ok(())
    }
}

pub async fn run_simulate_command(
    toml_path: Option<&Path>,
    args: SimulateArgs,
) -> anyhow::Result<()> {
    let config = BrokerConfig::from_env_with_toml(toml_path)?;
    let signer = Arc::new(DemoSigner::new(
        Duration::from_millis(args.latency_ms),
        args.fail_first,
    ));
    let coordinator = Coordinator::builder(config)
        .executor(signer.clone())
        .wake_signal(Arc::new(ConsoleWake))
        .build()?;

    println!("igloo-broker simulate");
    println!("=====================\n");
    println!("Queueing requests while the signer is asleep:");

    let mut receivers = Vec::new();
    let mut enqueue = |request: SignRequest| {
        let (tx, rx) = oneshot::channel();
        let id = request.id.clone();
        let accepted = coordinator.submit(request, move |result| {
            let _ = tx.send(result);
        });
        println!("  [{}] {id}", if accepted { "queued" } else { "rejected" });
        receivers.push(rx);
    };

    for i in 0..args.distinct {
        enqueue(
            SignRequest::new(RequestType::Nip44Encrypt, "demo-client")
                .with_id(format!("encrypt-{i}"))
                .with_param("pubkey", "demo-peer")
                .with_param("plaintext", format!("message {i}")),
        );
    }
    let event = r#"{"kind":1,"content":"hello from igloo","tags":[],"created_at":1700000000}"#;
    for i in 0..args.duplicates {
        enqueue(
            SignRequest::new(RequestType::SignEvent, "demo-client")
                .with_id(format!("retry-{i}"))
                .with_param("event", event),
        );
    }

    let (done_tx, done_rx) = oneshot::channel();
    coordinator.bootstrap(move |outcome| {
        let _ = done_tx.send(outcome);
    });
    let outcome = done_rx.await?;
    println!("\nBootstrap: {outcome:?}\n");

    println!("Results:");
    for result in futures::future::join_all(receivers).await {
        match result {
            Ok(result) if result.ok => println!("  [ok]   {}", result.id),
            Ok(result) => println!(
                "  [FAIL] {}: {}",
                result.id,
                result.reason.as_deref().unwrap_or("unknown")
            ),
            Err(_) => println!("  [lost] callback dropped"),
        }
    }

    println!("\nSigner executions: {}", signer.calls());
    println!(
        "\n{}",
        serde_json::to_string_pretty(&coordinator.diagnostics())?
    );
    Ok(())
}
