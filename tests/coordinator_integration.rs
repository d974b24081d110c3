//! End-to-end coordinator behaviour against scripted signers.
//!
//! Most tests run on a paused clock so batch windows, cache TTLs and the
//! health timeout are exercised deterministically. Cross-thread submission
//! runs on a multi-threaded runtime in real time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::oneshot;

use igloo_broker::error::{ExecutorError, WakeError};
use igloo_broker::{
    BootstrapOutcome, BrokerConfig, Coordinator, FailureKind, HealthState, RequestType,
    SignRequest, SignResult, SignerExecutor, WakeSignal,
};

// ── Fixtures ────────────────────────────────────────────────────────

struct ScriptedSigner {
    calls: AtomicUsize,
    latency: Duration,
    fail_first: usize,
}

impl ScriptedSigner {
    fn new(latency_ms: u64, fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            latency: Duration::from_millis(latency_ms),
            fail_first,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignerExecutor for ScriptedSigner {
    async fn execute(&self, request: &SignRequest) -> Result<SignResult, ExecutorError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if attempt <= self.fail_first {
            return Err(ExecutorError::NotReady(format!("attempt {attempt}")));
        }
        let payload = request
            .param("plaintext")
            .or_else(|| request.param("event"))
            .unwrap_or("none");
        Ok(SignResult::success(request, format!("sig:{payload}")))
    }
}

struct PanickingSigner;

#[async_trait]
impl SignerExecutor for PanickingSigner {
    async fn execute(&self, _request: &SignRequest) -> Result<SignResult, ExecutorError> {
        panic!("signer crashed");
    }
}

#[derive(Default)]
struct CountingWake {
    sent: AtomicUsize,
}

impl WakeSignal for CountingWake {
    fn send(&self) -> Result<(), WakeError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type Inbox = Arc<Mutex<Vec<SignResult>>>;

fn inbox() -> Inbox {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(inbox: &Inbox) -> impl FnOnce(SignResult) + Send + 'static {
    let inbox = Arc::clone(inbox);
    move |result| inbox.lock().unwrap().push(result)
}

fn received(inbox: &Inbox) -> Vec<SignResult> {
    inbox.lock().unwrap().clone()
}

fn encrypt(id: &str, plaintext: &str) -> SignRequest {
    SignRequest::new(RequestType::Nip44Encrypt, "amethyst")
        .with_id(id)
        .with_param("pubkey", "peer")
        .with_param("plaintext", plaintext)
}

fn sign_event(id: &str, event_id: &str) -> SignRequest {
    SignRequest::new(RequestType::SignEvent, "amethyst")
        .with_id(id)
        .with_param(
            "event",
            format!(r#"{{"id":"{event_id}","kind":1,"content":"gm"}}"#),
        )
}

fn coordinator_with(config: BrokerConfig, signer: Arc<ScriptedSigner>) -> Coordinator {
    Coordinator::builder(config)
        .executor(signer)
        .build()
        .unwrap()
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// ── Deduplication ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn identical_requests_share_one_execution() {
    let signer = ScriptedSigner::new(50, 0);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    coordinator.mark_healthy();
    let inbox = inbox();

    for i in 0..10 {
        assert!(coordinator.submit(encrypt(&format!("r{i}"), "hello"), record(&inbox)));
    }
    assert_eq!(coordinator.diagnostics().in_flight_waiters, 10);
    settle(100).await;

    assert_eq!(signer.calls(), 1);
    let results = received(&inbox);
    let ids: Vec<String> = results.iter().map(|r| r.id.clone()).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("r{i}")).collect();
    assert_eq!(ids, expected);
    assert!(
        results
            .iter()
            .all(|r| r.ok && r.result.as_deref() == Some("sig:hello"))
    );
    assert_eq!(coordinator.diagnostics().in_flight_keys, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submissions_from_many_threads_share_one_execution() {
    const CALLERS: usize = 12;
    let signer = ScriptedSigner::new(50, 0);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    coordinator.mark_healthy();

    let barrier = Arc::new(std::sync::Barrier::new(CALLERS));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let submitters: Vec<_> = (0..CALLERS)
        .map(|i| {
            let coordinator = coordinator.clone();
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || {
                barrier.wait();
                coordinator.submit(encrypt(&format!("t{i}"), "shared"), move |result| {
                    let _ = tx.send(result);
                })
            })
        })
        .collect();
    drop(tx);
    for submitter in submitters {
        assert!(submitter.await.unwrap());
    }

    let mut ids = Vec::new();
    while let Some(result) = rx.recv().await {
        assert!(result.ok);
        assert_eq!(result.result.as_deref(), Some("sig:shared"));
        ids.push(result.id);
    }
    ids.sort();
    let mut expected: Vec<String> = (0..CALLERS).map(|i| format!("t{i}")).collect();
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(signer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_with_new_id_joins_running_execution() {
    let signer = ScriptedSigner::new(100, 0);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    coordinator.mark_healthy();
    let inbox = inbox();

    assert!(coordinator.submit(sign_event("r1", "E1"), record(&inbox)));
    settle(40).await;
    assert!(coordinator.submit(sign_event("r2", "E1"), record(&inbox)));
    settle(300).await;

    assert_eq!(signer.calls(), 1);
    let results = received(&inbox);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, "r1");
    assert_eq!(results[1].id, "r2");
    assert!(results.iter().all(|r| r.ok));
    assert_eq!(results[0].result, results[1].result);
}

// ── Cache ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cached_result_is_served_within_ttl() {
    let mut config = BrokerConfig::default();
    config.cache.ttl = Duration::from_millis(1_000);
    let signer = ScriptedSigner::new(0, 0);
    let coordinator = coordinator_with(config, signer.clone());
    coordinator.mark_healthy();

    let first = coordinator.request(encrypt("r1", "hello")).await;
    let second = coordinator.request(encrypt("r2", "hello")).await;
    assert!(first.ok && second.ok);
    assert_eq!(second.id, "r2");
    assert_eq!(signer.calls(), 1);

    settle(1_100).await;
    let third = coordinator.request(encrypt("r3", "hello")).await;
    assert!(third.ok);
    assert_eq!(signer.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_not_cached() {
    let signer = ScriptedSigner::new(0, 1);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    coordinator.mark_healthy();

    let first = coordinator.request(encrypt("r1", "hello")).await;
    assert!(!first.ok);
    assert_eq!(first.failure, Some(FailureKind::ExecutionFailed));
    assert_eq!(first.reason.as_deref(), Some("Signer not ready: attempt 1"));

    let second = coordinator.request(encrypt("r2", "hello")).await;
    assert!(second.ok);
    assert_eq!(signer.calls(), 2);
}

// ── Admission ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rate_limit_admits_exactly_ceiling_per_window() {
    let mut config = BrokerConfig::default();
    config.rate_limit.max_requests = 3;
    config.rate_limit.window = Duration::from_millis(1_000);
    let coordinator = coordinator_with(config, ScriptedSigner::new(0, 0));
    let inbox = inbox();

    for i in 0..3 {
        assert!(coordinator.submit(encrypt(&format!("r{i}"), &format!("m{i}")), record(&inbox)));
    }
    assert!(!coordinator.submit(encrypt("r3", "m3"), record(&inbox)));

    let rejected = received(&inbox);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].id, "r3");
    assert_eq!(rejected[0].failure, Some(FailureKind::RateLimited));
    assert_eq!(rejected[0].reason.as_deref(), Some("rate limit exceeded"));

    let other_app = SignRequest::new(RequestType::GetPublicKey, "coracle");
    assert!(coordinator.submit(other_app, |_| {}));

    tokio::time::advance(Duration::from_millis(1_000)).await;
    assert!(coordinator.submit(encrypt("r4", "m4"), record(&inbox)));
}

#[tokio::test(start_paused = true)]
async fn pending_queue_rejects_when_full() {
    let mut config = BrokerConfig::default();
    config.queue_capacity = 3;
    let coordinator = coordinator_with(config, ScriptedSigner::new(0, 0));
    let inbox = inbox();

    let accepted: Vec<bool> = (0..5)
        .map(|i| coordinator.submit(encrypt(&format!("r{i}"), &format!("m{i}")), record(&inbox)))
        .collect();
    assert_eq!(accepted, vec![true, true, true, false, false]);

    let rejected = received(&inbox);
    assert_eq!(rejected.len(), 2);
    assert!(
        rejected
            .iter()
            .all(|r| r.failure == Some(FailureKind::QueueFull)
                && r.reason.as_deref() == Some("queue full"))
    );

    // A duplicate of a queued request merges instead of needing a slot.
    assert!(coordinator.submit(encrypt("r0-retry", "m0"), record(&inbox)));
    let diagnostics = coordinator.diagnostics();
    assert_eq!(diagnostics.pending, 3);
    assert_eq!(diagnostics.in_flight_waiters, 4);
}

// ── Health and wakeup ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn one_wake_signal_per_unavailable_period() {
    let wake = Arc::new(CountingWake::default());
    let coordinator = Coordinator::builder(BrokerConfig::default())
        .executor(ScriptedSigner::new(0, 0))
        .wake_signal(wake.clone())
        .build()
        .unwrap();

    for i in 0..10 {
        coordinator.submit(encrypt(&format!("r{i}"), &format!("m{i}")), |_| {});
    }
    assert_eq!(wake.sent.load(Ordering::SeqCst), 1);
    assert!(coordinator.diagnostics().wakeup_sent);

    coordinator.mark_healthy();
    assert!(!coordinator.diagnostics().wakeup_sent);
    coordinator.mark_unhealthy();

    coordinator.submit(encrypt("s1", "n1"), |_| {});
    coordinator.submit(encrypt("s2", "n2"), |_| {});
    assert_eq!(wake.sent.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn health_timeout_sends_new_work_to_queue() {
    let signer = ScriptedSigner::new(0, 0);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    coordinator.mark_healthy();

    assert!(coordinator.request(encrypt("r1", "before")).await.ok);
    settle(5_100).await;
    assert_eq!(coordinator.health_state(), HealthState::Unhealthy);

    coordinator.submit(encrypt("r2", "after"), |_| {});
    settle(10).await;
    assert_eq!(signer.calls(), 1);
    assert_eq!(coordinator.diagnostics().pending, 1);
}

#[tokio::test(start_paused = true)]
async fn mark_healthy_drains_queue_in_order() {
    let signer = ScriptedSigner::new(0, 0);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    let inbox = inbox();

    for i in 0..4 {
        coordinator.submit(encrypt(&format!("r{i}"), &format!("m{i}")), record(&inbox));
    }
    coordinator.mark_healthy();
    settle(10).await;

    let ids: Vec<String> = received(&inbox).into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["r0", "r1", "r2", "r3"]);
    assert_eq!(signer.calls(), 4);
}

// ── Bootstrap ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn bootstrap_probes_one_at_a_time_until_success() {
    let signer = ScriptedSigner::new(10, 2);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    let inbox = inbox();

    for i in 1..=5 {
        coordinator.submit(encrypt(&format!("r{i}"), &format!("m{i}")), record(&inbox));
    }

    let (tx, rx) = oneshot::channel();
    let probe_signer = signer.clone();
    assert!(coordinator.bootstrap(move |outcome| {
        let _ = tx.send((outcome, probe_signer.calls()));
    }));

    let (outcome, calls_at_promotion) = rx.await.unwrap();
    assert_eq!(outcome, BootstrapOutcome::Promoted { attempts: 3 });
    assert_eq!(calls_at_promotion, 3);

    settle(50).await;
    assert_eq!(signer.calls(), 5);
    assert!(coordinator.is_healthy());

    let mut results = received(&inbox);
    results.sort_by(|a, b| a.id.cmp(&b.id));
    let summary: Vec<(String, bool)> = results.into_iter().map(|r| (r.id, r.ok)).collect();
    assert_eq!(
        summary,
        vec![
            ("r1".to_string(), false),
            ("r2".to_string(), false),
            ("r3".to_string(), true),
            ("r4".to_string(), true),
            ("r5".to_string(), true),
        ]
    );
}

// ── Batching ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn batch_window_releases_individual_executions_together() {
    let signer = ScriptedSigner::new(0, 0);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    coordinator.mark_healthy();
    let inbox = inbox();

    for i in 0..5 {
        coordinator.submit(sign_event(&format!("r{i}"), &format!("E{i}")), record(&inbox));
    }
    settle(50).await;
    assert_eq!(signer.calls(), 0);
    assert_eq!(coordinator.diagnostics().batch.queued, 5);

    settle(60).await;
    assert_eq!(signer.calls(), 5);

    let mut outputs: Vec<String> = received(&inbox)
        .into_iter()
        .filter_map(|r| r.result)
        .collect();
    outputs.sort();
    outputs.dedup();
    assert_eq!(outputs.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn batch_flush_waits_for_previous_batch() {
    let signer = ScriptedSigner::new(300, 0);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    coordinator.mark_healthy();

    coordinator.submit(sign_event("a1", "A1"), |_| {});
    coordinator.submit(sign_event("a2", "A2"), |_| {});
    settle(150).await;
    assert_eq!(signer.calls(), 2);

    coordinator.submit(sign_event("b1", "B1"), |_| {});
    settle(150).await;
    let diagnostics = coordinator.diagnostics();
    assert_eq!(signer.calls(), 2);
    assert!(diagnostics.batch.flush_deferred);
    assert_eq!(diagnostics.batch.in_flight, 2);

    settle(110).await;
    assert_eq!(signer.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn panicking_signer_fails_request_and_releases_batch() {
    let coordinator = Coordinator::builder(BrokerConfig::default())
        .executor(Arc::new(PanickingSigner))
        .build()
        .unwrap();
    coordinator.mark_healthy();

    let result = coordinator.request(sign_event("r1", "E1")).await;
    assert!(!result.ok);
    assert_eq!(result.failure, Some(FailureKind::ExecutionFailed));
    assert_eq!(coordinator.diagnostics().batch.in_flight, 0);
}

// ── Out-of-band delivery and lifecycle ──────────────────────────────

#[tokio::test(start_paused = true)]
async fn result_by_id_reaches_every_merged_waiter() {
    let coordinator = coordinator_with(BrokerConfig::default(), ScriptedSigner::new(0, 0));
    let inbox = inbox();

    coordinator.submit(sign_event("r1", "E1"), record(&inbox));
    coordinator.submit(sign_event("r2", "E1"), record(&inbox));

    assert!(coordinator.approve_request("r2", Some("sig".to_string()), Some("{}".to_string())));
    assert!(!coordinator.approve_request("r2", None, None));

    let results = received(&inbox);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, "r1");
    assert_eq!(results[1].id, "r2");
    assert!(results.iter().all(|r| r.ok && r.result.as_deref() == Some("sig")));
    assert_eq!(results[0].request_type, RequestType::SignEvent);

    assert!(!coordinator.deliver_result_by_request_id(
        "missing",
        SignResult::success(&sign_event("missing", "E9"), "x")
    ));
}

#[tokio::test(start_paused = true)]
async fn settled_by_id_then_resubmitted_executes_once() {
    let signer = ScriptedSigner::new(100, 0);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    let inbox = inbox();

    coordinator.submit(encrypt("r1", "hello"), record(&inbox));
    assert!(coordinator.deliver_result_by_request_id(
        "r1",
        SignResult::failure(&encrypt("r1", "hello"), FailureKind::ExecutionFailed)
    ));
    assert_eq!(coordinator.diagnostics().pending, 0);

    coordinator.submit(encrypt("r2", "hello"), record(&inbox));
    assert_eq!(coordinator.diagnostics().pending, 1);
    coordinator.mark_healthy();
    settle(200).await;

    assert_eq!(signer.calls(), 1);
    let results = received(&inbox);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, "r1");
    assert_eq!(results[0].failure, Some(FailureKind::ExecutionFailed));
    assert_eq!(results[1].id, "r2");
    assert!(results[1].ok);
}

#[tokio::test(start_paused = true)]
async fn stale_batch_entry_is_not_executed() {
    let signer = ScriptedSigner::new(0, 0);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    coordinator.mark_healthy();
    let inbox = inbox();

    coordinator.submit(sign_event("r1", "E1"), record(&inbox));
    assert!(coordinator.deliver_result_by_request_id(
        "r1",
        SignResult::failure(&sign_event("r1", "E1"), FailureKind::ExecutionFailed)
    ));
    coordinator.submit(sign_event("r2", "E1"), record(&inbox));
    assert_eq!(coordinator.diagnostics().batch.queued, 2);

    settle(150).await;
    assert_eq!(signer.calls(), 1);
    let results = received(&inbox);
    assert_eq!(results.len(), 2);
    assert!(!results[0].ok);
    assert!(results[1].ok);
    assert_eq!(coordinator.diagnostics().batch.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn late_execution_does_not_replace_denial() {
    let signer = ScriptedSigner::new(100, 0);
    let coordinator = coordinator_with(BrokerConfig::default(), signer.clone());
    coordinator.mark_healthy();
    let inbox = inbox();

    coordinator.submit(encrypt("r1", "secret"), record(&inbox));
    settle(10).await;
    assert_eq!(signer.calls(), 1);
    assert!(coordinator.deny_request("r1", None));

    settle(200).await;
    let results = received(&inbox);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].failure, Some(FailureKind::Denied));

    let retry = coordinator.request(encrypt("r2", "secret")).await;
    assert_eq!(retry.id, "r2");
    assert_eq!(retry.failure, Some(FailureKind::Denied));
    assert_eq!(signer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn reset_fails_outstanding_waiters_once() {
    let coordinator = coordinator_with(BrokerConfig::default(), ScriptedSigner::new(0, 0));
    let inbox = inbox();

    for i in 0..3 {
        coordinator.submit(encrypt(&format!("r{i}"), &format!("m{i}")), record(&inbox));
    }
    coordinator.try_become_active_handler("signing-activity");
    coordinator.reset();

    let results = received(&inbox);
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.failure == Some(FailureKind::Reset)));

    let diagnostics = coordinator.diagnostics();
    assert_eq!(diagnostics.pending, 0);
    assert_eq!(diagnostics.in_flight_keys, 0);
    assert_eq!(diagnostics.health, HealthState::Unhealthy);
    assert!(diagnostics.active_handler.is_none());

    coordinator.mark_healthy();
    settle(10).await;
    assert_eq!(received(&inbox).len(), 3);
    assert!(coordinator.request(encrypt("fresh", "m0")).await.ok);
}

#[tokio::test(start_paused = true)]
async fn diagnostics_serialize_to_json() {
    let coordinator = coordinator_with(BrokerConfig::default(), ScriptedSigner::new(0, 0));
    coordinator.submit(encrypt("r1", "m1"), |_| {});

    let json = coordinator.diagnostics().to_json();
    assert_eq!(json["health"], "unhealthy");
    assert_eq!(json["pending"], 1);
    assert_eq!(json["pending_capacity"], 64);
    assert_eq!(json["batch"]["kind"], "sign_event");
    assert!(json["captured_at"].is_string());
}
