//! Request coordinator.
//!
//! Sits between many concurrent callers and one slow, possibly sleeping
//! signer. Every submission passes rate limiting, the result cache and the
//! in-flight merge before anything reaches the executor, so each logical
//! operation runs at most once at a time no matter how often callers retry.

mod batch;
mod bootstrap;
mod cache;
mod diagnostics;
mod health;
mod inflight;
mod pending;
mod rate_limit;
mod timer;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::config::BrokerConfig;
use crate::error::{CoordinatorError, FailureKind};
use crate::handler::ActiveHandlerSlot;
use crate::ports::{NoopWakeSignal, SignerExecutor, WakeSignal};
use crate::request::{DedupeKey, SignRequest, SignResult};

use self::batch::{Batcher, FlushDecision};
use self::health::HealthTracker;
use self::inflight::{InFlightEntry, InFlightRegistry, Waiter};
use self::pending::{PendingQueue, WakeupLatch};
use self::timer::OneShotTimer;

pub use self::batch::BatchedRequest;
pub use self::bootstrap::BootstrapOutcome;
pub use self::cache::ResultCache;
pub use self::diagnostics::{BatchDiagnostics, DiagnosticsSnapshot};
pub use self::health::HealthState;
pub use self::inflight::ResultCallback;
pub use self::pending::PendingRequest;
pub use self::rate_limit::{RateLimitEntry, RateLimiter};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything that must change together under one lock: the in-flight
/// check-then-insert, the health-dependent routing decision and the queue
/// bound are evaluated atomically per submission.
#[derive(Debug)]
struct DispatchState {
    health: HealthTracker,
    wakeup: WakeupLatch,
    pending: PendingQueue,
    in_flight: InFlightRegistry,
    batcher: Batcher,
    bootstrapping: bool,
    /// Bumped by `reset()`; work started under an older epoch is discarded.
    epoch: u64,
}

impl DispatchState {
    fn new(config: &BrokerConfig) -> Self {
        Self {
            health: HealthTracker::new(),
            wakeup: WakeupLatch::default(),
            pending: PendingQueue::new(config.queue_capacity),
            in_flight: InFlightRegistry::default(),
            batcher: Batcher::new(config.batch.kind),
            bootstrapping: false,
            epoch: 0,
        }
    }

    /// Drop released batch entries whose waiters were already served and
    /// count the rest as executing.
    fn claim_batch(&mut self, entries: Vec<BatchedRequest>) -> Vec<BatchedRequest> {
        let live: Vec<BatchedRequest> = entries
            .into_iter()
            .filter(|entry| self.in_flight.claim_dispatch(&entry.key, entry.generation))
            .collect();
        self.batcher.mark_dispatched(live.len());
        live
    }
}

struct Shared {
    config: BrokerConfig,
    runtime: Handle,
    executor: RwLock<Option<Arc<dyn SignerExecutor>>>,
    wake_signal: Arc<dyn WakeSignal>,
    rate_limiter: RateLimiter,
    cache: ResultCache,
    dispatch: Mutex<DispatchState>,
    health_timer: OneShotTimer,
    batch_timer: OneShotTimer,
    handler: ActiveHandlerSlot,
}

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder {
    config: BrokerConfig,
    executor: Option<Arc<dyn SignerExecutor>>,
    wake_signal: Arc<dyn WakeSignal>,
    runtime: Option<Handle>,
}

impl CoordinatorBuilder {
    pub fn executor(mut self, executor: Arc<dyn SignerExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn wake_signal(mut self, wake_signal: Arc<dyn WakeSignal>) -> Self {
        self.wake_signal = wake_signal;
        self
    }

    /// Runtime used for executions and timers. Defaults to the runtime the
    /// builder is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Coordinator, CoordinatorError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| CoordinatorError::NoRuntime(e.to_string()))?,
        };
        let config = self.config;

        tracing::debug!(
            queue_capacity = config.queue_capacity,
            batch_kind = %config.batch.kind,
            "Coordinator initialized"
        );

        Ok(Coordinator {
            shared: Arc::new(Shared {
                runtime,
                executor: RwLock::new(self.executor),
                wake_signal: self.wake_signal,
                rate_limiter: RateLimiter::new(config.rate_limit),
                cache: ResultCache::new(config.cache),
                dispatch: Mutex::new(DispatchState::new(&config)),
                health_timer: OneShotTimer::new("health"),
                batch_timer: OneShotTimer::new("batch"),
                handler: ActiveHandlerSlot::new(),
                config,
            }),
        })
    }
}

/// Handle to the shared coordinator. Cheap to clone; all clones drive the
/// same state.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn builder(config: BrokerConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            executor: None,
            wake_signal: Arc::new(NoopWakeSignal),
            runtime: None,
        }
    }

    /// Coordinator with no executor and a no-op wake signal, bound to the
    /// current runtime.
    pub fn new(config: BrokerConfig) -> Result<Self, CoordinatorError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    fn from_weak(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn state(&self) -> MutexGuard<'_, DispatchState> {
        lock(&self.shared.dispatch)
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Submit a request.
    ///
    /// Returns `false` when the request was rejected; the callback has then
    /// already run with the failure. Returns `true` when the callback will
    /// run exactly once, possibly before this call returns.
    pub fn submit<F>(&self, request: SignRequest, callback: F) -> bool
    where
        F: FnOnce(SignResult) + Send + 'static,
    {
        self.submit_boxed(request, Box::new(callback))
    }

    pub fn submit_boxed(&self, request: SignRequest, callback: ResultCallback) -> bool {
        if !self.shared.rate_limiter.check(&request.calling_app) {
            tracing::warn!(
                calling_app = %request.calling_app,
                request_id = %request.id,
                "Rate limit exceeded, rejecting request"
            );
            callback(SignResult::failure(&request, FailureKind::RateLimited));
            return false;
        }

        let key = request.dedupe_key();
        let waiter = Waiter::new(request.id.clone(), callback);
        let mut state = self.state();

        if let Some(cached) = self.shared.cache.get(&key) {
            drop(state);
            tracing::debug!(key = %key, request_id = %request.id, "Serving cached result");
            waiter.deliver(&cached);
            return true;
        }

        let waiter = match state.in_flight.join(&key, waiter) {
            Ok(()) => {
                tracing::debug!(
                    key = %key,
                    request_id = %request.id,
                    "Merged into in-flight execution"
                );
                return true;
            }
            Err(waiter) => waiter,
        };

        let healthy = state.health.is_healthy();
        if !healthy && state.pending.is_full() {
            let pending = state.pending.len();
            drop(state);
            tracing::warn!(
                key = %key,
                request_id = %request.id,
                pending,
                "Pending queue full, rejecting request"
            );
            waiter.deliver(&SignResult::failure(&request, FailureKind::QueueFull));
            return false;
        }

        let generation = state
            .in_flight
            .register(key.clone(), request.request_type, waiter);

        if !healthy {
            let request_id = request.id.clone();
            let queued = PendingRequest::new(request, key, generation);
            if let Err(rejected) = state.pending.push(queued) {
                // Capacity was checked under this same lock.
                tracing::error!(key = %rejected.key, "Pending queue rejected a checked entry");
            }
            let pending = state.pending.len();
            let send_wake = state.wakeup.try_claim();
            drop(state);

            tracing::debug!(request_id = %request_id, pending, "Queued while signer unavailable");
            if send_wake {
                self.send_wake();
            }
        } else if state.batcher.accepts(request.request_type) {
            let schedule = state.batcher.push(BatchedRequest {
                request,
                key,
                generation,
            });
            drop(state);
            if schedule {
                self.schedule_batch_flush();
            }
        } else {
            state.in_flight.claim_dispatch(&key, generation);
            let epoch = state.epoch;
            drop(state);
            self.spawn_execution(request, key, generation, false, epoch);
        }
        true
    }

    /// Submit and await the result.
    pub async fn request(&self, request: SignRequest) -> SignResult {
        let (tx, rx) = oneshot::channel();
        let request_type = request.request_type;
        let request_id = request.id.clone();

        self.submit(request, move |result| {
            let _ = tx.send(result);
        });

        rx.await.unwrap_or_else(|_| {
            SignResult::rejected(
                request_type,
                request_id,
                FailureKind::Reset,
                FailureKind::Reset.default_reason(),
            )
        })
    }

    // ── Result delivery ─────────────────────────────────────────────

    /// Deliver `result` to every waiter of the request known by `request_id`.
    ///
    /// Returns false if no in-flight request has that id. Queued copies of
    /// the request are dropped, and an execution already running for it has
    /// its result discarded.
    pub fn deliver_result_by_request_id(&self, request_id: &str, result: SignResult) -> bool {
        let taken = {
            let mut state = self.state();
            let taken = state.in_flight.take_by_request_id(request_id);
            if let Some((key, _)) = &taken {
                let discarded = state.pending.discard(key);
                if discarded > 0 {
                    tracing::debug!(
                        key = %key,
                        discarded,
                        "Dropped queued copies of settled request"
                    );
                }
                self.shared.cache.insert(key.clone(), result.clone());
            }
            taken
        };
        let Some((key, entry)) = taken else {
            tracing::debug!(request_id, "No in-flight request for result delivery");
            return false;
        };
        let delivered = deliver_all(entry, &result);
        tracing::debug!(key = %key, delivered, ok = result.ok, "Delivered result by request id");
        delivered > 0
    }

    /// Complete a request from an out-of-band approval.
    pub fn approve_request(
        &self,
        request_id: &str,
        result: Option<String>,
        event: Option<String>,
    ) -> bool {
        let Some((_, request_type)) = self.state().in_flight.lookup(request_id) else {
            tracing::debug!(request_id, "Approval for unknown request ignored");
            return false;
        };
        tracing::info!(request_id, "Request approved out of band");
        self.deliver_result_by_request_id(
            request_id,
            SignResult::approved(request_type, request_id, result, event),
        )
    }

    /// Reject a request from an out-of-band approval flow.
    pub fn deny_request(&self, request_id: &str, reason: Option<&str>) -> bool {
        let Some((_, request_type)) = self.state().in_flight.lookup(request_id) else {
            tracing::debug!(request_id, "Denial for unknown request ignored");
            return false;
        };
        tracing::info!(request_id, "Request denied out of band");
        let reason = reason.unwrap_or(FailureKind::Denied.default_reason());
        self.deliver_result_by_request_id(
            request_id,
            SignResult::rejected(request_type, request_id, FailureKind::Denied, reason),
        )
    }

    /// Cache `result` if allowed and hand it to every waiter of `key`.
    ///
    /// Does nothing when the entry dispatched under `generation` was already
    /// settled, so a late execution cannot overwrite an out-of-band result.
    fn settle(&self, key: &DedupeKey, generation: u64, result: &SignResult) -> usize {
        let entry = {
            let mut state = self.state();
            let Some(entry) = state.in_flight.take_current(key, generation) else {
                tracing::debug!(key = %key, generation, "Entry already settled, discarding result");
                return 0;
            };
            self.shared.cache.insert(key.clone(), result.clone());
            entry
        };
        let delivered = deliver_all(entry, result);
        tracing::debug!(key = %key, delivered, ok = result.ok, "Delivered result");
        delivered
    }

    // ── Execution ───────────────────────────────────────────────────

    pub fn register_executor(&self, executor: Arc<dyn SignerExecutor>) {
        *self
            .shared
            .executor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(executor);
        tracing::info!("Signer executor registered");
    }

    /// Returns true if an executor was registered.
    pub fn unregister_executor(&self) -> bool {
        let previous = self
            .shared
            .executor
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            tracing::info!("Signer executor unregistered");
        }
        previous.is_some()
    }

    pub fn has_executor(&self) -> bool {
        self.shared
            .executor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run the executor, converting absence, errors and panics into failure
    /// results addressed to `request`.
    async fn invoke_executor(&self, request: &SignRequest) -> SignResult {
        let executor = self
            .shared
            .executor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(executor) = executor else {
            tracing::warn!(request_id = %request.id, "No signer executor registered");
            return SignResult::failure(request, FailureKind::ExecutorUnavailable);
        };

        match AssertUnwindSafe(executor.execute(request))
            .catch_unwind()
            .await
        {
            Ok(Ok(mut result)) => {
                result.id = request.id.clone();
                result.request_type = request.request_type;
                if !result.ok && result.failure.is_none() {
                    result.failure = Some(FailureKind::ExecutionFailed);
                }
                result
            }
            Ok(Err(e)) => {
                tracing::warn!(request_id = %request.id, error = %e, "Signer executor failed");
                SignResult::failure_with_reason(
                    request,
                    FailureKind::ExecutionFailed,
                    e.to_string(),
                )
            }
            Err(_) => {
                tracing::error!(request_id = %request.id, "Signer executor panicked");
                SignResult::failure_with_reason(
                    request,
                    FailureKind::ExecutionFailed,
                    "signer executor panicked",
                )
            }
        }
    }

    fn spawn_execution(
        &self,
        request: SignRequest,
        key: DedupeKey,
        generation: u64,
        batched: bool,
        epoch: u64,
    ) {
        let this = self.clone();
        self.shared.runtime.spawn(async move {
            let result = this.invoke_executor(&request).await;
            this.complete_execution(&key, generation, result, epoch);
            if batched {
                this.finish_batched_execution(epoch);
            }
        });
    }

    fn complete_execution(
        &self,
        key: &DedupeKey,
        generation: u64,
        result: SignResult,
        epoch: u64,
    ) {
        if self.state().epoch != epoch {
            tracing::debug!(key = %key, "Dropping result from before reset");
            return;
        }

        self.settle(key, generation, &result);
        if result.ok {
            if self.is_healthy() {
                self.reset_health_timeout();
            } else {
                self.mark_healthy();
            }
        }
    }

    // ── Batching ────────────────────────────────────────────────────

    fn schedule_batch_flush(&self) {
        let weak = Arc::downgrade(&self.shared);
        self.shared.batch_timer.arm(
            &self.shared.runtime,
            self.shared.config.batch.window,
            move |generation| async move {
                let Some(this) = Coordinator::from_weak(&weak) else {
                    return;
                };
                if this.shared.batch_timer.claim(generation) {
                    this.flush_batch();
                }
            },
        );
    }

    fn flush_batch(&self) {
        let (batch, epoch) = {
            let mut state = self.state();
            match state.batcher.on_timer() {
                FlushDecision::Deferred { in_flight } => {
                    tracing::debug!(
                        in_flight,
                        queued = state.batcher.queued(),
                        "Batch flush deferred until in-flight executions finish"
                    );
                    return;
                }
                FlushDecision::Release(entries) => (state.claim_batch(entries), state.epoch),
            }
        };
        self.dispatch_batch(batch, epoch);
    }

    fn finish_batched_execution(&self, epoch: u64) {
        let batch = {
            let mut state = self.state();
            if state.epoch != epoch {
                return;
            }
            let released = state.batcher.finished();
            state.claim_batch(released)
        };
        self.dispatch_batch(batch, epoch);
    }

    fn dispatch_batch(&self, batch: Vec<BatchedRequest>, epoch: u64) {
        if batch.is_empty() {
            return;
        }
        tracing::info!(size = batch.len(), "Flushing batch");
        for entry in batch {
            self.spawn_execution(entry.request, entry.key, entry.generation, true, epoch);
        }
    }

    // ── Health ──────────────────────────────────────────────────────

    pub fn health_state(&self) -> HealthState {
        self.state().health.state()
    }

    pub fn is_healthy(&self) -> bool {
        self.health_state().is_healthy()
    }

    /// Declare the signer usable: clear the wake latch, arm the health
    /// timeout and drain the pending queue.
    pub fn mark_healthy(&self) {
        {
            let mut state = self.state();
            if state.health.mark_healthy() {
                tracing::info!(pending = state.pending.len(), "Signer marked healthy");
            }
            state.wakeup.reset();
        }
        self.arm_health_timeout();
        self.process_pending_queue();
    }

    pub fn mark_unhealthy(&self) {
        let changed = self.state().health.mark_unhealthy();
        self.shared.health_timer.cancel();
        if changed {
            tracing::info!("Signer marked unhealthy");
        }
    }

    /// Push the health timeout back after activity. No-op while unhealthy.
    pub fn reset_health_timeout(&self) {
        if self.is_healthy() {
            self.arm_health_timeout();
        }
    }

    fn arm_health_timeout(&self) {
        let weak = Arc::downgrade(&self.shared);
        self.shared.health_timer.arm(
            &self.shared.runtime,
            self.shared.config.health_timeout,
            move |generation| async move {
                let Some(this) = Coordinator::from_weak(&weak) else {
                    return;
                };
                if this.shared.health_timer.claim(generation) {
                    tracing::info!("Health timeout elapsed without signer activity");
                    this.mark_unhealthy();
                }
            },
        );
    }

    fn send_wake(&self) {
        match self.shared.wake_signal.send() {
            Ok(()) => tracing::info!("Wake signal sent to signer host"),
            Err(e) => {
                tracing::warn!(error = %e, "Wake signal failed, next submission will retry");
                self.state().wakeup.reset();
            }
        }
    }

    /// Drain the pending queue in submission order while healthy.
    ///
    /// Returns the number of entries routed to execution or batching.
    pub fn process_pending_queue(&self) -> usize {
        let mut dispatched = 0;
        loop {
            let mut state = self.state();
            if !state.health.is_healthy() {
                break;
            }
            let Some(entry) = state.pending.pop() else {
                break;
            };
            if !state.in_flight.awaits_dispatch(&entry.key, entry.generation) {
                continue;
            }

            if let Some(cached) = self.shared.cache.get(&entry.key) {
                let waiters = state.in_flight.take_current(&entry.key, entry.generation);
                drop(state);
                if let Some(waiters) = waiters {
                    deliver_all(waiters, &cached);
                }
                continue;
            }

            if state.batcher.accepts(entry.request.request_type) {
                let schedule = state.batcher.push(BatchedRequest {
                    request: entry.request,
                    key: entry.key,
                    generation: entry.generation,
                });
                drop(state);
                if schedule {
                    self.schedule_batch_flush();
                }
            } else {
                state.in_flight.claim_dispatch(&entry.key, entry.generation);
                let epoch = state.epoch;
                drop(state);
                self.spawn_execution(entry.request, entry.key, entry.generation, false, epoch);
            }
            dispatched += 1;
        }

        if dispatched > 0 {
            tracing::debug!(dispatched, "Drained pending queue");
        }
        dispatched
    }

    // ── Handler election ────────────────────────────────────────────

    pub fn try_become_active_handler(&self, owner: &str) -> bool {
        self.shared.handler.try_acquire(owner)
    }

    pub fn release_active_handler(&self, owner: &str) -> bool {
        self.shared.handler.release(owner)
    }

    pub fn clear_stale_handler(&self) -> Option<String> {
        self.shared.handler.clear_stale()
    }

    pub fn active_handler(&self) -> Option<String> {
        self.shared.handler.current()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Return to the freshly constructed state.
    ///
    /// Outstanding waiters receive a `Reset` failure; results of executions
    /// still running are discarded when they arrive.
    pub fn reset(&self) {
        self.shared.health_timer.cancel();
        self.shared.batch_timer.cancel();

        let orphaned = {
            let mut state = self.state();
            let orphaned = state.in_flight.drain();
            state.pending.clear();
            state.batcher.clear();
            state.health = HealthTracker::new();
            state.wakeup.reset();
            state.bootstrapping = false;
            state.epoch += 1;
            orphaned
        };
        self.shared.cache.clear();
        self.shared.rate_limiter.clear();
        self.shared.handler.clear_stale();

        let mut outstanding = 0;
        for entry in orphaned {
            let result = SignResult::rejected(
                entry.request_type,
                "",
                FailureKind::Reset,
                FailureKind::Reset.default_reason(),
            );
            outstanding += deliver_all(entry, &result);
        }
        tracing::info!(outstanding, "Coordinator reset");
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let state = self.state();
        DiagnosticsSnapshot {
            captured_at: chrono::Utc::now(),
            health: state.health.state(),
            health_age_ms: u64::try_from(state.health.since().elapsed().as_millis())
                .unwrap_or(u64::MAX),
            health_transitions: state.health.transitions(),
            health_timer_armed: self.shared.health_timer.is_armed(),
            wakeup_sent: state.wakeup.is_sent(),
            bootstrapping: state.bootstrapping,
            executor_registered: self.has_executor(),
            active_handler: self.shared.handler.current(),
            pending: state.pending.len(),
            pending_capacity: state.pending.capacity(),
            in_flight_keys: state.in_flight.len(),
            in_flight_waiters: state.in_flight.waiter_count(),
            cached_results: self.shared.cache.len(),
            tracked_callers: self.shared.rate_limiter.tracked_callers(),
            batch: BatchDiagnostics {
                kind: state.batcher.kind(),
                queued: state.batcher.queued(),
                in_flight: state.batcher.in_flight(),
                flush_scheduled: state.batcher.flush_scheduled(),
                flush_deferred: state.batcher.flush_deferred(),
            },
        }
    }
}

/// Deliver to each waiter in registration order.
fn deliver_all(entry: InFlightEntry, result: &SignResult) -> usize {
    let count = entry.waiters.len();
    for waiter in entry.waiters {
        tracing::trace!(request_id = waiter.request_id(), "Delivering result");
        waiter.deliver(result);
    }
    count
}
