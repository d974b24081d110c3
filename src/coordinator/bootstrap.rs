//! Cold-start probing.
//!
//! The first time the signer becomes reachable nothing proves it can actually
//! serve requests, so the queue is drained one entry at a time until a single
//! execution succeeds. Only then is the signer promoted and the rest of the
//! queue released in bulk.

use serde::Serialize;

use super::{Coordinator, deliver_all};

/// How a bootstrap run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BootstrapOutcome {
    /// A probe succeeded and the signer was promoted to healthy.
    Promoted { attempts: usize },
    /// The queue ran dry before any probe succeeded.
    Exhausted { attempts: usize },
    /// The signer was already healthy; the queue was drained normally.
    AlreadyHealthy,
}

impl BootstrapOutcome {
    pub fn is_promoted(&self) -> bool {
        matches!(self, BootstrapOutcome::Promoted { .. })
    }

    pub fn attempts(&self) -> usize {
        match self {
            BootstrapOutcome::Promoted { attempts } | BootstrapOutcome::Exhausted { attempts } => {
                *attempts
            }
            BootstrapOutcome::AlreadyHealthy => 0,
        }
    }
}

impl Coordinator {
    /// Probe the pending queue one request at a time.
    ///
    /// `on_complete` runs once with the outcome, before the signer is marked
    /// healthy. Returns false if a bootstrap is already running.
    pub fn bootstrap<F>(&self, on_complete: F) -> bool
    where
        F: FnOnce(BootstrapOutcome) + Send + 'static,
    {
        let started = {
            let mut state = self.state();
            if state.bootstrapping {
                tracing::warn!("Bootstrap already running, ignoring request");
                return false;
            }
            if state.health.is_healthy() {
                None
            } else {
                state.bootstrapping = true;
                Some((state.epoch, state.pending.len()))
            }
        };

        let Some((epoch, pending)) = started else {
            tracing::info!("Bootstrap requested while healthy, draining queue");
            self.process_pending_queue();
            on_complete(BootstrapOutcome::AlreadyHealthy);
            return true;
        };

        tracing::info!(pending, "Starting bootstrap");
        let this = self.clone();
        self.shared.runtime.spawn(async move {
            let outcome = this.run_bootstrap(epoch).await;
            let current = {
                let mut state = this.state();
                if state.epoch == epoch {
                    state.bootstrapping = false;
                    true
                } else {
                    false
                }
            };

            tracing::info!(?outcome, "Bootstrap finished");
            on_complete(outcome);
            if current && outcome.is_promoted() {
                this.mark_healthy();
            }
        });
        true
    }

    async fn run_bootstrap(&self, epoch: u64) -> BootstrapOutcome {
        let mut attempts = 0;
        loop {
            let entry = {
                let mut state = self.state();
                if state.epoch != epoch {
                    return BootstrapOutcome::Exhausted { attempts };
                }
                if state.health.is_healthy() {
                    return BootstrapOutcome::AlreadyHealthy;
                }
                let Some(entry) = state.pending.pop() else {
                    return BootstrapOutcome::Exhausted { attempts };
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
                state.in_flight.claim_dispatch(&entry.key, entry.generation);
                entry
            };

            attempts += 1;
            tracing::debug!(
                attempt = attempts,
                request_id = %entry.request.id,
                key = %entry.key,
                "Bootstrap probe"
            );
            let result = self.invoke_executor(&entry.request).await;
            if self.state().epoch != epoch {
                return BootstrapOutcome::Exhausted { attempts };
            }

            self.settle(&entry.key, entry.generation, &result);
            if result.ok {
                return BootstrapOutcome::Promoted { attempts };
            }
            tracing::warn!(
                attempt = attempts,
                request_id = %entry.request.id,
                reason = result.reason.as_deref().unwrap_or_default(),
                "Bootstrap probe failed, trying next queued request"
            );
        }
    }
}
