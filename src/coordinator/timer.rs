//! Replaceable one-shot timers.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use super::lock;

#[derive(Debug)]
struct Armed {
    generation: u64,
    handle: AbortHandle,
}

/// At most one pending firing. Re-arming aborts the previous task, and a task
/// that lost the race to an abort is filtered out by [`OneShotTimer::claim`].
#[derive(Debug)]
pub(crate) struct OneShotTimer {
    name: &'static str,
    slot: Mutex<Option<Armed>>,
    next_generation: AtomicU64,
}

impl OneShotTimer {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Schedule `build(generation)` to run after `delay`, replacing any
    /// pending firing. The built future must call [`claim`](Self::claim)
    /// with its generation before acting.
    pub(crate) fn arm<F, Fut>(&self, runtime: &Handle, delay: Duration, build: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let action = build(generation);

        let mut slot = lock(&self.slot);
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        tracing::trace!(timer = self.name, generation, ?delay, "Timer armed");
        *slot = Some(Armed {
            generation,
            handle: task.abort_handle(),
        });
    }

    /// Consume the pending firing if it still belongs to `generation`.
    pub(crate) fn claim(&self, generation: u64) -> bool {
        let mut slot = lock(&self.slot);
        match slot.as_ref() {
            Some(armed) if armed.generation == generation => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn cancel(&self) -> bool {
        match lock(&self.slot).take() {
            Some(armed) => {
                armed.handle.abort();
                tracing::trace!(timer = self.name, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        lock(&self.slot).is_some()
    }
}
