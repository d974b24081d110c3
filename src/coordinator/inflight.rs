//! Registry of executions currently in progress and the callers waiting on
//! each of them.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::request::{DedupeKey, RequestType, SignResult};

/// Callback receiving exactly one result for a submitted request.
pub type ResultCallback = Box<dyn FnOnce(SignResult) + Send + 'static>;

/// A caller awaiting the result of one logical operation.
pub(crate) struct Waiter {
    request_id: String,
    callback: ResultCallback,
}

impl Waiter {
    pub(crate) fn new(request_id: impl Into<String>, callback: ResultCallback) -> Self {
        Self {
            request_id: request_id.into(),
            callback,
        }
    }

    pub(crate) fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Hand the result to the caller, addressed to its own request id.
    ///
    /// A panicking callback is logged and swallowed so sibling waiters still
    /// receive their copy.
    pub(crate) fn deliver(self, result: &SignResult) {
        let Waiter {
            request_id,
            callback,
        } = self;
        let addressed = result.for_request(&request_id);
        if catch_unwind(AssertUnwindSafe(move || callback(addressed))).is_err() {
            tracing::error!(request_id = %request_id, "Result callback panicked");
        }
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// Waiters grouped under one dedup key.
///
/// `generation` is unique per registration, so queue entries and executions
/// started for an entry that has since been settled can tell they are stale.
#[derive(Debug)]
pub(crate) struct InFlightEntry {
    pub request_type: RequestType,
    pub generation: u64,
    pub dispatched: bool,
    pub waiters: Vec<Waiter>,
}

/// Dedup key to waiters, plus request id to dedup key for out-of-band
/// delivery. Not synchronized itself; lives inside the dispatch lock.
#[derive(Debug, Default)]
pub(crate) struct InFlightRegistry {
    entries: HashMap<DedupeKey, InFlightEntry>,
    request_keys: HashMap<String, DedupeKey>,
    next_generation: u64,
}

impl InFlightRegistry {
    /// True while `generation` is the live entry for `key` and nothing has
    /// been sent to the executor for it yet.
    pub(crate) fn awaits_dispatch(&self, key: &DedupeKey, generation: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation && !entry.dispatched)
    }

    /// Mark the entry as handed to the executor. Returns false if it is stale
    /// or already dispatched; the caller must then not execute it.
    pub(crate) fn claim_dispatch(&mut self, key: &DedupeKey, generation: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.generation == generation && !entry.dispatched => {
                entry.dispatched = true;
                true
            }
            _ => false,
        }
    }

    /// Attach `waiter` to an existing entry, or hand it back if `key` is not
    /// in flight.
    pub(crate) fn join(&mut self, key: &DedupeKey, waiter: Waiter) -> Result<(), Waiter> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                self.request_keys
                    .insert(waiter.request_id.clone(), key.clone());
                entry.waiters.push(waiter);
                Ok(())
            }
            None => Err(waiter),
        }
    }

    /// Open a new entry for `key` with its first waiter and return its
    /// generation.
    pub(crate) fn register(
        &mut self,
        key: DedupeKey,
        request_type: RequestType,
        waiter: Waiter,
    ) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.request_keys
            .insert(waiter.request_id.clone(), key.clone());
        self.entries.insert(
            key,
            InFlightEntry {
                request_type,
                generation,
                dispatched: false,
                waiters: vec![waiter],
            },
        );
        generation
    }

    /// Remove the entry for `key` along with its request id mappings.
    pub(crate) fn take(&mut self, key: &DedupeKey) -> Option<InFlightEntry> {
        let entry = self.entries.remove(key)?;
        for waiter in &entry.waiters {
            if self.request_keys.get(&waiter.request_id) == Some(key) {
                self.request_keys.remove(&waiter.request_id);
            }
        }
        Some(entry)
    }

    /// Like [`take`](Self::take), but only if `generation` is still the live
    /// entry for `key`.
    pub(crate) fn take_current(
        &mut self,
        key: &DedupeKey,
        generation: u64,
    ) -> Option<InFlightEntry> {
        if self.entries.get(key)?.generation != generation {
            return None;
        }
        self.take(key)
    }

    /// Remove whichever entry `request_id` is waiting on.
    pub(crate) fn take_by_request_id(
        &mut self,
        request_id: &str,
    ) -> Option<(DedupeKey, InFlightEntry)> {
        let key = self.request_keys.get(request_id)?.clone();
        let entry = self.take(&key)?;
        Some((key, entry))
    }

    pub(crate) fn lookup(&self, request_id: &str) -> Option<(DedupeKey, RequestType)> {
        let key = self.request_keys.get(request_id)?;
        let entry = self.entries.get(key)?;
        Some((key.clone(), entry.request_type))
    }

    pub(crate) fn drain(&mut self) -> Vec<InFlightEntry> {
        self.request_keys.clear();
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.entries.values().map(|entry| entry.waiters.len()).sum()
    }
}
