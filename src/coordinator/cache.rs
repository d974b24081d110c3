//! Short-lived result cache keyed by dedup key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::lock;
use crate::config::CacheConfig;
use crate::request::{DedupeKey, SignResult};

#[derive(Debug, Clone)]
struct CachedResult {
    result: SignResult,
    stored_at: Instant,
}

/// Bounded TTL cache of settled results.
///
/// Transient failures are refused at insert time so a retry after the
/// signer recovers always reaches the executor.
#[derive(Debug)]
pub struct ResultCache {
    entries: Mutex<HashMap<DedupeKey, CachedResult>>,
    ttl: Duration,
    capacity: usize,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: config.ttl,
            capacity: config.capacity,
        }
    }

    pub fn get(&self, key: &DedupeKey) -> Option<SignResult> {
        self.get_at(key, Instant::now())
    }

    /// Look up a live entry, evicting it if its TTL has passed.
    pub fn get_at(&self, key: &DedupeKey, now: Instant) -> Option<SignResult> {
        let mut entries = lock(&self.entries);
        let expired = match entries.get(key) {
            Some(entry) if now.saturating_duration_since(entry.stored_at) < self.ttl => {
                return Some(entry.result.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: DedupeKey, result: SignResult) -> bool {
        self.insert_at(key, result, Instant::now())
    }

    /// Store `result` unless it is a transient failure.
    pub fn insert_at(&self, key: DedupeKey, result: SignResult, now: Instant) -> bool {
        if result.is_transient_failure() {
            tracing::debug!(key = %key, "Not caching transient failure");
            return false;
        }

        let mut entries = lock(&self.entries);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, entry| now.saturating_duration_since(entry.stored_at) < ttl);

            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.stored_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    tracing::debug!(key = %oldest, "Result cache full, evicting oldest entry");
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            CachedResult {
                result,
                stored_at: now,
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}
