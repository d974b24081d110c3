//! Bounded FIFO of requests parked while the signer is cold, and the latch
//! that keeps wake signals to one per unhealthy period.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::request::{DedupeKey, SignRequest};

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: SignRequest,
    pub key: DedupeKey,
    /// Generation of the in-flight entry this request was queued for.
    pub generation: u64,
    pub enqueued_at: Instant,
}

impl PendingRequest {
    pub fn new(request: SignRequest, key: DedupeKey, generation: u64) -> Self {
        Self {
            request,
            key,
            generation,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingQueue {
    entries: VecDeque<PendingRequest>,
    capacity: usize,
}

impl PendingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Append to the tail, handing the entry back when full.
    pub(crate) fn push(&mut self, entry: PendingRequest) -> Result<(), PendingRequest> {
        if self.is_full() {
            return Err(entry);
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<PendingRequest> {
        self.entries.pop_front()
    }

    /// Drop every queued entry for `key`. Returns how many were removed.
    pub(crate) fn discard(&mut self, key: &DedupeKey) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| &entry.key != key);
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Set once a wake signal has gone out; cleared when the signer turns
/// healthy or the send fails.
#[derive(Debug, Default)]
pub(crate) struct WakeupLatch {
    sent: bool,
}

impl WakeupLatch {
    /// Returns true for the caller that should send the signal.
    pub(crate) fn try_claim(&mut self) -> bool {
        if self.sent {
            return false;
        }
        self.sent = true;
        true
    }

    pub(crate) fn reset(&mut self) {
        self.sent = false;
    }

    pub(crate) fn is_sent(&self) -> bool {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestType;

    fn entry(id: &str) -> PendingRequest {
        let request = SignRequest::new(RequestType::Nip04Encrypt, "app")
            .with_id(id)
            .with_param("pubkey", "pk")
            .with_param("plaintext", id);
        let key = request.dedupe_key();
        PendingRequest::new(request, key, 1)
    }

    #[test]
    fn queue_is_fifo_and_bounded() {
        let mut queue = PendingQueue::new(2);
        assert!(queue.push(entry("a")).is_ok());
        assert!(queue.push(entry("b")).is_ok());
        assert!(queue.is_full());

        let rejected = queue.push(entry("c")).unwrap_err();
        assert_eq!(rejected.request.id, "c");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().map(|e| e.request.id), Some("a".to_string()));
        assert_eq!(queue.pop().map(|e| e.request.id), Some("b".to_string()));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn discard_removes_only_matching_key() {
        let mut queue = PendingQueue::new(4);
        let kept = entry("a");
        queue.push(entry("b")).unwrap();
        queue.push(kept.clone()).unwrap();
        queue.push(entry("b")).unwrap();

        assert_eq!(queue.discard(&entry("b").key), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().map(|e| e.key), Some(kept.key));
    }

    #[test]
    fn latch_claims_once_until_reset() {
        let mut latch = WakeupLatch::default();
        assert!(latch.try_claim());
        assert!(!latch.try_claim());
        assert!(latch.is_sent());

        latch.reset();
        assert!(latch.try_claim());
    }
}
