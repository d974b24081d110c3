//! Micro-batching for one configured request kind.
//!
//! Batched requests are still executed one by one; the batcher only decides
//! *when* they are released so a burst reaches the signer together.

use std::collections::VecDeque;

use crate::request::{DedupeKey, RequestType, SignRequest};

#[derive(Debug, Clone)]
pub struct BatchedRequest {
    pub request: SignRequest,
    pub key: DedupeKey,
    pub generation: u64,
}

/// What the flush timer should do when it fires.
#[derive(Debug)]
pub(crate) enum FlushDecision {
    /// Release these entries for execution.
    Release(Vec<BatchedRequest>),
    /// A previous batch is still executing; flush when it finishes.
    Deferred { in_flight: usize },
}

#[derive(Debug)]
pub(crate) struct Batcher {
    kind: RequestType,
    queue: VecDeque<BatchedRequest>,
    flush_scheduled: bool,
    flush_deferred: bool,
    in_flight: usize,
}

impl Batcher {
    pub(crate) fn new(kind: RequestType) -> Self {
        Self {
            kind,
            queue: VecDeque::new(),
            flush_scheduled: false,
            flush_deferred: false,
            in_flight: 0,
        }
    }

    pub(crate) fn kind(&self) -> RequestType {
        self.kind
    }

    pub(crate) fn accepts(&self, request_type: RequestType) -> bool {
        request_type == self.kind
    }

    /// Queue an entry. Returns true when the caller must arm the flush timer.
    pub(crate) fn push(&mut self, entry: BatchedRequest) -> bool {
        self.queue.push_back(entry);
        if self.flush_scheduled {
            return false;
        }
        self.flush_scheduled = true;
        true
    }

    pub(crate) fn on_timer(&mut self) -> FlushDecision {
        self.flush_scheduled = false;
        if self.in_flight > 0 {
            self.flush_deferred = true;
            return FlushDecision::Deferred {
                in_flight: self.in_flight,
            };
        }
        FlushDecision::Release(self.queue.drain(..).collect())
    }

    /// Record that `count` released entries have started executing.
    pub(crate) fn mark_dispatched(&mut self, count: usize) {
        self.in_flight += count;
    }

    /// Record one finished execution. Returns the deferred batch once the
    /// last execution of the previous one completes.
    pub(crate) fn finished(&mut self) -> Vec<BatchedRequest> {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight == 0 && self.flush_deferred {
            self.flush_deferred = false;
            return self.queue.drain(..).collect();
        }
        Vec::new()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub(crate) fn flush_scheduled(&self) -> bool {
        self.flush_scheduled
    }

    pub(crate) fn flush_deferred(&self) -> bool {
        self.flush_deferred
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.flush_scheduled = false;
        self.flush_deferred = false;
        self.in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u32) -> BatchedRequest {
        let request = SignRequest::new(RequestType::SignEvent, "app")
            .with_param("event", format!(r#"{{"id":"e{n}"}}"#));
        let key = request.dedupe_key();
        BatchedRequest {
            request,
            key,
            generation: u64::from(n),
        }
    }

    #[test]
    fn only_first_push_schedules_flush() {
        let mut batcher = Batcher::new(RequestType::SignEvent);
        assert!(batcher.push(entry(1)));
        assert!(!batcher.push(entry(2)));
        assert!(!batcher.push(entry(3)));
        assert_eq!(batcher.queued(), 3);

        match batcher.on_timer() {
            FlushDecision::Release(entries) => assert_eq!(entries.len(), 3),
            other => panic!("unexpected decision: {other:?}"),
        }
        assert!(!batcher.flush_scheduled());
        assert!(batcher.push(entry(4)));
    }

    #[test]
    fn flush_waits_for_previous_batch() {
        let mut batcher = Batcher::new(RequestType::SignEvent);
        batcher.push(entry(1));
        batcher.push(entry(2));
        let FlushDecision::Release(first) = batcher.on_timer() else {
            panic!("first flush should release");
        };
        batcher.mark_dispatched(first.len());

        batcher.push(entry(3));
        assert!(matches!(
            batcher.on_timer(),
            FlushDecision::Deferred { in_flight: 2 }
        ));
        assert!(batcher.flush_deferred());

        assert!(batcher.finished().is_empty());
        let released = batcher.finished();
        assert_eq!(released.len(), 1);
        assert!(!batcher.flush_deferred());
    }

    #[test]
    fn accepts_only_configured_kind() {
        let batcher = Batcher::new(RequestType::Nip44Encrypt);
        assert!(batcher.accepts(RequestType::Nip44Encrypt));
        assert!(!batcher.accepts(RequestType::SignEvent));
        assert_eq!(batcher.kind(), RequestType::Nip44Encrypt);
    }
}
