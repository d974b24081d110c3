//! Single-owner election for the request-handling surface.
//!
//! When several UI surfaces could process signing requests, only one may be
//! the active handler at a time. Ownership is explicit: a surface acquires,
//! releases when done, and a watchdog can clear an owner that went away
//! without releasing.

use std::sync::Mutex;

use crate::coordinator::lock;

#[derive(Debug, Default)]
pub struct ActiveHandlerSlot {
    owner: Mutex<Option<String>>,
}

impl ActiveHandlerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot. Succeeds if it is free or already held by `owner`.
    pub fn try_acquire(&self, owner: &str) -> bool {
        let mut slot = lock(&self.owner);
        match slot.as_deref() {
            Some(current) if current == owner => true,
            Some(current) => {
                tracing::debug!(owner, current, "Active handler slot already taken");
                false
            }
            None => {
                *slot = Some(owner.to_string());
                tracing::debug!(owner, "Became active handler");
                true
            }
        }
    }

    /// Release the slot. Only the current owner can release it.
    pub fn release(&self, owner: &str) -> bool {
        let mut slot = lock(&self.owner);
        if slot.as_deref() == Some(owner) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Forcibly clear the slot, returning the evicted owner.
    pub fn clear_stale(&self) -> Option<String> {
        let evicted = lock(&self.owner).take();
        if let Some(ref owner) = evicted {
            tracing::warn!(owner = %owner, "Cleared stale active handler");
        }
        evicted
    }

    pub fn current(&self) -> Option<String> {
        lock(&self.owner).clone()
    }
}
