//! Per-caller sliding-window admission control.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::lock;
use crate::config::RateLimitConfig;

/// Window bookkeeping for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub window_start: Instant,
    pub count: u32,
}

/// Tracks admissions per calling app. Resets a caller's window once it has
/// run for the configured length; rejected checks are not counted.
#[derive(Debug)]
pub struct RateLimiter {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_requests: config.max_requests,
            window: config.window,
        }
    }

    /// Try to admit one request from `caller`.
    pub fn check(&self, caller: &str) -> bool {
        self.check_at(caller, Instant::now())
    }

    pub fn check_at(&self, caller: &str, now: Instant) -> bool {
        let mut entries = lock(&self.entries);
        let entry = entries
            .entry(caller.to_string())
            .or_insert(RateLimitEntry {
                window_start: now,
                count: 0,
            });

        if now.saturating_duration_since(entry.window_start) >= self.window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count < self.max_requests {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    pub fn entry(&self, caller: &str) -> Option<RateLimitEntry> {
        lock(&self.entries).get(caller).copied()
    }

    pub fn tracked_callers(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}
