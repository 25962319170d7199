// Live counters for the maintainer: token fetches, retries, dispatches and completions.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub token_fetches: u64,
    pub token_failures: u64,
    pub retries: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub active_requests: u32,
}

pub struct MaintainerStats {
    token_fetches: AtomicU64,
    token_failures: AtomicU64,
    retries: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    active_requests: AtomicU32,
}

impl MaintainerStats {
    pub fn new() -> Self {
        Self {
            token_fetches: AtomicU64::new(0),
            token_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            active_requests: AtomicU32::new(0),
        }
    }

    pub fn record_token_fetch(&self) {
        self.token_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_token_failure(&self) {
        self.token_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// A request went out to the transport.
    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A dispatched request left the in-progress set, either finished or
    /// headed for a retry.
    pub fn record_returned(&self, finished: bool) {
        if finished {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        // Saturate: requests cancelled before dispatch also report back.
        let _ = self
            .active_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            token_fetches: self.token_fetches.load(Ordering::Relaxed),
            token_failures: self.token_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
        }
    }
}

impl Default for MaintainerStats {
    fn default() -> Self {
        Self::new()
    }
}
