use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the dispatch path and both handlers.
#[derive(Debug, Default)]
pub struct Diagnostics {
    handled: AtomicU64,
    dropped: AtomicU64,
    lookup_misses: AtomicU64,
    rejected_keys: AtomicU64,
    store_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub handled: u64,
    pub dropped: u64,
    pub lookup_misses: u64,
    pub rejected_keys: u64,
    pub store_failures: u64,
}

impl Diagnostics {
    pub fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup_miss(&self) {
        self.lookup_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_keys(&self, count: usize) {
        self.rejected_keys.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            handled: self.handled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            lookup_misses: self.lookup_misses.load(Ordering::Relaxed),
            rejected_keys: self.rejected_keys.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}
