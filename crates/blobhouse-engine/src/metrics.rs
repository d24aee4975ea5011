//! Engine counters.
//!
//! Lock-free `AtomicU64` counters updated on the hot path, read as a serializable snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of one engine instance.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    stores: AtomicU64,
    retrieves: AtomicU64,
    deletes: AtomicU64,
    dedup_hits: AtomicU64,
    dedup_misses: AtomicU64,
    bytes_in: AtomicU64,
    bytes_written: AtomicU64,
    bytes_out: AtomicU64,
    gc_cycles: AtomicU64,
    gc_reclaimed: AtomicU64,
    gc_retained: AtomicU64,
    audit_failures: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Successful stores
    pub stores: u64,
    /// Successful retrieves
    pub retrieves: u64,
    /// Successful deletes
    pub deletes: u64,
    /// Stores that reused an existing physical object
    pub dedup_hits: u64,
    /// Stores that wrote new bytes
    pub dedup_misses: u64,
    /// Original bytes accepted by stores
    pub bytes_in: u64,
    /// Encoded bytes written to storage providers
    pub bytes_written: u64,
    /// Decoded bytes returned by retrieves
    pub bytes_out: u64,
    /// Completed GC cycles
    pub gc_cycles: u64,
    /// Physical objects reclaimed by GC
    pub gc_reclaimed: u64,
    /// Unreferenced objects GC could not delete (append-only backends)
    pub gc_retained: u64,
    /// Audit events a sink failed to record
    pub audit_failures: u64,
    /// Operations that returned an error
    pub errors: u64,
}

impl MetricsSnapshot {
    /// Fraction of stores served by dedup, 0.0 without stores.
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.dedup_hits + self.dedup_misses;
        if total == 0 {
            0.0
        } else {
            self.dedup_hits as f64 / total as f64
        }
    }
}

impl EngineMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_store(&self, bytes_in: u64, dedup_hit: bool) {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        if dedup_hit {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dedup_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_retrieve(&self, bytes_out: u64) {
        self.retrieves.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_gc(&self, reclaimed: u64, retained: u64) {
        self.gc_cycles.fetch_add(1, Ordering::Relaxed);
        self.gc_reclaimed.fetch_add(reclaimed, Ordering::Relaxed);
        self.gc_retained.fetch_add(retained, Ordering::Relaxed);
    }

    pub(crate) fn record_audit_failure(&self) {
        self.audit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stores: self.stores.load(Ordering::Relaxed),
            retrieves: self.retrieves.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            dedup_misses: self.dedup_misses.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            gc_cycles: self.gc_cycles.load(Ordering::Relaxed),
            gc_reclaimed: self.gc_reclaimed.load(Ordering::Relaxed),
            gc_retained: self.gc_retained.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
