//! Counters the processor updates as items move through it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Processor counters, updated with relaxed atomics from any thread.
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    exported: AtomicU64,
    batches_exported: AtomicU64,
    export_failures: AtomicU64,
    force_flushes: AtomicU64,
}

impl ProcessorMetrics {
    /// Items accepted into the ring.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Items discarded because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Items handed to a successful export.
    pub fn exported(&self) -> u64 {
        self.exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn export_failures(&self) -> u64 {
        self.export_failures.load(Ordering::Relaxed)
    }

    /// Forced exports completed by the worker.
    pub fn force_flushes(&self) -> u64 {
        self.force_flushes.load(Ordering::Relaxed)
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued(),
            dropped: self.dropped(),
            exported: self.exported(),
            batches_exported: self.batches_exported(),
            export_failures: self.export_failures(),
            force_flushes: self.force_flushes(),
        }
    }

    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the drop total including these.
    pub(crate) fn record_dropped(&self, count: u64) -> u64 {
        self.dropped.fetch_add(count, Ordering::Relaxed) + count
    }

    pub(crate) fn record_success(&self, count: u64) {
        self.exported.fetch_add(count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.export_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_force_flush(&self) {
        self.force_flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`ProcessorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub exported: u64,
    pub batches_exported: u64,
    pub export_failures: u64,
    pub force_flushes: u64,
}
