//! In-process metrics and health reporting.
//!
//! Trellis keeps a small registry of atomic counters and gauges
//! covering the snapshot, garbage-collection and restore paths. The
//! registry is passed explicitly into the components that update it;
//! nothing reads ambient global state. Export is out of scope; the
//! CLI surfaces a JSON snapshot of the registry instead.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-write-wins gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    /// Set the gauge.
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-kind snapshot metrics.
#[derive(Debug, Default)]
pub struct SnapshotKindMetrics {
    /// Revision of the latest snapshot of this kind.
    pub latest_revision: Gauge,

    /// Unix timestamp of the latest snapshot of this kind.
    pub latest_timestamp: Gauge,

    /// 1 while a snapshot of this kind is required, 0 otherwise.
    pub required: Gauge,

    /// Successful snapshots taken.
    pub taken: Counter,

    /// Failed snapshot attempts.
    pub failed: Counter,
}

/// Registry of all Trellis metrics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Full snapshot metrics.
    pub full: SnapshotKindMetrics,

    /// Delta snapshot metrics.
    pub delta: SnapshotKindMetrics,

    /// Delta snapshots in the current chain.
    pub chain_deltas: Gauge,

    /// Revisions covered by the current chain's deltas.
    pub chain_delta_revisions: Gauge,

    /// Objects deleted by the garbage collector.
    pub gc_deleted: Counter,

    /// Garbage collection runs that reported an error.
    pub gc_errors: Counter,

    /// Data directory validations performed.
    pub validations: Counter,

    /// Restorations completed successfully.
    pub restorations: Counter,

    /// Configured cluster size observed at initialization.
    pub cluster_size: Gauge,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful snapshot of the given kind.
    pub fn record_snapshot(&self, kind: crate::snapshot::types::SnapshotKind, revision: u64, unix_ts: i64) {
        let metrics = match kind {
            crate::snapshot::types::SnapshotKind::Full => &self.full,
            crate::snapshot::types::SnapshotKind::Delta => &self.delta,
        };
        metrics.latest_revision.set(revision as i64);
        metrics.latest_timestamp.set(unix_ts);
        metrics.required.set(0);
        metrics.taken.inc();
    }

    /// Readable snapshot of the registry.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            full_latest_revision: self.full.latest_revision.get(),
            full_taken: self.full.taken.get(),
            full_failed: self.full.failed.get(),
            delta_latest_revision: self.delta.latest_revision.get(),
            delta_taken: self.delta.taken.get(),
            delta_failed: self.delta.failed.get(),
            chain_deltas: self.chain_deltas.get(),
            gc_deleted: self.gc_deleted.get(),
            gc_errors: self.gc_errors.get(),
            validations: self.validations.get(),
            restorations: self.restorations.get(),
        }
    }
}

/// Point-in-time view of the registry, serializable for the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub full_latest_revision: i64,
    pub full_taken: u64,
    pub full_failed: u64,
    pub delta_latest_revision: i64,
    pub delta_taken: u64,
    pub delta_failed: u64,
    pub chain_deltas: i64,
    pub gc_deleted: u64,
    pub gc_errors: u64,
    pub validations: u64,
    pub restorations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::types::SnapshotKind;

    #[test]
    fn test_counter_and_gauge() {
        let c = Counter::default();
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);

        let g = Gauge::default();
        g.set(-3);
        assert_eq!(g.get(), -3);
    }

    #[test]
    fn test_record_snapshot() {
        let registry = MetricsRegistry::new();
        registry.full.required.set(1);
        registry.record_snapshot(SnapshotKind::Full, 42, 1_700_000_000);

        assert_eq!(registry.full.latest_revision.get(), 42);
        assert_eq!(registry.full.required.get(), 0);
        assert_eq!(registry.full.taken.get(), 1);
        assert_eq!(registry.snapshot().full_taken, 1);
    }
}
