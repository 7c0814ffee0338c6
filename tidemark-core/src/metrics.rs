//! Structured counters sampled by external telemetry.
//!
//! The core counts what happens but transmits nothing; an embedding
//! application samples [`report`](StoreMetrics::report) snapshots on its own
//! schedule. Counters are plain atomics so recording never contends.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters owned by the event store.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    events_appended: AtomicU64,
    version_conflicts: AtomicU64,
    malformed_events: AtomicU64,
    subscriber_lag_drops: AtomicU64,
}

/// Point-in-time sample of [`StoreMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreMetricsReport {
    pub events_appended: u64,
    pub version_conflicts: u64,
    pub malformed_events: u64,
    pub subscriber_lag_drops: u64,
}

impl StoreMetrics {
    pub(crate) fn record_appended(&self, count: u64) {
        self.events_appended.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.version_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lag_drops(&self, count: u64) {
        self.subscriber_lag_drops.fetch_add(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn report(&self) -> StoreMetricsReport {
        StoreMetricsReport {
            events_appended: self.events_appended.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
            subscriber_lag_drops: self.subscriber_lag_drops.load(Ordering::Relaxed),
        }
    }
}

/// Counters owned by the snapshot manager and cache.
#[derive(Debug, Default)]
pub struct SnapshotMetrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    stored: AtomicU64,
    declined: AtomicU64,
    integrity_failures: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Point-in-time sample of [`SnapshotMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotMetricsReport {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub stored: u64,
    pub declined: u64,
    pub integrity_failures: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl SnapshotMetrics {
    pub(crate) fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_declined(&self) {
        self.declined.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn report(&self) -> SnapshotMetricsReport {
        SnapshotMetricsReport {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            declined: self.declined.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Counters owned by projection builders and subscriptions.
#[derive(Debug, Default)]
pub struct ProjectionMetrics {
    events_processed: AtomicU64,
    handler_errors: AtomicU64,
    rebuilds: AtomicU64,
}

/// Point-in-time sample of [`ProjectionMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProjectionMetricsReport {
    pub events_processed: u64,
    pub handler_errors: u64,
    pub rebuilds: u64,
}

impl ProjectionMetrics {
    pub(crate) fn record_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn report(&self) -> ProjectionMetricsReport {
        ProjectionMetricsReport {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
        }
    }
}
