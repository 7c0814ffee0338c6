//! Bounded LRU cache of ready-to-use snapshots.
//!
//! Entries are uncompressed [`Snapshot`]s keyed by `(stream, version)`.
//! Eviction triggers when the entry count or the aggregate byte budget is
//! exceeded, in strict least-recently-used order. Expiry is lazy: entries
//! older than the configured TTL are treated as absent on `get` and swept
//! on `put`.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use super::Snapshot;
use crate::{event::StreamId, metrics::SnapshotMetrics};

/// Cache bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached snapshots.
    pub max_entries: usize,
    /// Aggregate byte budget for cached state.
    pub max_bytes: usize,
    /// Age after which an entry is treated as absent. `None` disables
    /// expiry.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_bytes: 64 * 1024 * 1024,
            ttl: None,
        }
    }
}

struct CacheEntry {
    snapshot: Snapshot,
    inserted_at: Instant,
    last_access: Instant,
    access_seq: u64,
    access_count: u64,
    size_bytes: usize,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<(StreamId, u64), CacheEntry>,
    versions_by_stream: HashMap<StreamId, BTreeSet<u64>>,
    /// Access-order index: sequence -> key. The smallest sequence is the
    /// least recently used entry.
    lru: BTreeMap<u64, (StreamId, u64)>,
    next_seq: u64,
    total_bytes: usize,
}

impl CacheInner {
    fn touch(&mut self, key: &(StreamId, u64)) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        self.lru.remove(&entry.access_seq);
        entry.access_seq = self.next_seq;
        entry.last_access = Instant::now();
        entry.access_count += 1;
        self.lru.insert(self.next_seq, key.clone());
        self.next_seq += 1;
    }

    fn remove(&mut self, key: &(StreamId, u64)) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.access_seq);
        self.total_bytes -= entry.size_bytes;
        if let Some(versions) = self.versions_by_stream.get_mut(&key.0) {
            versions.remove(&key.1);
            if versions.is_empty() {
                self.versions_by_stream.remove(&key.0);
            }
        }
        Some(entry)
    }

    fn is_expired(&self, key: &(StreamId, u64), ttl: Option<Duration>) -> bool {
        match (ttl, self.entries.get(key)) {
            (Some(ttl), Some(entry)) => entry.inserted_at.elapsed() > ttl,
            _ => false,
        }
    }
}

/// Shared snapshot cache.
pub struct SnapshotCache {
    inner: Mutex<CacheInner>,
    config: CacheConfig,
    metrics: Arc<SnapshotMetrics>,
}

impl SnapshotCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self::with_metrics(config, Arc::new(SnapshotMetrics::default()))
    }

    #[must_use]
    pub fn with_metrics(config: CacheConfig, metrics: Arc<SnapshotMetrics>) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            config,
            metrics,
        }
    }

    /// Fetch the latest cached snapshot for `stream_id` with
    /// `version <= max_version` (unbounded when `None`).
    ///
    /// A hit refreshes the entry's recency; expired entries are removed and
    /// reported as absent.
    pub fn get(&self, stream_id: &StreamId, max_version: Option<u64>) -> Option<Snapshot> {
        let mut inner = self.inner.lock().expect("snapshot cache lock poisoned");
        let bound = max_version.unwrap_or(u64::MAX);

        loop {
            let candidate = inner
                .versions_by_stream
                .get(stream_id)
                .and_then(|versions| versions.range(..=bound).next_back().copied());
            let Some(version) = candidate else {
                self.metrics.record_miss();
                return None;
            };

            let key = (stream_id.clone(), version);
            if inner.is_expired(&key, self.config.ttl) {
                inner.remove(&key);
                self.metrics.record_expirations(1);
                continue;
            }

            inner.touch(&key);
            let snapshot = inner.entries[&key].snapshot.clone();
            self.metrics.record_hit();
            return Some(snapshot);
        }
    }

    /// Insert a snapshot, evicting least-recently-used entries as needed to
    /// respect the entry and byte budgets.
    pub fn put(&self, snapshot: Snapshot) {
        let size_bytes = snapshot.size_bytes();
        let key = (snapshot.stream_id.clone(), snapshot.version);
        let mut inner = self.inner.lock().expect("snapshot cache lock poisoned");

        // Replace an existing entry for the same (stream, version).
        inner.remove(&key);

        let now = Instant::now();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                snapshot,
                inserted_at: now,
                last_access: now,
                access_seq: seq,
                access_count: 0,
                size_bytes,
            },
        );
        inner.lru.insert(seq, key.clone());
        inner
            .versions_by_stream
            .entry(key.0.clone())
            .or_default()
            .insert(key.1);
        inner.total_bytes += size_bytes;

        self.sweep_expired(&mut inner);
        self.evict_over_budget(&mut inner);
    }

    /// Drop every cached snapshot for a stream.
    pub fn remove_stream(&self, stream_id: &StreamId) {
        let mut inner = self.inner.lock().expect("snapshot cache lock poisoned");
        let versions: Vec<u64> = inner
            .versions_by_stream
            .get(stream_id)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default();
        for version in versions {
            inner.remove(&(stream_id.clone(), version));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("snapshot cache lock poisoned")
            .entries
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate bytes currently held.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.inner
            .lock()
            .expect("snapshot cache lock poisoned")
            .total_bytes
    }

    fn sweep_expired(&self, inner: &mut CacheInner) {
        let Some(ttl) = self.config.ttl else {
            return;
        };
        let expired: Vec<(StreamId, u64)> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        let count = expired.len() as u64;
        for key in expired {
            inner.remove(&key);
        }
        if count > 0 {
            self.metrics.record_expirations(count);
            tracing::trace!(expired = count, "swept expired snapshots");
        }
    }

    fn evict_over_budget(&self, inner: &mut CacheInner) {
        let mut evicted = 0u64;
        while !inner.entries.is_empty()
            && (inner.entries.len() > self.config.max_entries
                || inner.total_bytes > self.config.max_bytes)
        {
            let Some((_, key)) = inner.lru.iter().next().map(|(s, k)| (*s, k.clone())) else {
                break;
            };
            inner.remove(&key);
            evicted += 1;
        }
        if evicted > 0 {
            self.metrics.record_evictions(evicted);
            tracing::debug!(evicted, "evicted least-recently-used snapshots");
        }
    }
}
