//! Snapshot orchestration: decide, compress, persist, cache.
//!
//! [`SnapshotManager`] is the only component the rest of the core talks to
//! about snapshots. It asks its [`SnapshotStrategy`] whether one is due,
//! compresses approved state for the [`DurableSnapshotStore`], and keeps
//! the uncompressed form in the [`SnapshotCache`] so reconstruction never
//! pays the decompression cost twice. Loads degrade gracefully: any
//! integrity problem is counted, logged, and reported as "no snapshot";
//! replay from version 0 is always authoritative.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::Utc;

use super::{
    cache::{CacheConfig, SnapshotCache},
    compress::{Compressor, ZstdCompressor},
    strategy::{EveryNEvents, SnapshotStrategy, StrategyContext},
    CompressedSnapshot, DurableSnapshotStore, Snapshot, SnapshotError,
};
use crate::{
    event::{Event, StreamId},
    metrics::SnapshotMetrics,
};

/// Result of offering state to the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The strategy approved and the snapshot was persisted and cached.
    Stored,
    /// The strategy declined; nothing was written.
    Declined,
}

/// Composes a strategy, a compressor, a cache, and a durable store.
pub struct SnapshotManager<S> {
    strategy: Box<dyn SnapshotStrategy>,
    compressor: Box<dyn Compressor>,
    cache: SnapshotCache,
    store: S,
    /// Last stored snapshot version per stream, seeded lazily from the
    /// durable store so strategy decisions survive restarts.
    last_versions: Mutex<HashMap<StreamId, u64>>,
    metrics: Arc<SnapshotMetrics>,
}

impl<S> SnapshotManager<S>
where
    S: DurableSnapshotStore,
{
    /// Manager with defaults: snapshot every 100 events, zstd compression,
    /// default cache bounds.
    #[must_use]
    pub fn new(store: S) -> Self {
        let metrics = Arc::new(SnapshotMetrics::default());
        Self {
            strategy: Box::new(EveryNEvents::new(100)),
            compressor: Box::new(ZstdCompressor::new()),
            cache: SnapshotCache::with_metrics(CacheConfig::default(), Arc::clone(&metrics)),
            store,
            last_versions: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: impl SnapshotStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    #[must_use]
    pub fn with_compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.compressor = Box::new(compressor);
        self
    }

    #[must_use]
    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = SnapshotCache::with_metrics(config, Arc::clone(&self.metrics));
        self
    }

    /// Offer folded state for snapshotting.
    ///
    /// Asks the strategy; on approval the state is compressed, persisted,
    /// and the uncompressed form inserted into the cache. The cache never
    /// holds compressed bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Store`] when compression or durable
    /// persistence fails; nothing is cached in that case.
    #[tracing::instrument(skip_all, fields(stream = %stream_id, version = current_version))]
    pub async fn create_snapshot_if_needed(
        &self,
        stream_id: &StreamId,
        current_version: u64,
        state: &serde_json::Value,
        recent_events: &[Arc<Event>],
    ) -> Result<SnapshotOutcome, SnapshotError> {
        if current_version == 0 {
            return Ok(SnapshotOutcome::Declined);
        }

        let last_snapshot_version = self.last_snapshot_version(stream_id).await;
        let ctx = StrategyContext {
            stream_id,
            current_version,
            last_snapshot_version,
            recent_events,
        };
        if !self.strategy.should_snapshot(&ctx) {
            self.metrics.record_declined();
            return Ok(SnapshotOutcome::Declined);
        }
        // Re-snapshotting the same version would only churn storage.
        if last_snapshot_version == Some(current_version) {
            self.metrics.record_declined();
            return Ok(SnapshotOutcome::Declined);
        }

        let snapshot = Snapshot {
            stream_id: stream_id.clone(),
            version: current_version,
            state: state.clone(),
            taken_at: Utc::now(),
            strategy: self.strategy.tag().to_string(),
        };

        let raw = serde_json::to_vec(&snapshot.state).map_err(SnapshotError::store)?;
        let compressed = self.compressor.compress(&raw).map_err(SnapshotError::store)?;
        self.store
            .save(CompressedSnapshot {
                stream_id: snapshot.stream_id.clone(),
                version: snapshot.version,
                state: compressed,
                taken_at: snapshot.taken_at,
                strategy: snapshot.strategy.clone(),
            })
            .await
            .map_err(SnapshotError::store)?;

        self.cache.put(snapshot);
        self.strategy.record_snapshot(stream_id, current_version);
        self.remember_version(stream_id, current_version);
        self.metrics.record_stored();
        tracing::debug!(
            stream = %stream_id,
            version = current_version,
            strategy = self.strategy.tag(),
            "snapshot stored"
        );
        Ok(SnapshotOutcome::Stored)
    }

    /// Load the latest usable snapshot with `version <= max_version`
    /// (unbounded when `None`).
    ///
    /// Checks the cache first, then the durable store. Every failure mode
    /// (durable load error, decompression error, decode error) degrades to
    /// `None` after incrementing the integrity counter: callers replay from
    /// version 0 instead.
    #[tracing::instrument(skip_all, fields(stream = %stream_id))]
    pub async fn load_latest(
        &self,
        stream_id: &StreamId,
        max_version: Option<u64>,
    ) -> Option<Snapshot> {
        self.strategy.record_access(stream_id);

        if let Some(hit) = self.cache.get(stream_id, max_version) {
            tracing::trace!(version = hit.version, "snapshot cache hit");
            return Some(hit);
        }

        let compressed = match self.store.load(stream_id, max_version).await {
            Ok(Some(compressed)) => compressed,
            Ok(None) => return None,
            Err(error) => {
                self.metrics.record_integrity_failure();
                tracing::warn!(
                    stream = %stream_id,
                    error = %error,
                    "snapshot load failed, falling back to full replay"
                );
                return None;
            }
        };

        match self.decode(compressed) {
            Ok(snapshot) => {
                self.remember_version(stream_id, snapshot.version);
                self.cache.put(snapshot.clone());
                Some(snapshot)
            }
            Err(error) => {
                self.metrics.record_integrity_failure();
                tracing::warn!(
                    stream = %stream_id,
                    error = %error,
                    "snapshot unreadable, falling back to full replay"
                );
                None
            }
        }
    }

    /// Drop every snapshot for a stream, cached and durable.
    ///
    /// Always safe: snapshots are derived data and will be regenerated.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Store`] when the durable delete fails.
    pub async fn invalidate(&self, stream_id: &StreamId) -> Result<(), SnapshotError> {
        self.cache.remove_stream(stream_id);
        self.store
            .delete_stream(stream_id)
            .await
            .map_err(SnapshotError::store)?;
        self.last_versions
            .lock()
            .expect("snapshot manager lock poisoned")
            .remove(stream_id);
        tracing::debug!(stream = %stream_id, "snapshots invalidated");
        Ok(())
    }

    /// Counters for external telemetry sampling.
    #[must_use]
    pub fn metrics(&self) -> &SnapshotMetrics {
        &self.metrics
    }

    pub(crate) fn record_integrity_failure(&self) {
        self.metrics.record_integrity_failure();
    }

    fn decode(&self, compressed: CompressedSnapshot) -> Result<Snapshot, SnapshotError> {
        let integrity = |source: Box<dyn std::error::Error + Send + Sync + 'static>| {
            SnapshotError::Integrity {
                stream_id: compressed.stream_id.clone(),
                version: compressed.version,
                source,
            }
        };
        let raw = self
            .compressor
            .decompress(&compressed.state)
            .map_err(|e| integrity(Box::new(e)))?;
        let state = serde_json::from_slice(&raw).map_err(|e| integrity(Box::new(e)))?;
        Ok(Snapshot {
            stream_id: compressed.stream_id.clone(),
            version: compressed.version,
            state,
            taken_at: compressed.taken_at,
            strategy: compressed.strategy,
        })
    }

    async fn last_snapshot_version(&self, stream_id: &StreamId) -> Option<u64> {
        if let Some(version) = self
            .last_versions
            .lock()
            .expect("snapshot manager lock poisoned")
            .get(stream_id)
            .copied()
        {
            return Some(version);
        }

        // First decision for this stream since startup: consult the durable
        // store once so the strategy does not re-snapshot immediately.
        match self.store.load(stream_id, None).await {
            Ok(Some(compressed)) => {
                self.remember_version(stream_id, compressed.version);
                Some(compressed.version)
            }
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(
                    stream = %stream_id,
                    error = %error,
                    "snapshot version lookup failed; treating stream as unsnapshotted"
                );
                None
            }
        }
    }

    fn remember_version(&self, stream_id: &StreamId, version: u64) {
        let mut versions = self
            .last_versions
            .lock()
            .expect("snapshot manager lock poisoned");
        let entry = versions.entry(stream_id.clone()).or_insert(version);
        if *entry < version {
            *entry = version;
        }
    }
}
