//! Snapshot support for optimised state reconstruction.
//!
//! A snapshot is a fold of one stream's events up to a version. It is
//! derived data: deletable and regenerable at any time, never required for
//! correctness, because the event log stays the source of truth. This
//! module provides:
//!
//! - [`Snapshot`] / [`CompressedSnapshot`] - uncompressed working form and
//!   the compressed durable form
//! - [`DurableSnapshotStore`] - persistence boundary trait
//! - [`strategy`] - pluggable "should a snapshot be taken now" policies
//! - [`compress`] - reversible compression applied before durable storage
//! - [`cache`] - bounded LRU cache of ready-to-use snapshots
//! - [`manager`] - composition of all of the above
//! - [`inmemory`] - in-memory reference implementation of the store trait

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::StreamId;

pub mod cache;
pub mod compress;
pub mod inmemory;
pub mod manager;
pub mod strategy;

/// Point-in-time state of one stream, folded from events `1..=version`.
///
/// Multiple snapshots per stream may coexist; the latest one with
/// `version <= requested` is authoritative for reconstruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stream_id: StreamId,
    /// Stream version this state includes, never 0.
    pub version: u64,
    /// Ready-to-use state; caches hold this form, never compressed bytes.
    pub state: serde_json::Value,
    pub taken_at: DateTime<Utc>,
    /// Tag of the strategy that approved this snapshot.
    pub strategy: String,
}

impl Snapshot {
    /// Approximate in-memory footprint, used for cache byte budgets.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.state).map_or(0, |bytes| bytes.len())
    }
}

/// Durable form of a snapshot: the state serialized and compressed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedSnapshot {
    pub stream_id: StreamId,
    pub version: u64,
    pub state: Vec<u8>,
    pub taken_at: DateTime<Utc>,
    pub strategy: String,
}

/// Error from snapshot persistence or decoding.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The durable store rejected a save or load.
    #[error("snapshot store failed: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// Compressed bytes could not be decompressed or decoded. Recovered by
    /// replaying from version 0.
    #[error("snapshot for stream {stream_id} at version {version} is unreadable: {source}")]
    Integrity {
        stream_id: StreamId,
        version: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl SnapshotError {
    pub(crate) fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Store(Box::new(err))
    }
}

/// Persistence boundary for snapshots.
///
/// Implementations store compressed snapshots keyed by stream and version.
/// Each call is assumed atomic; the manager treats load failures as cache
/// misses and falls back to full replay.
pub trait DurableSnapshotStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persist a snapshot, keeping earlier versions for the same stream.
    fn save(
        &self,
        snapshot: CompressedSnapshot,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Load the latest snapshot with `version <= max_version` (or the
    /// latest overall when `max_version` is `None`). `Ok(None)` when the
    /// stream has no usable snapshot.
    fn load<'a>(
        &'a self,
        stream_id: &'a StreamId,
        max_version: Option<u64>,
    ) -> impl Future<Output = Result<Option<CompressedSnapshot>, Self::Error>> + Send + 'a;

    /// Delete every snapshot for a stream. Snapshots are derived data, so
    /// this is always safe.
    fn delete_stream<'a>(
        &'a self,
        stream_id: &'a StreamId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}
