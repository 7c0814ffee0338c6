//! In-memory snapshot store implementation.
//!
//! Reference implementation of [`DurableSnapshotStore`] suitable for tests
//! and development. Snapshots are versioned per stream; loading picks the
//! latest version at or below the requested bound.

use std::{
    collections::{BTreeMap, HashMap},
    convert::Infallible,
    future::Future,
    sync::{Arc, RwLock},
};

use super::{CompressedSnapshot, DurableSnapshotStore};
use crate::event::StreamId;

type VersionedSnapshots = BTreeMap<u64, CompressedSnapshot>;
type SharedSnapshots = Arc<RwLock<HashMap<StreamId, VersionedSnapshots>>>;

/// In-memory versioned snapshot store.
#[derive(Clone, Debug, Default)]
pub struct Store {
    snapshots: SharedSnapshots,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots held across all streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableSnapshotStore for Store {
    type Error = Infallible;

    fn save(
        &self,
        snapshot: CompressedSnapshot,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let result = {
            let mut snapshots = self
                .snapshots
                .write()
                .expect("snapshot store lock poisoned");
            snapshots
                .entry(snapshot.stream_id.clone())
                .or_default()
                .insert(snapshot.version, snapshot);
            Ok(())
        };
        std::future::ready(result)
    }

    fn load<'a>(
        &'a self,
        stream_id: &'a StreamId,
        max_version: Option<u64>,
    ) -> impl Future<Output = Result<Option<CompressedSnapshot>, Self::Error>> + Send + 'a {
        let result = {
            let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
            let found = snapshots.get(stream_id).and_then(|versions| {
                let bound = max_version.unwrap_or(u64::MAX);
                versions.range(..=bound).next_back().map(|(_, s)| s.clone())
            });
            Ok(found)
        };
        std::future::ready(result)
    }

    fn delete_stream<'a>(
        &'a self,
        stream_id: &'a StreamId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        let result = {
            let mut snapshots = self
                .snapshots
                .write()
                .expect("snapshot store lock poisoned");
            snapshots.remove(stream_id);
            Ok(())
        };
        std::future::ready(result)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn snapshot(stream: &str, version: u64) -> CompressedSnapshot {
        CompressedSnapshot {
            stream_id: StreamId::from(stream),
            version,
            state: vec![version as u8],
            taken_at: Utc::now(),
            strategy: "every-n-events".to_string(),
        }
    }

    #[tokio::test]
    async fn load_returns_none_for_missing_stream() {
        let store = Store::new();
        let found = store.load(&StreamId::from("u1"), None).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn load_picks_latest_at_or_below_bound() {
        let store = Store::new();
        for version in [2, 5, 9] {
            store.save(snapshot("u1", version)).await.unwrap();
        }

        let latest = store.load(&StreamId::from("u1"), None).await.unwrap();
        assert_eq!(latest.unwrap().version, 9);

        let bounded = store.load(&StreamId::from("u1"), Some(6)).await.unwrap();
        assert_eq!(bounded.unwrap().version, 5);

        let below_all = store.load(&StreamId::from("u1"), Some(1)).await.unwrap();
        assert!(below_all.is_none());
    }

    #[tokio::test]
    async fn versions_coexist_until_deleted() {
        let store = Store::new();
        store.save(snapshot("u1", 2)).await.unwrap();
        store.save(snapshot("u1", 5)).await.unwrap();
        store.save(snapshot("u2", 1)).await.unwrap();
        assert_eq!(store.len(), 3);

        store.delete_stream(&StreamId::from("u1")).await.unwrap();
        assert_eq!(store.len(), 1);
        let remaining = store.load(&StreamId::from("u2"), None).await.unwrap();
        assert_eq!(remaining.unwrap().version, 1);
    }
}
