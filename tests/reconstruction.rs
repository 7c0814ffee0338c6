//! Integration tests for snapshot-accelerated reconstruction.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tidemark::{
    snapshot::{inmemory, CacheConfig, EveryNEvents, SnapshotCache, SnapshotManager},
    store::{EventStore, Expected, NonEmpty},
    Aggregate, Event, NewEvent, Reconstructed, Reconstructor, StreamId,
};

// ============================================================================
// Test Domain
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Tally {
    total: i64,
    entries: u64,
}

impl Aggregate for Tally {
    fn apply(&mut self, event: &Event) {
        if event.kind == "amount-recorded" {
            self.total += event.data["amount"].as_i64().unwrap_or(0);
            self.entries += 1;
        }
    }
}

fn amount(n: i64) -> NonEmpty<NewEvent> {
    NonEmpty::singleton(NewEvent::new("amount-recorded", json!({ "amount": n })))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn snapshot_then_suffix_matches_full_replay() {
    let store = EventStore::new();
    let snapshots = SnapshotManager::new(inmemory::Store::new()).with_strategy(EveryNEvents::new(1));
    let reconstructor = Reconstructor::new(&store, &snapshots);

    // v1, v2: reconstruct stores a snapshot at version 2.
    store.append("t1", amount(10), Expected::Any).await.unwrap();
    store.append("t1", amount(20), Expected::Any).await.unwrap();
    let at_two: Reconstructed<Tally> = reconstructor.reconstruct("t1").await;
    assert_eq!(at_two.version, 2);
    assert!(snapshots.metrics().report().stored >= 1);

    // v3 appended after the snapshot: reconstruction folds snapshot + [v3].
    store.append("t1", amount(30), Expected::Any).await.unwrap();
    let accelerated: Reconstructed<Tally> = reconstructor.reconstruct("t1").await;

    // Full replay with no snapshots available is the reference answer.
    let bare = SnapshotManager::new(inmemory::Store::new());
    let full: Reconstructed<Tally> = Reconstructor::new(&store, &bare).reconstruct("t1").await;

    assert_eq!(accelerated.state, full.state);
    assert_eq!(accelerated.version, full.version);
    assert_eq!(accelerated.state, Tally { total: 60, entries: 3 });
    assert_eq!(accelerated.version, 3);
}

#[tokio::test]
async fn reconstruction_is_equivalent_for_every_snapshot_placement() {
    let amounts = [3, 1, 4, 1, 5, 9, 2, 6];

    for placement in 1..=amounts.len() {
        let store = EventStore::new();
        let snapshots =
            SnapshotManager::new(inmemory::Store::new()).with_strategy(EveryNEvents::new(1));
        let reconstructor = Reconstructor::new(&store, &snapshots);

        // Plant a snapshot at exactly `placement`: reconstructing with an
        // eager strategy stores one for whatever has been appended so far.
        for n in &amounts[..placement] {
            store.append("t1", amount(*n), Expected::Any).await.unwrap();
        }
        let prefix: Reconstructed<Tally> = reconstructor.reconstruct("t1").await;
        assert_eq!(prefix.version, placement as u64);

        for n in &amounts[placement..] {
            store.append("t1", amount(*n), Expected::Any).await.unwrap();
        }
        let accelerated: Reconstructed<Tally> = reconstructor.reconstruct("t1").await;

        let bare = SnapshotManager::new(inmemory::Store::new());
        let full: Reconstructed<Tally> = Reconstructor::new(&store, &bare).reconstruct("t1").await;

        assert_eq!(accelerated.state, full.state, "placement {placement}");
        assert_eq!(accelerated.version, full.version, "placement {placement}");
    }
}

#[tokio::test]
async fn snapshots_survive_compression_round_trip() {
    let store = EventStore::new();
    let durable = inmemory::Store::new();
    let snapshots = SnapshotManager::new(durable.clone()).with_strategy(EveryNEvents::new(1));
    let reconstructor = Reconstructor::new(&store, &snapshots);

    for n in 0..50 {
        store.append("t1", amount(n), Expected::Any).await.unwrap();
    }
    let first: Reconstructed<Tally> = reconstructor.reconstruct("t1").await;

    // A fresh manager over the same durable backing has a cold cache, so
    // this load must decompress and decode the persisted bytes.
    let fresh = SnapshotManager::new(durable);
    let loaded = fresh
        .load_latest(&StreamId::from("t1"), None)
        .await
        .expect("snapshot was stored");
    let state: Tally = serde_json::from_value(loaded.state).unwrap();
    assert_eq!(state, first.state);
    assert_eq!(loaded.version, first.version);
}

#[test]
fn cache_bounded_at_n_drops_only_the_least_recently_used() {
    let cache = SnapshotCache::new(CacheConfig {
        max_entries: 4,
        ..CacheConfig::default()
    });
    let snapshot = |stream: &str| tidemark::snapshot::Snapshot {
        stream_id: StreamId::from(stream),
        version: 1,
        state: json!({"s": stream}),
        taken_at: chrono_now(),
        strategy: "every-n-events".to_string(),
    };

    for stream in ["a", "b", "c", "d"] {
        cache.put(snapshot(stream));
    }
    // Refresh everything except "b", then overflow by one.
    for stream in ["a", "c", "d"] {
        cache.get(&StreamId::from(stream), None).unwrap();
    }
    cache.put(snapshot("e"));

    assert!(cache.get(&StreamId::from("b"), None).is_none());
    for stream in ["a", "c", "d", "e"] {
        assert!(cache.get(&StreamId::from(stream), None).is_some(), "{stream}");
    }
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
