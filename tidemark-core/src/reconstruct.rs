//! Aggregate state reconstruction.
//!
//! A [`Reconstructor`] answers "what is this entity's state now" by
//! combining the latest usable snapshot with the event suffix appended
//! after it, folding each event through the caller's [`Aggregate`]
//! reducer. Snapshots only ever shorten the replay: any snapshot problem
//! falls back to a full replay from version 0, which is always
//! authoritative.

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    event::{Event, StreamId},
    snapshot::{manager::SnapshotManager, DurableSnapshotStore},
    store::{DurableEventLog, EventStore},
};

/// Deterministic reducer for one entity type.
///
/// `apply` must be a pure fold step: the same `(state, event)` input always
/// yields the same state, with no side effects, so replay is resumable from
/// any snapshot. Entity lifecycle is the reducer's business: a reducer
/// that has seen its terminal event simply ignores later ones, while the
/// store keeps the stream readable forever.
///
/// ```ignore
/// impl Aggregate for Account {
///     fn apply(&mut self, event: &Event) {
///         match event.kind.as_str() {
///             "funds-deposited" => self.balance += amount(event),
///             "account-closed" => self.closed = true,
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait Aggregate: Default {
    fn apply(&mut self, event: &Event);
}

/// State produced by reconstruction, plus the version it reflects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reconstructed<A> {
    pub state: A,
    /// Stream version the state includes (0 for an empty stream). Use as
    /// the expected version for a subsequent optimistic append.
    pub version: u64,
}

/// Rebuilds entity state from the store and the snapshot manager.
pub struct Reconstructor<'a, L, S> {
    store: &'a EventStore<L>,
    snapshots: &'a SnapshotManager<S>,
}

impl<'a, L, S> Reconstructor<'a, L, S>
where
    L: DurableEventLog,
    S: DurableSnapshotStore,
{
    #[must_use]
    pub const fn new(store: &'a EventStore<L>, snapshots: &'a SnapshotManager<S>) -> Self {
        Self { store, snapshots }
    }

    /// Reconstruct an entity's current state.
    ///
    /// After a full replay the folded state is offered back to the snapshot
    /// manager, so frequently loaded entities converge on short suffixes.
    pub async fn reconstruct<A>(&self, stream_id: impl Into<StreamId>) -> Reconstructed<A>
    where
        A: Aggregate + Serialize + DeserializeOwned,
    {
        self.reconstruct_inner(stream_id.into(), None, true).await
    }

    /// Reconstruct an entity's state as of `target_version`.
    ///
    /// Uses the latest snapshot at or below the target, then folds only
    /// events with `version <= target_version`. Historical loads do not
    /// offer snapshots.
    pub async fn reconstruct_at<A>(
        &self,
        stream_id: impl Into<StreamId>,
        target_version: u64,
    ) -> Reconstructed<A>
    where
        A: Aggregate + Serialize + DeserializeOwned,
    {
        self.reconstruct_inner(stream_id.into(), Some(target_version), false)
            .await
    }

    #[tracing::instrument(skip_all, fields(stream = %stream_id, target = ?target))]
    async fn reconstruct_inner<A>(
        &self,
        stream_id: StreamId,
        target: Option<u64>,
        offer_snapshot: bool,
    ) -> Reconstructed<A>
    where
        A: Aggregate + Serialize + DeserializeOwned,
    {
        let (mut state, snapshot_version) = match self.snapshots.load_latest(&stream_id, target).await
        {
            Some(snapshot) => match serde_json::from_value::<A>(snapshot.state) {
                Ok(state) => (state, snapshot.version),
                Err(error) => {
                    // The stored shape no longer matches the reducer's state
                    // type. Same recovery as any other integrity problem.
                    self.snapshots.record_integrity_failure();
                    tracing::warn!(
                        stream = %stream_id,
                        version = snapshot.version,
                        error = %error,
                        "snapshot state does not deserialize, replaying from scratch"
                    );
                    (A::default(), 0)
                }
            },
            None => (A::default(), 0),
        };

        let suffix = self.store.read_stream(stream_id.clone(), snapshot_version).await;
        let mut version = snapshot_version;
        let mut applied = 0usize;
        for event in &suffix {
            if let Some(target) = target {
                if event.version > target {
                    break;
                }
            }
            state.apply(event);
            version = event.version;
            applied += 1;
        }

        tracing::debug!(
            stream = %stream_id,
            snapshot_version,
            events_applied = applied,
            version,
            "state reconstructed"
        );

        if offer_snapshot && applied > 0 {
            match serde_json::to_value(&state) {
                Ok(value) => {
                    if let Err(error) = self
                        .snapshots
                        .create_snapshot_if_needed(&stream_id, version, &value, &suffix)
                        .await
                    {
                        tracing::warn!(
                            stream = %stream_id,
                            error = %error,
                            "post-replay snapshot offer failed"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        stream = %stream_id,
                        error = %error,
                        "state not serializable, skipping snapshot offer"
                    );
                }
            }
        }

        Reconstructed { state, version }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use nonempty::nonempty;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::{
        event::NewEvent,
        snapshot::{inmemory, strategy::EveryNEvents, CompressedSnapshot},
        store::Expected,
    };

    #[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Account {
        balance: i64,
        closed: bool,
    }

    impl Aggregate for Account {
        fn apply(&mut self, event: &Event) {
            if self.closed {
                return;
            }
            match event.kind.as_str() {
                "funds-deposited" => {
                    self.balance += event.data["amount"].as_i64().unwrap_or(0);
                }
                "funds-withdrawn" => {
                    self.balance -= event.data["amount"].as_i64().unwrap_or(0);
                }
                "account-closed" => self.closed = true,
                _ => {}
            }
        }
    }

    fn deposit(amount: i64) -> NewEvent {
        NewEvent::new("funds-deposited", json!({ "amount": amount }))
    }

    fn manager() -> SnapshotManager<inmemory::Store> {
        SnapshotManager::new(inmemory::Store::new()).with_strategy(EveryNEvents::new(u64::MAX))
    }

    #[tokio::test]
    async fn empty_stream_yields_default_state_at_version_zero() {
        let store = EventStore::new();
        let snapshots = manager();
        let reconstructor = Reconstructor::new(&store, &snapshots);

        let result: Reconstructed<Account> = reconstructor.reconstruct("missing").await;
        assert_eq!(result.state, Account::default());
        assert_eq!(result.version, 0);
    }

    #[tokio::test]
    async fn full_replay_folds_every_event() {
        let store = EventStore::new();
        let snapshots = manager();
        let reconstructor = Reconstructor::new(&store, &snapshots);

        store
            .append(
                "acct-1",
                nonempty![deposit(100), deposit(50), deposit(-0)],
                Expected::Any,
            )
            .await
            .unwrap();
        store
            .append(
                "acct-1",
                nonempty![NewEvent::new("funds-withdrawn", json!({"amount": 30}))],
                Expected::Any,
            )
            .await
            .unwrap();

        let result: Reconstructed<Account> = reconstructor.reconstruct("acct-1").await;
        assert_eq!(result.state.balance, 120);
        assert_eq!(result.version, 4);
    }

    #[tokio::test]
    async fn snapshot_plus_suffix_equals_full_replay() {
        let store = EventStore::new();
        // Snapshot eagerly so every reconstruction stores one.
        let snapshots =
            SnapshotManager::new(inmemory::Store::new()).with_strategy(EveryNEvents::new(1));
        let reconstructor = Reconstructor::new(&store, &snapshots);

        for amount in [10, 20, 30, 40, 50] {
            store
                .append("acct-1", nonempty![deposit(amount)], Expected::Any)
                .await
                .unwrap();
            // Reconstruct at each placement so snapshots land at every
            // version, then verify against an independent full replay.
            let with_snapshots: Reconstructed<Account> =
                reconstructor.reconstruct("acct-1").await;

            let bare = SnapshotManager::new(inmemory::Store::new());
            let full_replay: Reconstructed<Account> = Reconstructor::new(&store, &bare)
                .reconstruct("acct-1")
                .await;

            assert_eq!(with_snapshots.state, full_replay.state);
            assert_eq!(with_snapshots.version, full_replay.version);
        }

        let report = snapshots.metrics().report();
        assert!(report.stored >= 1);
    }

    #[tokio::test]
    async fn reconstruct_at_stops_at_target_version() {
        let store = EventStore::new();
        let snapshots = manager();
        let reconstructor = Reconstructor::new(&store, &snapshots);

        store
            .append(
                "acct-1",
                nonempty![deposit(10), deposit(20), deposit(30)],
                Expected::Any,
            )
            .await
            .unwrap();

        let result: Reconstructed<Account> = reconstructor.reconstruct_at("acct-1", 2).await;
        assert_eq!(result.state.balance, 30);
        assert_eq!(result.version, 2);
    }

    #[tokio::test]
    async fn terminal_event_makes_reducer_inert_while_stream_stays_readable() {
        let store = EventStore::new();
        let snapshots = manager();
        let reconstructor = Reconstructor::new(&store, &snapshots);

        store
            .append(
                "acct-1",
                nonempty![
                    deposit(100),
                    NewEvent::new("account-closed", json!({})),
                    deposit(999)
                ],
                Expected::Any,
            )
            .await
            .unwrap();

        let result: Reconstructed<Account> = reconstructor.reconstruct("acct-1").await;
        assert!(result.state.closed);
        // The deposit after closure was replayed but ignored by the reducer.
        assert_eq!(result.state.balance, 100);
        assert_eq!(result.version, 3);
        assert_eq!(store.read_stream("acct-1", 0).await.len(), 3);
    }

    #[tokio::test]
    async fn undeserializable_snapshot_falls_back_to_full_replay() {
        let store = EventStore::new();
        let durable = inmemory::Store::new();
        let snapshots = SnapshotManager::new(durable.clone());
        let reconstructor = Reconstructor::new(&store, &snapshots);

        store
            .append("acct-1", nonempty![deposit(10), deposit(20)], Expected::Any)
            .await
            .unwrap();

        // A snapshot whose state has the wrong shape for `Account`.
        let bogus = zstd::encode_all(&br#""just a string""#[..], 1).unwrap();
        durable
            .save(CompressedSnapshot {
                stream_id: StreamId::from("acct-1"),
                version: 2,
                state: bogus,
                taken_at: Utc::now(),
                strategy: "every-n-events".to_string(),
            })
            .await
            .unwrap();

        let result: Reconstructed<Account> = reconstructor.reconstruct("acct-1").await;
        assert_eq!(result.state.balance, 30);
        assert_eq!(result.version, 2);
        assert_eq!(snapshots.metrics().report().integrity_failures, 1);
    }
}
