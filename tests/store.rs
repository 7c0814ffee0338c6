//! Integration tests for the event store write path and the export/restore
//! boundary.

use serde_json::json;
use tidemark::{
    store::{AppendError, EventStore, Expected, NonEmpty},
    Event, NewEvent,
};

fn single(kind: &str, data: serde_json::Value) -> NonEmpty<NewEvent> {
    NonEmpty::singleton(NewEvent::new(kind, data))
}

#[tokio::test]
async fn optimistic_concurrency_walkthrough() {
    let store = EventStore::new();

    store
        .append(
            "u1",
            single("user-created", json!({"name": "Ada"})),
            Expected::NoStream,
        )
        .await
        .unwrap();

    // An update that expects version 1 succeeds and advances the stream.
    store
        .append(
            "u1",
            single("user-updated", json!({"name": "Ada L."})),
            Expected::Version(1),
        )
        .await
        .unwrap();
    assert_eq!(store.stream_version("u1").await, 2);

    // A second writer with the same stale expectation is rejected.
    let stale = store
        .append(
            "u1",
            single("user-updated", json!({"name": "Ada Byron"})),
            Expected::Version(1),
        )
        .await;
    match stale {
        Err(AppendError::Conflict(conflict)) => {
            assert_eq!(conflict.expected, 1);
            assert_eq!(conflict.actual, 2);
        }
        other => panic!("expected a version conflict, got {other:?}"),
    }

    let events = store.read_stream("u1", 0).await;
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec!["user-created", "user-updated"]);
    assert_eq!(events[1].data, json!({"name": "Ada L."}));
}

#[tokio::test]
async fn export_and_restore_reproduces_the_log() {
    let source = EventStore::new();
    source
        .append("u1", single("user-created", json!({"n": 1})), Expected::Any)
        .await
        .unwrap();
    source
        .append("o1", single("order-placed", json!({"sku": "x"})), Expected::Any)
        .await
        .unwrap();
    source
        .append("u1", single("user-updated", json!({"n": 2})), Expected::Any)
        .await
        .unwrap();

    // An external backup tool needs nothing beyond the paginated global
    // read and the high-water mark.
    let mut exported: Vec<Event> = Vec::new();
    let mut position = 0;
    loop {
        let batch = source.read_all_since(position, 2).await;
        exported.extend(batch.events.iter().map(|e| (**e).clone()));
        position = batch.next_position;
        if batch.caught_up {
            break;
        }
    }
    assert_eq!(exported.len() as u64, source.latest_position().await);

    // Restore is replay: re-append in original order, ids preserved.
    let restored = EventStore::new();
    for event in &exported {
        let replayed = NewEvent {
            id: event.id,
            kind: event.kind.clone(),
            data: event.data.clone(),
            metadata: event.metadata.clone(),
            causation_id: event.causation_id,
            correlation_id: event.correlation_id,
        };
        restored
            .append(
                event.stream_id.clone(),
                NonEmpty::singleton(replayed),
                Expected::Any,
            )
            .await
            .unwrap();
    }

    assert_eq!(restored.latest_position().await, 3);
    assert_eq!(restored.stream_version("u1").await, 2);
    assert_eq!(restored.stream_version("o1").await, 1);

    let original = source.read_all_since(0, 100).await.events;
    let replayed = restored.read_all_since(0, 100).await.events;
    for (a, b) in original.iter().zip(replayed.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.stream_id, b.stream_id);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.version, b.version);
        assert_eq!(a.position, b.position);
        assert_eq!(a.data, b.data);
    }
}

#[tokio::test]
async fn appended_events_carry_causation_links() {
    let store = EventStore::new();
    let cause = NewEvent::new("order-placed", json!({}));
    let cause_id = cause.id;
    store
        .append("o1", NonEmpty::singleton(cause), Expected::Any)
        .await
        .unwrap();

    let effect = NewEvent::new("invoice-issued", json!({}))
        .caused_by(cause_id)
        .correlate(cause_id);
    store
        .append("i1", NonEmpty::singleton(effect), Expected::Any)
        .await
        .unwrap();

    let stored = &store.read_stream("i1", 0).await[0];
    assert_eq!(stored.causation_id, Some(cause_id));
    assert_eq!(stored.correlation_id, Some(cause_id));
    assert_eq!(store.position_of(&cause_id).await, Some(1));
}
