//! Integration tests for projection documents, rebuilds, and queries.

use serde_json::json;
use tidemark::{
    projection::{inmemory, Page, ProjectionBuilder, ProjectionFilter},
    store::{EventStore, Expected, NonEmpty},
    NewEvent,
};

fn order_placed(region: &str, total: i64) -> NonEmpty<NewEvent> {
    NonEmpty::singleton(NewEvent::new(
        "order-placed",
        json!({ "region": region, "total": total }),
    ))
}

fn region_rollup(store: inmemory::Store) -> ProjectionBuilder<inmemory::Store> {
    ProjectionBuilder::new(store)
        .with_id_extractor(|event| {
            event.data["region"]
                .as_str()
                .unwrap_or("unknown")
                .to_string()
        })
        .on("order-placed", |event, current| {
            let orders = current.and_then(|d| d["orders"].as_i64()).unwrap_or(0);
            let revenue = current.and_then(|d| d["revenue"].as_i64()).unwrap_or(0);
            let total = event.data["total"].as_i64().unwrap_or(0);
            Ok(json!({ "orders": orders + 1, "revenue": revenue + total }))
        })
}

async fn seed(store: &EventStore) {
    for (stream, region, total) in [
        ("o1", "eu-west", 10),
        ("o2", "us-east", 25),
        ("o3", "eu-west", 5),
        ("o4", "eu-north", 40),
        ("o5", "eu-west", 1),
    ] {
        store
            .append(stream, order_placed(region, total), Expected::Any)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn rebuilding_twice_yields_identical_data() {
    let events = EventStore::new();
    seed(&events).await;
    let builder = region_rollup(inmemory::Store::new());

    let applied = builder.rebuild(&events, "eu-west", None).await.unwrap();
    assert_eq!(applied, 3);
    let first = builder.get("eu-west").await.unwrap().unwrap();

    let applied = builder.rebuild(&events, "eu-west", None).await.unwrap();
    assert_eq!(applied, 3);
    let second = builder.get("eu-west").await.unwrap().unwrap();

    assert_eq!(first.data, second.data);
    assert_eq!(first.version, second.version);
    assert_eq!(first.data, json!({ "orders": 3, "revenue": 16 }));
}

#[tokio::test]
async fn incremental_processing_matches_rebuild() {
    let events = EventStore::new();
    seed(&events).await;

    let incremental = region_rollup(inmemory::Store::new());
    for event in events.read_all_since(0, 100).await.events {
        incremental.process_event(&event).await.unwrap();
    }

    let rebuilt = region_rollup(inmemory::Store::new());
    for region in ["eu-west", "eu-north", "us-east"] {
        rebuilt.rebuild(&events, region, None).await.unwrap();
    }

    for region in ["eu-west", "eu-north", "us-east"] {
        let a = incremental.get(region).await.unwrap().unwrap();
        let b = rebuilt.get(region).await.unwrap().unwrap();
        assert_eq!(a.data, b.data, "{region}");
        assert_eq!(a.version, b.version, "{region}");
    }
}

#[tokio::test]
async fn queries_filter_and_paginate() {
    let events = EventStore::new();
    seed(&events).await;
    let builder = region_rollup(inmemory::Store::new());
    for event in events.read_all_since(0, 100).await.events {
        builder.process_event(&event).await.unwrap();
    }

    let eu = ProjectionFilter::any().with_id_prefix("eu-");
    assert_eq!(builder.count(&eu).await.unwrap(), 2);

    let page = builder.query(&eu, &Page::new(0, 1)).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, "eu-north");
    let page = builder.query(&eu, &Page::new(1, 10)).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, "eu-west");

    let single_order = ProjectionFilter::any().with_field("orders", json!(1));
    assert_eq!(builder.count(&single_order).await.unwrap(), 2);
}

#[tokio::test]
async fn documents_track_the_last_processed_event() {
    let events = EventStore::new();
    seed(&events).await;
    let builder = region_rollup(inmemory::Store::new());

    let all = events.read_all_since(0, 100).await.events;
    for event in &all {
        builder.process_event(event).await.unwrap();
    }

    // The eu-west document was last touched by o5's event.
    let last_eu_west = all
        .iter()
        .rfind(|e| e.data["region"] == json!("eu-west"))
        .unwrap();
    let doc = builder.get("eu-west").await.unwrap().unwrap();
    assert_eq!(doc.last_processed_event_id, Some(last_eu_west.id));
    assert!(doc.last_processed_at.is_some());
}
