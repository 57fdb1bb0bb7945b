mod common;

use client_core::error::RpcError;
use client_core::grpc::Code;
use common::{event, guest, task, MockBackend};
use planner_client::invalidation::{ChangeKind, InvalidationEvent, InvalidationListener, PayloadError};
use planner_client::store::{DataStores, EntityKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn setup(backend: &Arc<MockBackend>) -> (Arc<DataStores>, Arc<InvalidationListener>) {
    let stores = Arc::new(DataStores::new(backend.clone()));
    stores.set_feed_owner(Some("u1".to_string()));
    let listener = Arc::new(InvalidationListener::new(stores.clone()));
    (stores, listener)
}

#[tokio::test]
async fn test_child_update_refreshes_collection() {
    let backend = MockBackend::new().with_guests("e1", vec![guest("a", "e1")]);
    let (stores, listener) = setup(&backend);
    stores.guests.load("e1").await;

    backend
        .guests
        .lock()
        .unwrap()
        .insert("e1".to_string(), vec![guest("a", "e1"), guest("b", "e1")]);
    listener
        .handle(InvalidationEvent::new(EntityKind::Guest, "e1", ChangeKind::Upsert))
        .await;

    assert_eq!(stores.guests.get("e1").len(), 2);
    assert_eq!(backend.calls("list_guests"), 2);
}

#[tokio::test]
async fn test_cohost_removed_purges_without_fetching() {
    let backend = MockBackend::new()
        .with_events(vec![event("e1", "u1")])
        .with_guests("e1", vec![guest("a", "e1")]);
    let (stores, listener) = setup(&backend);
    stores.load_feed().await;
    stores.guests.load("e1").await;

    let payload: HashMap<String, String> = [("type", "cohost_removed"), ("parentId", "e1")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    listener.handle_payload(&payload).await.unwrap();

    assert!(stores.feed().is_empty());
    assert!(stores.guests.get("e1").is_empty());
    assert_eq!(backend.calls("get_event"), 0);
}

#[tokio::test]
async fn test_unknown_payload_is_rejected() {
    let backend = MockBackend::new();
    let (_stores, listener) = setup(&backend);

    let payload: HashMap<String, String> =
        [("type".to_string(), "photo_added".to_string()), ("parentId".to_string(), "e1".to_string())]
            .into_iter()
            .collect();
    let result = listener.handle_payload(&payload).await;

    assert_eq!(result, Err(PayloadError::UnknownType("photo_added".to_string())));
    assert!(backend.call_log().is_empty());
}

#[tokio::test]
async fn test_bulk_refresh_reloads_event_tree() {
    let backend = MockBackend::new()
        .with_events(vec![event("e1", "u1")])
        .with_tasks("e1", vec![task("t1", "e1")]);
    let (stores, listener) = setup(&backend);

    listener
        .handle(InvalidationEvent::new(EntityKind::Event, "e1", ChangeKind::BulkRefresh))
        .await;

    assert_eq!(backend.calls("get_event"), 1);
    assert_eq!(backend.calls("list_guests"), 1);
    assert_eq!(backend.calls("list_tasks"), 1);
    assert_eq!(backend.calls("list_agenda"), 1);
    assert_eq!(backend.calls("list_expenses"), 1);
    assert!(stores.find_event("e1").is_some());
    assert_eq!(stores.tasks.get("e1").len(), 1);
}

#[tokio::test]
async fn test_bulk_refresh_payload_purges_event_when_child_access_is_lost() {
    let backend = MockBackend::new()
        .with_events(vec![event("e1", "u1"), event("e2", "u1")])
        .with_guests("e1", vec![guest("a", "e1")])
        .with_tasks("e1", vec![task("t1", "e1")]);
    let (stores, listener) = setup(&backend);
    stores.load_feed().await;
    stores.guests.load("e1").await;
    backend.fail("list_tasks", RpcError::server(Code::PermissionDenied, "removed from event"));

    let payload: HashMap<String, String> = [("type", "bulk_refresh"), ("parentId", "e1")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    listener.handle_payload(&payload).await.unwrap();

    assert_eq!(backend.calls("get_event"), 1);
    assert_eq!(backend.calls("list_tasks"), 1);
    assert!(stores.find_event("e1").is_none());
    assert!(stores.find_event("e2").is_some());
    assert!(stores.guests.get("e1").is_empty());
    assert!(stores.tasks.get("e1").is_empty());
}

#[tokio::test]
async fn test_run_drains_channel_until_closed() {
    let backend = MockBackend::new()
        .with_guests("e1", vec![guest("a", "e1")])
        .with_tasks("e2", vec![task("t1", "e2")]);
    let (stores, listener) = setup(&backend);
    let (tx, rx) = mpsc::channel(8);

    let run = tokio::spawn(listener.run(rx, CancellationToken::new()));
    tx.send(InvalidationEvent::new(EntityKind::Guest, "e1", ChangeKind::Upsert))
        .await
        .unwrap();
    tx.send(InvalidationEvent::new(EntityKind::Task, "e2", ChangeKind::Remove))
        .await
        .unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stores.guests.get("e1").len(), 1);
    assert_eq!(stores.tasks.get("e2").len(), 1);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let backend = MockBackend::new();
    let (_stores, listener) = setup(&backend);
    let (_tx, rx) = mpsc::channel::<InvalidationEvent>(8);
    let shutdown = CancellationToken::new();

    let run = tokio::spawn(listener.run(rx, shutdown.clone()));
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap();
}
