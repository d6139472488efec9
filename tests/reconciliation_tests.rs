//! Reconciliation of changefeed events against the query cache

mod common;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::Ordering;

use chatsync::shared::{
    ChangeEvent, ChangeKind, Entity, QueryKey, SyncError, Table, Topic,
};
use common::{at, engine, eventually, message_row, reaction_row, FakeBackend};

fn ids(rows: &[Entity]) -> Vec<&str> {
    rows.iter().map(Entity::id).collect()
}

fn insert(table: Table, row: serde_json::Value) -> ChangeEvent {
    ChangeEvent {
        kind: ChangeKind::Insert,
        table,
        before: None,
        after: Some(row),
        commit_timestamp: None,
    }
}

fn update(table: Table, row: serde_json::Value) -> ChangeEvent {
    ChangeEvent {
        kind: ChangeKind::Update,
        ..insert(table, row)
    }
}

#[tokio::test]
async fn test_insert_without_entry_refetches_in_created_order() {
    let backend = FakeBackend::new();
    backend.seed(Table::Messages, message_row("m2", "C1", None, 20));
    backend.seed(Table::Messages, message_row("m1", "C1", None, 10));
    let engine = engine(&backend);
    let key = QueryKey::messages("C1");

    let _sub = engine.subscribe(Topic::channel_messages("C1")).await;
    eventually("stream open", || backend.open_streams() == 1).await;
    assert!(!engine.cache().contains(&key));

    let row = message_row("m3", "C1", None, 30);
    backend.seed(Table::Messages, row.clone());
    backend.emit(insert(Table::Messages, row));

    eventually("refetch", || engine.cache().has_payload(&key)).await;
    let rows = engine.cache().data(&key).unwrap();
    assert_eq!(ids(&rows), vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn test_duplicate_insert_leaves_cache_unchanged() {
    let backend = FakeBackend::new();
    let engine = engine(&backend);
    let key = QueryKey::messages("C1");
    let view = engine.use_query(key.clone()).await;
    let topic = Topic::channel_messages("C1");
    let event = insert(Table::Messages, message_row("m1", "C1", None, 1));

    engine.reconciler().on_event(&topic, &event).await;
    let version = view.version();
    engine.reconciler().on_event(&topic, &event).await;

    assert_eq!(view.version(), version);
    assert_eq!(view.data().unwrap().len(), 1);
}

#[tokio::test]
async fn test_reply_lands_in_thread_and_all_but_not_top_level() {
    let backend = FakeBackend::new();
    let engine = engine(&backend);
    let top = engine.use_query(QueryKey::messages("C1")).await;
    let all = engine.use_query(QueryKey::all_messages("C1")).await;
    let thread = engine.use_query(QueryKey::thread("m1")).await;

    let reply = insert(Table::Messages, message_row("r1", "C1", Some("m1"), 5));
    engine
        .reconciler()
        .on_event(&Topic::channel_messages("C1"), &reply)
        .await;

    assert!(top.data().unwrap().is_empty());
    assert_eq!(ids(&all.data().unwrap()), vec!["r1"]);
    assert_eq!(ids(&thread.data().unwrap()), vec!["r1"]);
}

#[tokio::test]
async fn test_older_update_is_discarded() {
    let backend = FakeBackend::new();
    let engine = engine(&backend);
    let view = engine.use_query(QueryKey::messages("C1")).await;
    let topic = Topic::channel_messages("C1");

    let mut newer = message_row("m1", "C1", None, 0);
    newer["content"] = json!("second edit");
    newer["updated_at"] = json!(at(120).to_rfc3339());
    let mut older = message_row("m1", "C1", None, 0);
    older["content"] = json!("first edit");
    older["updated_at"] = json!(at(60).to_rfc3339());

    engine.reconciler().on_event(&topic, &update(Table::Messages, newer)).await;
    engine.reconciler().on_event(&topic, &update(Table::Messages, older)).await;

    let rows = view.data().unwrap();
    assert_eq!(rows[0].as_message().unwrap().content, "second edit");
}

#[tokio::test]
async fn test_delete_is_not_resurrected_by_redelivery() {
    let backend = FakeBackend::new();
    let row = reaction_row("r1", "m1", "u2", "👍", 1);
    backend.seed(Table::MessageReactions, row.clone());
    let engine = engine(&backend);
    let view = engine.use_query(QueryKey::reactions("m1")).await;
    assert_eq!(view.data().unwrap().len(), 1);

    let topic = Topic::reactions("m1");
    let delete = ChangeEvent::delete(Table::MessageReactions, json!({ "id": "r1", "message_id": "m1" }));
    engine.reconciler().on_event(&topic, &delete).await;
    engine
        .reconciler()
        .on_event(&topic, &insert(Table::MessageReactions, row))
        .await;

    assert!(view.data().unwrap().is_empty());
}

#[tokio::test]
async fn test_partial_delete_without_routing_columns_hits_family() {
    let backend = FakeBackend::new();
    backend.seed(Table::MessageReactions, reaction_row("r1", "m1", "u2", "👍", 1));
    backend.seed(Table::MessageReactions, reaction_row("r2", "m2", "u2", "🎉", 2));
    let engine = engine(&backend);
    let first = engine.use_query(QueryKey::reactions("m1")).await;
    let second = engine.use_query(QueryKey::reactions("m2")).await;

    let delete = ChangeEvent::delete(Table::MessageReactions, json!({ "id": "r1" }));
    engine
        .reconciler()
        .on_event(&Topic::new(Table::MessageReactions, None), &delete)
        .await;

    assert!(first.data().unwrap().is_empty());
    assert_eq!(ids(&second.data().unwrap()), vec!["r2"]);
}

#[tokio::test]
async fn test_undecodable_row_triggers_refetch() {
    let backend = FakeBackend::new();
    backend.seed(Table::Messages, message_row("m1", "C1", None, 1));
    let engine = engine(&backend);
    let view = engine.use_query(QueryKey::messages("C1")).await;
    let queries = backend.queries.load(Ordering::SeqCst);

    let mut edited = message_row("m1", "C1", None, 1);
    edited["content"] = json!("edited on the server");
    backend.seed(Table::Messages, edited);

    let partial = update(
        Table::Messages,
        json!({ "id": "m1", "channel_id": "C1", "thread_id": null, "content": "edited on the server" }),
    );
    engine
        .reconciler()
        .on_event(&Topic::channel_messages("C1"), &partial)
        .await;

    assert!(backend.queries.load(Ordering::SeqCst) > queries);
    assert_eq!(
        view.data().unwrap()[0].as_message().unwrap().content,
        "edited on the server"
    );
}

#[tokio::test]
async fn test_events_during_refetch_are_replayed() {
    let backend = FakeBackend::new();
    backend.seed(Table::Messages, message_row("m1", "C1", None, 1));
    let engine = engine(&backend);
    let key = QueryKey::messages("C1");
    let _gate = backend.hold_queries();

    let reconciler = engine.reconciler().clone();
    let refetch_key = key.clone();
    let task = tokio::spawn(async move { reconciler.refetch(&refetch_key).await });
    eventually("refetch in flight", || engine.reconciler().is_refetching(&key)).await;

    let event = insert(Table::Messages, message_row("m2", "C1", None, 2));
    engine
        .reconciler()
        .on_event(&Topic::channel_messages("C1"), &event)
        .await;
    backend.release_queries();

    let payload = task.await.unwrap().unwrap().unwrap();
    assert_eq!(ids(&payload), vec!["m1", "m2"]);
}

#[tokio::test]
async fn test_superseded_refetch_is_discarded() {
    let backend = FakeBackend::new();
    backend.seed(Table::Messages, message_row("m1", "C1", None, 1));
    let engine = engine(&backend);
    let key = QueryKey::messages("C1");
    let _gate = backend.hold_queries();

    let spawn_refetch = || {
        let reconciler = engine.reconciler().clone();
        let key = key.clone();
        tokio::spawn(async move { reconciler.refetch(&key).await })
    };
    let first = spawn_refetch();
    eventually("first query", || backend.queries.load(Ordering::SeqCst) == 1).await;
    let second = spawn_refetch();
    eventually("second query", || backend.queries.load(Ordering::SeqCst) == 2).await;
    backend.release_queries();

    assert_eq!(first.await.unwrap().unwrap(), None);
    assert!(second.await.unwrap().unwrap().is_some());
}

#[tokio::test]
async fn test_failed_refetch_keeps_stale_data() {
    let backend = FakeBackend::new();
    backend.seed(Table::Messages, message_row("m1", "C1", None, 1));
    let engine = engine(&backend);
    let key = QueryKey::messages("C1");
    let view = engine.use_query(key.clone()).await;
    assert!(!view.is_stale());

    backend.fail_queries.store(true, Ordering::SeqCst);
    let result = engine.reconciler().refetch(&key).await;

    assert_matches!(result, Err(SyncError::Fetch { .. }));
    assert_eq!(view.data().unwrap().len(), 1);
    assert!(view.is_stale());
    assert_matches!(view.error(), Some(SyncError::Fetch { .. }));
}

#[tokio::test]
async fn test_first_fetch_failure_surfaces_in_view() {
    let backend = FakeBackend::new();
    backend.fail_queries.store(true, Ordering::SeqCst);
    let engine = engine(&backend);

    let view = engine.use_query(QueryKey::Channels).await;
    assert!(view.data().is_none());
    assert_matches!(view.error(), Some(SyncError::Fetch { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resyncs_derived_keys() {
    let backend = FakeBackend::new();
    backend.seed(Table::Messages, message_row("m1", "C1", None, 1));
    let engine = engine(&backend);
    let _sub = engine.subscribe(Topic::channel_messages("C1")).await;
    let view = engine.use_query(QueryKey::messages("C1")).await;
    eventually("stream open", || backend.open_streams() == 1).await;

    // Missed while disconnected
    backend.seed(Table::Messages, message_row("m2", "C1", None, 2));
    backend.drop_connections();

    eventually("resync", || view.data().map_or(0, |rows| rows.len()) == 2).await;
    assert_eq!(backend.subscribes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_profile_change_refetches_presence() {
    let backend = FakeBackend::new();
    backend.seed(
        Table::Presence,
        common::presence_row("u2", chrono::Utc::now()),
    );
    let engine = engine(&backend);
    let view = engine.use_query(QueryKey::Presence).await;
    let queries = backend.queries.load(Ordering::SeqCst);

    let profile = update(Table::Profiles, json!({ "id": "u2", "username": "bob" }));
    engine
        .reconciler()
        .on_event(&Topic::profiles(), &profile)
        .await;

    assert_eq!(backend.queries.load(Ordering::SeqCst), queries + 1);
    assert_eq!(view.data().unwrap().len(), 1);
}
