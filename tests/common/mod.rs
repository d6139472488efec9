//! Common test utilities and helpers
//!
//! This module provides an in-memory stand-in for the remote store:
//! - Table storage answering `QueryApi` filters
//! - Writes with failure injection and an optional gate
//! - A changefeed whose streams the test drives with `emit`

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

use chatsync::client::{ChangeFeedTransport, QueryApi, SyncEngine, TransportSubscription, WriteApi};
use chatsync::shared::entity::{row_str, row_ts};
use chatsync::shared::{ChangeEvent, Entity, Filter, QuerySpec, Result, SyncConfig, SyncError, Table, Topic};

/// Fixed instant `secs` seconds after the test epoch
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
}

pub fn message_row(id: &str, channel: &str, thread: Option<&str>, secs: i64) -> Value {
    json!({
        "id": id,
        "channel_id": channel,
        "user_id": "u1",
        "content": format!("message {}", id),
        "created_at": at(secs).to_rfc3339(),
        "thread_id": thread,
        "type": "text",
    })
}

pub fn reaction_row(id: &str, message: &str, user: &str, emoji: &str, secs: i64) -> Value {
    json!({
        "id": id,
        "message_id": message,
        "user_id": user,
        "emoji": emoji,
        "created_at": at(secs).to_rfc3339(),
    })
}

pub fn presence_row(user: &str, last_seen: DateTime<Utc>) -> Value {
    json!({
        "user_id": user,
        "status": "online",
        "last_seen": last_seen.to_rfc3339(),
    })
}

pub fn channel_row(id: &str, name: &str, secs: i64) -> Value {
    json!({
        "id": id,
        "name": name,
        "type": "group",
        "created_by": "u1",
        "created_at": at(secs).to_rfc3339(),
    })
}

fn key_column(table: Table) -> &'static str {
    match table {
        Table::Presence => "user_id",
        _ => "id",
    }
}

fn matches_filter(row: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(column, value) => row_str(row, column) == Some(value.as_str()),
        Filter::IsNull(column) => row.get(column).map_or(true, Value::is_null),
        Filter::Gt(column, value) => {
            let bound = DateTime::parse_from_rfc3339(value).map(|t| t.with_timezone(&Utc));
            match (row_ts(row, column), bound) {
                (Some(ts), Ok(bound)) => ts > bound,
                _ => row_str(row, column).map_or(false, |v| v > value.as_str()),
            }
        }
    }
}

struct Feed {
    topic: Topic,
    sender: mpsc::UnboundedSender<Result<ChangeEvent>>,
}

/// In-memory remote store and changefeed
#[derive(Default)]
pub struct FakeBackend {
    tables: Mutex<HashMap<Table, Vec<Value>>>,
    feeds: Mutex<HashMap<String, Feed>>,
    next_feed: AtomicUsize,
    pub subscribes: AtomicUsize,
    pub unsubscribes: AtomicUsize,
    pub queries: AtomicUsize,
    pub fail_queries: AtomicBool,
    pub fail_writes: AtomicBool,
    pub fail_subscribes: AtomicUsize,
    /// Apply writes to the feed as the server would
    pub echo_writes: AtomicBool,
    query_gate: Mutex<Option<Arc<Notify>>>,
    write_gate: Mutex<Option<Arc<Notify>>>,
    writes: Mutex<Vec<(String, Table, Value)>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a row without emitting anything
    pub fn seed(&self, table: Table, row: Value) {
        let column = key_column(table);
        let mut tables = self.tables.lock();
        let rows = tables.entry(table).or_default();
        rows.retain(|existing| row_str(existing, column) != row_str(&row, column));
        rows.push(row);
    }

    pub fn remove(&self, table: Table, id: &str) -> Option<Value> {
        let column = key_column(table);
        let mut tables = self.tables.lock();
        let rows = tables.get_mut(&table)?;
        let pos = rows.iter().position(|row| row_str(row, column) == Some(id))?;
        Some(rows.remove(pos))
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.tables.lock().get(&table).cloned().unwrap_or_default()
    }

    /// Push an event to every open stream whose topic matches
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let feeds = self.feeds.lock();
        let mut delivered = 0;
        for feed in feeds.values() {
            if feed.topic.matches(&event) && feed.sender.send(Ok(event.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Fail every open stream, as a dropped connection would
    pub fn drop_connections(&self) {
        let mut feeds = self.feeds.lock();
        for feed in feeds.values() {
            let _ = feed.sender.send(Err(SyncError::transport("connection reset")));
        }
        feeds.clear();
    }

    /// Streams not yet unsubscribed or dropped
    pub fn open_streams(&self) -> usize {
        self.feeds.lock().len()
    }

    /// Hold every query until the returned gate is notified
    pub fn hold_queries(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.query_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn release_queries(&self) {
        if let Some(gate) = self.query_gate.lock().take() {
            gate.notify_waiters();
        }
    }

    /// Hold every write until the returned gate is notified
    pub fn hold_writes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.write_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn release_writes(&self) {
        if let Some(gate) = self.write_gate.lock().take() {
            gate.notify_waiters();
        }
    }

    /// Writes in the order they reached the backend: (operation, table, row)
    pub fn writes(&self) -> Vec<(String, Table, Value)> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self, operation: &str) -> usize {
        self.writes.lock().iter().filter(|(op, _, _)| op == operation).count()
    }

    async fn wait_write(&self, operation: &str, table: Table, row: &Value) -> Result<()> {
        let gate = self.write_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.writes
            .lock()
            .push((operation.to_string(), table, row.clone()));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::transport("write refused"));
        }
        Ok(())
    }

    fn echo(&self, event: ChangeEvent) {
        if self.echo_writes.load(Ordering::SeqCst) {
            self.emit(event);
        }
    }
}

#[async_trait]
impl QueryApi for FakeBackend {
    async fn query(&self, spec: &QuerySpec) -> Result<Vec<Entity>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let gate = self.query_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(SyncError::fetch(spec.table.as_str(), "503 Service Unavailable"));
        }
        let mut rows: Vec<Value> = self
            .rows(spec.table)
            .into_iter()
            .filter(|row| spec.filters.iter().all(|f| matches_filter(row, f)))
            .collect();
        if let Some(order) = &spec.order {
            rows.sort_by_key(|row| row_ts(row, &order.column));
            if !order.ascending {
                rows.reverse();
            }
        }
        rows.iter().map(|row| Entity::from_row(spec.table, row)).collect()
    }
}

#[async_trait]
impl WriteApi for FakeBackend {
    async fn insert(&self, table: Table, row: Value) -> Result<Entity> {
        self.wait_write("insert", table, &row).await?;
        self.seed(table, row.clone());
        let entity = Entity::from_row(table, &row)?;
        self.echo(ChangeEvent::insert(&entity)?);
        Ok(entity)
    }

    async fn insert_rows(&self, table: Table, rows: Vec<Value>) -> Result<()> {
        for row in rows {
            self.wait_write("insert_rows", table, &row).await?;
            self.tables.lock().entry(table).or_default().push(row);
        }
        Ok(())
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Entity> {
        self.wait_write("update", table, &patch).await?;
        let mut row = self.remove(table, id).ok_or_else(|| SyncError::conflict(id))?;
        if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        self.seed(table, row.clone());
        let entity = Entity::from_row(table, &row)?;
        self.echo(ChangeEvent::update(&entity)?);
        Ok(entity)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        self.wait_write("delete", table, &json!({ "id": id })).await?;
        let before = self.remove(table, id).ok_or_else(|| SyncError::conflict(id))?;
        self.echo(ChangeEvent::delete(table, before));
        Ok(())
    }

    async fn upsert(&self, table: Table, row: Value, on_conflict: &str) -> Result<Entity> {
        self.wait_write("upsert", table, &row).await?;
        let existed = {
            let mut tables = self.tables.lock();
            let rows = tables.entry(table).or_default();
            let before = rows.len();
            rows.retain(|existing| row_str(existing, on_conflict) != row_str(&row, on_conflict));
            let existed = rows.len() != before;
            rows.push(row.clone());
            existed
        };
        let entity = Entity::from_row(table, &row)?;
        self.echo(if existed {
            ChangeEvent::update(&entity)?
        } else {
            ChangeEvent::insert(&entity)?
        });
        Ok(entity)
    }
}

#[async_trait]
impl ChangeFeedTransport for FakeBackend {
    async fn subscribe(&self, topic: &Topic) -> Result<TransportSubscription> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_subscribes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_subscribes.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::transport("subscribe refused"));
        }
        let id = format!("sub-{}", self.next_feed.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::unbounded_channel();
        self.feeds.lock().insert(
            id.clone(),
            Feed {
                topic: topic.clone(),
                sender,
            },
        );
        Ok(TransportSubscription {
            id,
            events: UnboundedReceiverStream::new(receiver).boxed(),
        })
    }

    async fn unsubscribe(&self, id: &str) -> Result<()> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.feeds.lock().remove(id);
        Ok(())
    }
}

pub fn config() -> SyncConfig {
    SyncConfig::builder()
        .user_id("u1")
        .build()
        .expect("default config is valid")
}

/// Engine wired entirely to `backend`
pub fn engine(backend: &Arc<FakeBackend>) -> SyncEngine {
    SyncEngine::new(config(), backend.clone(), backend.clone(), backend.clone())
}

/// Poll `check` until it holds, failing the test after two seconds
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
