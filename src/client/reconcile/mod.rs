//! Reconciliation Engine
//!
//! Applies inbound change events to the query cache. Each event is routed
//! onto the cache keys it affects (see [`routing`]) and then handled with
//! exactly one strategy per key:
//!
//! - **Patch in place** when the event carries a full row image, or is a
//!   delete carrying at least the row id. Rows are replaced by identity, so
//!   a re-delivered event leaves the cache unchanged.
//! - **Invalidate and refetch** when the row cannot be decoded, when the
//!   topic's primary key has no cached payload yet, when the change is to a
//!   table joined server-side, and on resync after a reconnect.
//!
//! Events older than the last applied timestamp of their row are dropped.
//! Deletes leave a tombstone so re-deliveries cannot resurrect the row.
//!
//! ## Refetch races
//!
//! A refetch takes a generation number. Events that arrive for the key
//! while it is in flight are buffered and replayed on top of the fetched
//! rows. The result is discarded when a newer refetch has started or the
//! key was evicted and re-created in the meantime.

pub mod routing;

pub use routing::{primary_key, route, Route};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::client::api::QueryApi;
use crate::client::cache::{CacheStore, Payload, RowClock};
use crate::client::feed::FeedNotice;
use crate::client::subscription::TopicHandler;
use crate::shared::entity::{Entity, Table};
use crate::shared::error::{Result, SyncError};
use crate::shared::event::{ChangeEvent, ChangeKind, Topic};
use crate::shared::query::QueryKey;

struct Inflight {
    generation: u64,
    buffered: Vec<ChangeEvent>,
}

type InflightMap = Mutex<HashMap<QueryKey, Inflight>>;

/// Clears a refetch's in-flight slot when the refetch future is dropped
/// before it finishes, e.g. when its dispatcher is aborted. A slot taken
/// over by a newer refetch is left alone.
struct InflightSlot<'a> {
    inflight: &'a InflightMap,
    key: &'a QueryKey,
    generation: u64,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        if inflight.get(self.key).map(|pending| pending.generation) == Some(self.generation) {
            inflight.remove(self.key);
            tracing::debug!("[Reconcile] Refetch of {} abandoned", self.key);
        }
    }
}

/// Maps change events onto cache keys
pub struct ReconciliationEngine {
    cache: Arc<CacheStore>,
    query: Arc<dyn QueryApi>,
    presence_window: chrono::Duration,
    inflight: InflightMap,
    generations: AtomicU64,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("inflight", &self.inflight.lock().len())
            .finish_non_exhaustive()
    }
}

impl ReconciliationEngine {
    pub fn new(
        cache: Arc<CacheStore>,
        query: Arc<dyn QueryApi>,
        presence_window: chrono::Duration,
    ) -> Self {
        Self {
            cache,
            query,
            presence_window,
            inflight: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Apply one change event received on `topic`
    pub async fn on_event(&self, topic: &Topic, event: &ChangeEvent) {
        tracing::debug!(
            "[Reconcile] {:?} on {} (row {:?})",
            event.kind,
            topic,
            event.row_id()
        );

        match route(topic, event) {
            Route::Refetch(keys) => {
                for key in keys.iter().filter(|key| self.cache.contains(key)) {
                    self.refetch_logged(key).await;
                }
            }
            Route::Family(table) => self.on_family_event(table, event).await,
            Route::Keys(keys) => {
                let primary = primary_key(topic);
                let decodable = event.kind == ChangeKind::Delete || event.entity().is_some();
                for key in &keys {
                    if !decodable {
                        if self.cache.contains(key) || primary.as_ref() == Some(key) {
                            tracing::debug!("[Reconcile] Undecodable row, refetching {}", key);
                            self.refetch_logged(key).await;
                        }
                        continue;
                    }
                    let applied = self.apply_or_buffer(key, event);
                    if !applied && primary.as_ref() == Some(key) && !self.cache.has_payload(key) {
                        tracing::debug!("[Reconcile] No entry for {}, refetching", key);
                        self.refetch_logged(key).await;
                    }
                }
            }
        }
    }

    async fn on_family_event(&self, table: Table, event: &ChangeEvent) {
        let keys: Vec<QueryKey> = self
            .cache
            .keys()
            .into_iter()
            .filter(|key| key.table() == table)
            .collect();
        if event.kind == ChangeKind::Delete && event.row_id().is_some() {
            for key in &keys {
                self.apply_or_buffer(key, event);
            }
            return;
        }
        tracing::debug!(
            "[Reconcile] Incomplete routing for {} event, refetching {} keys",
            table,
            keys.len()
        );
        for key in &keys {
            self.cache.invalidate(key);
        }
        for key in &keys {
            self.refetch_logged(key).await;
        }
    }

    /// Buffer the event if a refetch of `key` is in flight, else patch the
    /// cached payload. Returns whether the event was taken (buffered, or the
    /// key had a payload to patch).
    fn apply_or_buffer(&self, key: &QueryKey, event: &ChangeEvent) -> bool {
        let mut inflight = self.inflight.lock();
        if let Some(pending) = inflight.get_mut(key) {
            pending.buffered.push(event.clone());
            return true;
        }
        if !self.cache.has_payload(key) {
            return false;
        }
        self.cache
            .apply(key, |clock, rows| patch_rows(key, clock, rows, event));
        true
    }

    /// Refetch every cached key fed by `topic`
    pub async fn resync(&self, topic: &Topic) {
        let mut keys: Vec<QueryKey> = self
            .cache
            .keys()
            .into_iter()
            .filter(|key| key.derived_from(topic))
            .collect();
        if let Some(primary) = primary_key(topic) {
            if self.cache.contains(&primary) && !keys.contains(&primary) {
                keys.push(primary);
            }
        }
        tracing::info!("[Reconcile] Resync {} ({} keys)", topic, keys.len());
        for key in &keys {
            self.cache.invalidate(key);
        }
        for key in &keys {
            self.refetch_logged(key).await;
        }
    }

    async fn refetch_logged(&self, key: &QueryKey) {
        if let Err(e) = self.refetch(key).await {
            tracing::warn!("[Reconcile] Refetch of {} failed: {}", key, e);
        }
    }

    /// Fetch `key` through the query API and replace its payload.
    ///
    /// Returns the payload now cached; `None` when the result was discarded
    /// because a newer refetch started or the key was evicted. On failure
    /// the previous payload is kept, flagged stale and the error recorded.
    pub async fn refetch(&self, key: &QueryKey) -> Result<Option<Payload>> {
        let incarnation = self.cache.ensure(key);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        self.inflight.lock().insert(
            key.clone(),
            Inflight {
                generation,
                buffered: Vec::new(),
            },
        );
        let _slot = InflightSlot {
            inflight: &self.inflight,
            key,
            generation,
        };
        self.cache.invalidate(key);

        let spec = key.to_query(Utc::now(), self.presence_window);
        let result = self.query.query(&spec).await;

        let mut inflight = self.inflight.lock();
        let current = inflight.get(key).map(|pending| pending.generation);
        if current != Some(generation) {
            tracing::debug!("[Reconcile] Refetch of {} superseded", key);
            return Ok(None);
        }
        let buffered = inflight
            .remove(key)
            .map(|pending| pending.buffered)
            .unwrap_or_default();

        if self.cache.incarnation(key) != Some(incarnation) {
            tracing::debug!("[Reconcile] {} evicted during refetch, discarding", key);
            return Ok(None);
        }

        match result {
            Ok(rows) => {
                let rows: Vec<Entity> = rows.into_iter().filter(|row| key.accepts(row)).collect();
                let count = rows.len();
                self.cache.set(key, rows);
                for event in &buffered {
                    self.cache
                        .apply(key, |clock, rows| patch_rows(key, clock, rows, event));
                }
                drop(inflight);
                tracing::debug!(
                    "[Reconcile] Refetched {} ({} rows, {} replayed)",
                    key,
                    count,
                    buffered.len()
                );
                Ok(self.cache.data(key))
            }
            Err(e) => {
                for event in &buffered {
                    self.cache
                        .apply(key, |clock, rows| patch_rows(key, clock, rows, event));
                }
                drop(inflight);
                let error = match e {
                    SyncError::Fetch { .. } => e,
                    other => SyncError::fetch(key.to_string(), other.to_string()),
                };
                self.cache.set_error(key, error.clone());
                Err(error)
            }
        }
    }

    /// Payload of `key`, fetched first when the key was never filled. When a
    /// concurrent refetch supersedes this one before filling the key, the
    /// rows are read from the server without touching the cache.
    pub async fn ensure_fetched(&self, key: &QueryKey) -> Result<Payload> {
        if let Some(payload) = self.cache.data(key) {
            return Ok(payload);
        }
        if let Some(payload) = self.refetch(key).await? {
            return Ok(payload);
        }
        if let Some(payload) = self.cache.data(key) {
            return Ok(payload);
        }
        let spec = key.to_query(Utc::now(), self.presence_window);
        let rows = self.query.query(&spec).await?;
        Ok(Arc::new(rows.into_iter().filter(|row| key.accepts(row)).collect()))
    }

    /// Whether a refetch of `key` is in flight
    pub fn is_refetching(&self, key: &QueryKey) -> bool {
        self.inflight.lock().contains_key(key)
    }
}

#[async_trait]
impl TopicHandler for ReconciliationEngine {
    async fn handle(&self, topic: &Topic, notice: &FeedNotice) {
        match notice {
            FeedNotice::Event(event) => self.on_event(topic, event).await,
            FeedNotice::Resync => self.resync(topic).await,
        }
    }
}

/// Timestamp a delete is ordered by. Partial delete images carry no
/// reliable version, so only the commit time or a full row counts.
fn delete_timestamp(event: &ChangeEvent) -> Option<DateTime<Utc>> {
    event
        .commit_timestamp
        .or_else(|| event.entity().map(|entity| entity.version_ts()))
}

/// Keep server-joined data the changefeed row image does not carry
fn merge_joined(previous: Option<&Entity>, incoming: Entity) -> Entity {
    match (previous, incoming) {
        (Some(Entity::Channel(old)), Entity::Channel(mut new)) if new.members.is_empty() => {
            new.members = old.members.clone();
            Entity::Channel(new)
        }
        (Some(Entity::Presence(old)), Entity::Presence(mut new)) if new.profile.is_none() => {
            new.profile = old.profile.clone();
            Entity::Presence(new)
        }
        (_, incoming) => incoming,
    }
}

/// Apply one event to a cached result set. Returns `None` when the payload
/// does not change.
pub fn patch_rows(
    key: &QueryKey,
    clock: &mut RowClock,
    rows: &[Entity],
    event: &ChangeEvent,
) -> Option<Vec<Entity>> {
    match event.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let entity = event.entity()?;
            let id = entity.id().to_string();
            let ts = entity.version_ts();
            if !clock.admits_upsert(&id, ts) {
                tracing::debug!("[Reconcile] Discarding stale event for {} in {}", id, key);
                return None;
            }
            clock.record_upsert(&id, ts);

            let identity = entity.identity();
            let mut previous = None;
            let mut out = Vec::with_capacity(rows.len() + 1);
            for row in rows {
                if row.id() == id || row.identity() == identity {
                    previous = Some(row);
                } else {
                    out.push(row.clone());
                }
            }
            if key.accepts(&entity) {
                let merged = merge_joined(previous, entity);
                if previous == Some(&merged) {
                    return None;
                }
                out.push(merged);
            } else if previous.is_none() {
                return None;
            }
            Some(out)
        }
        ChangeKind::Delete => {
            let id = event.row_id()?;
            if !clock.admits_delete(id, delete_timestamp(event)) {
                tracing::debug!("[Reconcile] Discarding stale delete for {} in {}", id, key);
                return None;
            }
            clock.record_delete(id);
            let out: Vec<Entity> = rows.iter().filter(|row| row.id() != id).cloned().collect();
            if out.len() == rows.len() {
                None
            } else {
                Some(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::entity::{Message, MessageKind, Reaction};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn message(id: &str, secs: i64, content: &str) -> Entity {
        Entity::Message(Message {
            id: id.into(),
            channel_id: "C1".into(),
            author_id: "u1".into(),
            content: content.into(),
            created_at: at(secs),
            updated_at: None,
            thread_id: None,
            kind: MessageKind::Text,
        })
    }

    fn reaction(id: &str, emoji: &str) -> Entity {
        Entity::Reaction(Reaction {
            id: id.into(),
            message_id: "m1".into(),
            user_id: "u1".into(),
            emoji: emoji.into(),
            created_at: at(0),
        })
    }

    #[test]
    fn test_insert_is_idempotent() {
        let key = QueryKey::messages("C1");
        let mut clock = RowClock::default();
        let event = ChangeEvent::insert(&message("m1", 1, "hi")).unwrap();

        let once = patch_rows(&key, &mut clock, &[], &event).unwrap();
        assert_eq!(once.len(), 1);
        assert_eq!(patch_rows(&key, &mut clock, &once, &event), None);
    }

    #[test]
    fn test_older_update_is_discarded() {
        let key = QueryKey::messages("C1");
        let mut clock = RowClock::default();
        let mut newer = message("m1", 0, "edited");
        if let Entity::Message(m) = &mut newer {
            m.updated_at = Some(at(60));
        }
        let rows = patch_rows(&key, &mut clock, &[], &ChangeEvent::update(&newer).unwrap()).unwrap();

        let older = ChangeEvent::update(&message("m1", 0, "original")).unwrap();
        assert_eq!(patch_rows(&key, &mut clock, &rows, &older), None);
    }

    #[test]
    fn test_optimistic_reaction_replaced_by_identity() {
        let key = QueryKey::reactions("m1");
        let mut clock = RowClock::default();
        let optimistic = vec![reaction("local", "👍")];
        let confirmed = ChangeEvent::insert(&reaction("server", "👍")).unwrap();

        let rows = patch_rows(&key, &mut clock, &optimistic, &confirmed).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id(), "server");
    }

    #[test]
    fn test_delete_tombstones_row() {
        let key = QueryKey::reactions("m1");
        let mut clock = RowClock::default();
        let rows = vec![reaction("r1", "👍")];
        let delete = ChangeEvent::delete(Table::MessageReactions, json!({"id": "r1"}));

        let rows = patch_rows(&key, &mut clock, &rows, &delete).unwrap();
        assert!(rows.is_empty());

        let redelivered = ChangeEvent::insert(&reaction("r1", "👍")).unwrap();
        assert_eq!(patch_rows(&key, &mut clock, &rows, &redelivered), None);
    }

    #[test]
    fn test_delete_only_removes_its_own_row() {
        let key = QueryKey::reactions("m1");
        let mut clock = RowClock::default();
        let rows = vec![reaction("r2", "👍")];
        let stale = ChangeEvent::delete(
            Table::MessageReactions,
            reaction("r1", "👍").to_row().unwrap(),
        );

        assert_eq!(patch_rows(&key, &mut clock, &rows, &stale), None);
        assert!(clock.is_tombstoned("r1"));
    }

    #[test]
    fn test_row_moving_out_of_key_is_removed() {
        let key = QueryKey::messages("C1");
        let mut clock = RowClock::default();
        let rows = vec![message("m1", 0, "hi")];
        let mut moved = message("m1", 0, "hi");
        if let Entity::Message(m) = &mut moved {
            m.thread_id = Some("t1".into());
            m.updated_at = Some(at(5));
        }
        let rows = patch_rows(&key, &mut clock, &rows, &ChangeEvent::update(&moved).unwrap()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_channel_update_keeps_members() {
        let row = json!({
            "id": "C1", "name": "general", "type": "group", "created_by": "u1",
            "created_at": "2024-01-01T10:00:00Z",
            "members": {"u1": {"username": "alice"}}
        });
        let cached = Entity::from_row(Table::Channels, &row).unwrap();
        let update = ChangeEvent {
            kind: ChangeKind::Update,
            table: Table::Channels,
            before: None,
            after: Some(json!({
                "id": "C1", "name": "renamed", "type": "group", "created_by": "u1",
                "created_at": "2024-01-01T10:00:00Z", "updated_at": "2024-01-01T11:00:00Z"
            })),
            commit_timestamp: None,
        };
        let mut clock = RowClock::default();
        let rows = patch_rows(&QueryKey::Channels, &mut clock, &[cached], &update).unwrap();
        let channel = rows[0].as_channel().unwrap();
        assert_eq!(channel.name, "renamed");
        assert_eq!(channel.members["u1"].username, "alice");
    }
}
