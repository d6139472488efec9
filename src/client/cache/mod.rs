//! Query Cache
//!
//! [`CacheStore`] holds one entry per [`QueryKey`]. Each entry carries an
//! immutable payload snapshot (`Arc<Vec<Entity>>`), a version bumped on
//! every write, a stale flag, the last fetch error and a [`RowClock`] used
//! to discard out-of-order change events.
//!
//! Every write replaces the payload `Arc` wholesale under a synchronous
//! lock, so readers never observe a partially applied update. No critical
//! section spans an `.await`.
//!
//! Readers observe entries through `watch` channels ([`QueryState`]).
//! Consumer views are reference-counted with [`CacheStore::retain`] and
//! [`CacheStore::release`]; when the last view of a key goes away the entry
//! is evicted, unless the key is one of the always-kept keys.

mod clock;

pub use clock::RowClock;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::shared::entity::{sort_by_created, Entity};
use crate::shared::error::SyncError;
use crate::shared::query::QueryKey;

/// Immutable result set shared with readers
pub type Payload = Arc<Vec<Entity>>;

/// What a reader sees for one key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    /// `None` until the first successful fetch
    pub data: Option<Payload>,
    pub is_stale: bool,
    pub error: Option<SyncError>,
    pub version: u64,
}

/// Point-in-time copy of an entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub payload: Option<Payload>,
    pub version: u64,
    pub stale: bool,
    pub error: Option<SyncError>,
    /// Distinguishes this entry from an earlier, evicted entry for the same key
    pub incarnation: u64,
}

struct Slot {
    payload: Option<Payload>,
    version: u64,
    stale: bool,
    error: Option<SyncError>,
    clock: RowClock,
    consumers: usize,
    incarnation: u64,
    tx: watch::Sender<QueryState>,
}

impl Slot {
    fn new(incarnation: u64) -> Self {
        let (tx, _) = watch::channel(QueryState::default());
        Self {
            payload: None,
            version: 0,
            stale: false,
            error: None,
            clock: RowClock::default(),
            consumers: 0,
            incarnation,
            tx,
        }
    }

    fn publish(&self) {
        self.tx.send_replace(QueryState {
            data: self.payload.clone(),
            is_stale: self.stale,
            error: self.error.clone(),
            version: self.version,
        });
    }

    fn snapshot(&self, key: &QueryKey) -> CacheEntry {
        CacheEntry {
            key: key.clone(),
            payload: self.payload.clone(),
            version: self.version,
            stale: self.stale,
            error: self.error.clone(),
            incarnation: self.incarnation,
        }
    }
}

/// Versioned, reactive store of query results
pub struct CacheStore {
    slots: Mutex<HashMap<QueryKey, Slot>>,
    incarnations: AtomicU64,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.slots.lock().len())
            .finish()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            incarnations: AtomicU64::new(1),
        }
    }

    fn next_incarnation(&self) -> u64 {
        self.incarnations.fetch_add(1, Ordering::Relaxed)
    }

    fn slot_mut<'a>(&self, slots: &'a mut HashMap<QueryKey, Slot>, key: &QueryKey) -> &'a mut Slot {
        slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(self.next_incarnation()))
    }

    /// Snapshot of the entry for `key`
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.slots.lock().get(key).map(|slot| slot.snapshot(key))
    }

    /// Current payload for `key`
    pub fn data(&self, key: &QueryKey) -> Option<Payload> {
        self.slots.lock().get(key).and_then(|slot| slot.payload.clone())
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Whether the key has been filled at least once
    pub fn has_payload(&self, key: &QueryKey) -> bool {
        self.slots
            .lock()
            .get(key)
            .map(|slot| slot.payload.is_some())
            .unwrap_or(false)
    }

    /// All keys with an entry
    pub fn keys(&self) -> Vec<QueryKey> {
        self.slots.lock().keys().cloned().collect()
    }

    /// Make sure an (empty) entry exists and return its incarnation
    pub fn ensure(&self, key: &QueryKey) -> u64 {
        let mut slots = self.slots.lock();
        self.slot_mut(&mut slots, key).incarnation
    }

    /// Replace the payload with an authoritative result set.
    ///
    /// Clears the stale flag and any error, bumps the version and rebuilds
    /// the row clock from the new rows. Returns the new version.
    pub fn set(&self, key: &QueryKey, mut rows: Vec<Entity>) -> u64 {
        sort_by_created(&mut rows);
        let mut slots = self.slots.lock();
        let slot = self.slot_mut(&mut slots, key);
        slot.clock.rebase(&rows);
        slot.payload = Some(Arc::new(rows));
        slot.version += 1;
        slot.stale = false;
        slot.error = None;
        slot.publish();
        tracing::debug!("[Cache] set {} -> v{}", key, slot.version);
        slot.version
    }

    /// Transform the payload atomically.
    ///
    /// The closure runs under the store lock and its result replaces the
    /// payload. Keys without a payload are left untouched and `None` is
    /// returned; otherwise the new version is returned.
    pub fn patch<F>(&self, key: &QueryKey, f: F) -> Option<u64>
    where
        F: FnOnce(&[Entity]) -> Vec<Entity>,
    {
        self.apply(key, |_, rows| Some(f(rows)))
    }

    /// Like [`CacheStore::patch`], but the closure also sees the entry's
    /// [`RowClock`] and may decline the write by returning `None`.
    pub fn apply<F>(&self, key: &QueryKey, f: F) -> Option<u64>
    where
        F: FnOnce(&mut RowClock, &[Entity]) -> Option<Vec<Entity>>,
    {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(key)?;
        let current = slot.payload.clone()?;
        let mut rows = f(&mut slot.clock, &current)?;
        sort_by_created(&mut rows);
        slot.payload = Some(Arc::new(rows));
        slot.version += 1;
        slot.publish();
        Some(slot.version)
    }

    /// Tombstone `ids` in the row clock and drop them from the payload.
    /// Returns the new version when a row was dropped.
    pub fn tombstone(&self, key: &QueryKey, ids: &[String]) -> Option<u64> {
        self.apply(key, |clock, rows| {
            for id in ids {
                clock.record_delete(id);
            }
            let out: Vec<Entity> = rows
                .iter()
                .filter(|row| !ids.iter().any(|id| id == row.id()))
                .cloned()
                .collect();
            (out.len() != rows.len()).then_some(out)
        })
    }

    /// Put back an earlier payload, but only if nothing was written since
    /// `version`. Returns whether the payload was restored.
    pub fn restore_if_unchanged(&self, key: &QueryKey, version: u64, payload: Payload) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        if slot.version != version {
            return false;
        }
        slot.payload = Some(payload);
        slot.version += 1;
        slot.publish();
        true
    }

    /// Mark the payload stale without clearing it
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(key) {
            Some(slot) => {
                if !slot.stale {
                    slot.stale = true;
                    slot.publish();
                }
                true
            }
            None => false,
        }
    }

    /// Record a failed fetch; the previous payload is kept and flagged stale
    pub fn set_error(&self, key: &QueryKey, error: SyncError) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.stale = true;
            slot.error = Some(error);
            slot.publish();
        }
    }

    /// Watch the state of `key`, creating an empty entry if needed
    pub fn subscribe_to_key(&self, key: &QueryKey) -> watch::Receiver<QueryState> {
        let mut slots = self.slots.lock();
        self.slot_mut(&mut slots, key).tx.subscribe()
    }

    /// Register a consumer view of `key`
    pub fn retain(&self, key: &QueryKey) -> watch::Receiver<QueryState> {
        let mut slots = self.slots.lock();
        let slot = self.slot_mut(&mut slots, key);
        slot.consumers += 1;
        slot.tx.subscribe()
    }

    /// Drop a consumer view of `key`. Returns whether the entry was evicted.
    pub fn release(&self, key: &QueryKey) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        slot.consumers = slot.consumers.saturating_sub(1);
        if slot.consumers == 0 && !key.always_kept() {
            slots.remove(key);
            tracing::debug!("[Cache] evicted {}", key);
            return true;
        }
        false
    }

    /// Evict every entry without consumers, except the always-kept keys
    pub fn evict_idle(&self) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|key, slot| slot.consumers > 0 || key.always_kept());
        before - slots.len()
    }

    /// Number of live consumer views of `key`
    pub fn consumers(&self, key: &QueryKey) -> usize {
        self.slots.lock().get(key).map(|slot| slot.consumers).unwrap_or(0)
    }

    /// Current incarnation of `key`, if it has an entry
    pub fn incarnation(&self, key: &QueryKey) -> Option<u64> {
        self.slots.lock().get(key).map(|slot| slot.incarnation)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::entity::{Message, MessageKind};
    use chrono::{Duration, TimeZone, Utc};

    fn message(id: &str, secs: i64) -> Entity {
        Entity::Message(Message {
            id: id.into(),
            channel_id: "C1".into(),
            author_id: "u1".into(),
            content: id.into(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap() + Duration::seconds(secs),
            updated_at: None,
            thread_id: None,
            kind: MessageKind::Text,
        })
    }

    fn ids(payload: &Payload) -> Vec<&str> {
        payload.iter().map(|e| e.id()).collect()
    }

    #[test]
    fn test_set_sorts_and_bumps_version() {
        let cache = CacheStore::new();
        let key = QueryKey::messages("C1");
        assert_eq!(cache.set(&key, vec![message("b", 2), message("a", 1)]), 1);
        let entry = cache.get(&key).unwrap();
        assert_eq!(ids(entry.payload.as_ref().unwrap()), vec!["a", "b"]);
        assert_eq!(entry.version, 1);
        assert!(!entry.stale);
    }

    #[test]
    fn test_patch_requires_payload() {
        let cache = CacheStore::new();
        let key = QueryKey::messages("C1");
        cache.ensure(&key);
        assert_eq!(cache.patch(&key, |rows| rows.to_vec()), None);

        cache.set(&key, vec![message("a", 1)]);
        let version = cache.patch(&key, |rows| {
            let mut rows = rows.to_vec();
            rows.push(message("b", 2));
            rows
        });
        assert_eq!(version, Some(2));
        assert_eq!(cache.data(&key).unwrap().len(), 2);
    }

    #[test]
    fn test_old_snapshot_is_unchanged_by_patch() {
        let cache = CacheStore::new();
        let key = QueryKey::messages("C1");
        cache.set(&key, vec![message("a", 1)]);
        let before = cache.data(&key).unwrap();
        cache.patch(&key, |_| Vec::new());
        assert_eq!(before.len(), 1);
        assert!(cache.data(&key).unwrap().is_empty());
    }

    #[test]
    fn test_invalidate_keeps_payload() {
        let cache = CacheStore::new();
        let key = QueryKey::Channels;
        cache.set(&key, Vec::new());
        assert!(cache.invalidate(&key));
        let entry = cache.get(&key).unwrap();
        assert!(entry.stale);
        assert!(entry.payload.is_some());
        assert!(!cache.invalidate(&QueryKey::Presence));
    }

    #[test]
    fn test_set_error_retains_data() {
        let cache = CacheStore::new();
        let key = QueryKey::messages("C1");
        cache.set(&key, vec![message("a", 1)]);
        cache.set_error(&key, SyncError::fetch("messages:C1:top", "timeout"));
        let entry = cache.get(&key).unwrap();
        assert!(entry.stale);
        assert!(entry.error.is_some());
        assert_eq!(entry.payload.unwrap().len(), 1);
    }

    #[test]
    fn test_release_evicts_unless_always_kept() {
        let cache = CacheStore::new();
        let key = QueryKey::messages("C1");
        let _a = cache.retain(&key);
        let _b = cache.retain(&key);
        assert!(!cache.release(&key));
        assert!(cache.release(&key));
        assert!(!cache.contains(&key));

        let _c = cache.retain(&QueryKey::Channels);
        assert!(!cache.release(&QueryKey::Channels));
        assert!(cache.contains(&QueryKey::Channels));
    }

    #[test]
    fn test_reinsert_gets_new_incarnation() {
        let cache = CacheStore::new();
        let key = QueryKey::thread("t1");
        let first = cache.ensure(&key);
        let _rx = cache.retain(&key);
        cache.release(&key);
        let second = cache.ensure(&key);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_subscribers_see_writes() {
        let cache = CacheStore::new();
        let key = QueryKey::messages("C1");
        let mut rx = cache.subscribe_to_key(&key);
        cache.set(&key, vec![message("a", 1)]);
        rx.changed().await.unwrap();
        let state = rx.borrow_and_update().clone();
        assert_eq!(state.version, 1);
        assert_eq!(state.data.unwrap().len(), 1);
    }

    #[test]
    fn test_evict_idle() {
        let cache = CacheStore::new();
        cache.ensure(&QueryKey::thread("t1"));
        cache.ensure(&QueryKey::Presence);
        let _rx = cache.retain(&QueryKey::messages("C1"));
        assert_eq!(cache.evict_idle(), 1);
        assert_eq!(cache.len(), 2);
    }
}
