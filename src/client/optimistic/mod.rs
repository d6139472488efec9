//! # Optimistic Mutations
//!
//! Applies local writes to the query cache before the remote store confirms
//! them, and rolls them back when the remote write fails.
//!
//! ## Features
//!
//! - **Immediate Cache Updates**: the local patch lands before the remote call starts
//! - **Rollback**: the pre-mutation rows of the entity are put back on failure
//! - **Per-Entity Serialization**: mutations of one entity run one at a time, in arrival order
//! - **Idempotent Deletes**: deleting a row that is already gone counts as success
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chatsync::client::optimistic::{LocalPatch, MutationKind, OptimisticMutationCoordinator};
//! # use chatsync::shared::{Entity, QueryKey};
//! # async fn example(coordinator: OptimisticMutationCoordinator, row: Entity) {
//! let key = QueryKey::reactions("m1");
//! let outcome = coordinator
//!     .mutate(
//!         &row.identity(),
//!         MutationKind::Insert,
//!         LocalPatch::new().upsert(key, row.clone()),
//!         || async { Ok(()) },
//!     )
//!     .await;
//! # }
//! ```
//!
//! Rollback restores the whole snapshot when nothing else touched the key
//! since the patch. Otherwise only the rows whose identity the patch
//! changed are reverted, so concurrent changes from the changefeed survive.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::client::cache::{CacheStore, Payload};
use crate::shared::entity::Entity;
use crate::shared::error::{Result, SyncError};
use crate::shared::query::QueryKey;

/// Kind of remote write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// Result of a mutation that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
    /// The remote store accepted the write
    Confirmed(T),
    /// A delete found the row already gone
    AlreadyApplied,
}

impl<T> MutationOutcome<T> {
    pub fn into_confirmed(self) -> Option<T> {
        match self {
            MutationOutcome::Confirmed(value) => Some(value),
            MutationOutcome::AlreadyApplied => None,
        }
    }
}

type RowEdit = Box<dyn FnOnce(&[Entity]) -> Vec<Entity> + Send>;

/// Local edits to apply to cached keys
#[derive(Default)]
pub struct LocalPatch {
    edits: Vec<(QueryKey, RowEdit)>,
}

impl std::fmt::Debug for LocalPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.edits.iter().map(|(key, _)| key))
            .finish()
    }
}

impl LocalPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arbitrary transformation of one key's rows
    pub fn edit<F>(mut self, key: QueryKey, f: F) -> Self
    where
        F: FnOnce(&[Entity]) -> Vec<Entity> + Send + 'static,
    {
        self.edits.push((key, Box::new(f)));
        self
    }

    /// Insert `entity`, replacing any row with the same identity
    pub fn upsert(self, key: QueryKey, entity: Entity) -> Self {
        self.edit(key, move |rows| {
            let identity = entity.identity();
            let mut out: Vec<Entity> = rows
                .iter()
                .filter(|row| row.identity() != identity)
                .cloned()
                .collect();
            out.push(entity);
            out
        })
    }

    /// Remove the row with this identity
    pub fn remove(self, key: QueryKey, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        self.edit(key, move |rows| {
            rows.iter()
                .filter(|row| row.identity() != identity)
                .cloned()
                .collect()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

/// Pre-mutation state of one touched key
#[derive(Debug, Clone)]
pub struct KeySnapshot {
    pub key: QueryKey,
    pub before: Payload,
    /// Cache version right after the optimistic patch
    pub patched_version: u64,
    /// Identities the patch added, removed or changed
    pub touched: HashSet<String>,
    /// Row ids the patch removed
    pub removed: Vec<String>,
}

/// A mutation awaiting remote confirmation
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub id: Uuid,
    pub entity: String,
    pub kind: MutationKind,
    pub snapshots: Vec<KeySnapshot>,
    pub started_at: DateTime<Utc>,
}

type LockTable = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Exclusive hold on one entity's mutation queue
pub struct EntityGuard {
    entity: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockTable,
}

impl EntityGuard {
    pub fn entity(&self) -> &str {
        &self.entity
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(&self.entity) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.entity);
            }
        }
    }
}

impl std::fmt::Debug for EntityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGuard").field("entity", &self.entity).finish()
    }
}

/// Rows keyed by identity
fn by_identity(rows: &[Entity]) -> HashMap<String, &Entity> {
    rows.iter().map(|row| (row.identity(), row)).collect()
}

fn touched_identities(before: &[Entity], after: &[Entity]) -> HashSet<String> {
    let old = by_identity(before);
    let new = by_identity(after);
    let mut touched: HashSet<String> = old
        .iter()
        .filter(|(identity, row)| new.get(*identity) != Some(*row))
        .map(|(identity, _)| identity.clone())
        .collect();
    touched.extend(
        new.keys()
            .filter(|identity| !old.contains_key(*identity))
            .cloned(),
    );
    touched
}

/// Applies optimistic writes and rolls them back on failure
pub struct OptimisticMutationCoordinator {
    cache: Arc<CacheStore>,
    locks: LockTable,
    pending: Mutex<HashMap<Uuid, PendingMutation>>,
}

impl std::fmt::Debug for OptimisticMutationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticMutationCoordinator")
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl OptimisticMutationCoordinator {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self {
            cache,
            locks: Arc::new(Mutex::new(HashMap::new())),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `entity`. Waiters are served in FIFO order.
    pub async fn lock_entity(&self, entity: &str) -> EntityGuard {
        let lock = self
            .locks
            .lock()
            .entry(entity.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        EntityGuard {
            entity: entity.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Apply `patch`, run `remote`, roll back on failure
    pub async fn mutate<T, F, Fut>(
        &self,
        entity: &str,
        kind: MutationKind,
        patch: LocalPatch,
        remote: F,
    ) -> Result<MutationOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.lock_entity(entity).await;
        self.run_locked(&guard, kind, patch, remote).await
    }

    /// Like [`mutate`](Self::mutate), for a caller already holding the entity lock
    pub async fn run_locked<T, F, Fut>(
        &self,
        guard: &EntityGuard,
        kind: MutationKind,
        patch: LocalPatch,
        remote: F,
    ) -> Result<MutationOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let entity = guard.entity().to_string();
        let id = Uuid::new_v4();
        let snapshots = self.apply_local(patch);
        tracing::debug!(
            "[Mutation] {:?} {} applied locally to {} keys",
            kind,
            entity,
            snapshots.len()
        );
        self.pending.lock().insert(
            id,
            PendingMutation {
                id,
                entity: entity.clone(),
                kind,
                snapshots: snapshots.clone(),
                started_at: Utc::now(),
            },
        );

        let result = remote().await;
        self.pending.lock().remove(&id);

        match result {
            Ok(value) => {
                tracing::debug!("[Mutation] {:?} {} confirmed", kind, entity);
                if kind == MutationKind::Delete {
                    self.settle_delete(&snapshots);
                }
                Ok(MutationOutcome::Confirmed(value))
            }
            Err(e) if kind == MutationKind::Delete && e.is_conflict() => {
                tracing::debug!("[Mutation] {} already deleted", entity);
                self.settle_delete(&snapshots);
                Ok(MutationOutcome::AlreadyApplied)
            }
            Err(e) => {
                tracing::warn!("[Mutation] {:?} {} failed, rolling back: {}", kind, entity, e);
                self.rollback(&snapshots);
                Err(match e {
                    SyncError::Mutation { .. } | SyncError::Conflict { .. } | SyncError::NotAuthenticated => e,
                    other => SyncError::mutation(entity, other.to_string()),
                })
            }
        }
    }

    fn apply_local(&self, patch: LocalPatch) -> Vec<KeySnapshot> {
        let mut snapshots = Vec::new();
        for (key, edit) in patch.edits {
            let mut captured: Option<(Payload, HashSet<String>, Vec<String>)> = None;
            let version = self.cache.patch(&key, |rows| {
                let next = edit(rows);
                let removed = rows
                    .iter()
                    .filter(|row| next.iter().all(|kept| kept.id() != row.id()))
                    .map(|row| row.id().to_string())
                    .collect();
                captured = Some((
                    Arc::new(rows.to_vec()),
                    touched_identities(rows, &next),
                    removed,
                ));
                next
            });
            if let (Some(patched_version), Some((before, touched, removed))) = (version, captured) {
                snapshots.push(KeySnapshot {
                    key,
                    before,
                    patched_version,
                    touched,
                    removed,
                });
            }
        }
        snapshots
    }

    /// A confirmed delete tombstones the removed rows, so a late changefeed
    /// echo of their earlier insert cannot bring them back
    fn settle_delete(&self, snapshots: &[KeySnapshot]) {
        for snapshot in snapshots.iter().filter(|s| !s.removed.is_empty()) {
            self.cache.tombstone(&snapshot.key, &snapshot.removed);
        }
    }

    fn rollback(&self, snapshots: &[KeySnapshot]) {
        for snapshot in snapshots {
            if self.cache.restore_if_unchanged(
                &snapshot.key,
                snapshot.patched_version,
                snapshot.before.clone(),
            ) {
                continue;
            }
            let before = snapshot.before.clone();
            let touched = snapshot.touched.clone();
            self.cache.patch(&snapshot.key, move |rows| {
                let mut out: Vec<Entity> = rows
                    .iter()
                    .filter(|row| !touched.contains(&row.identity()))
                    .cloned()
                    .collect();
                out.extend(
                    before
                        .iter()
                        .filter(|row| touched.contains(&row.identity()))
                        .cloned(),
                );
                out
            });
            tracing::debug!("[Mutation] Reverted entity rows in {}", snapshot.key);
        }
    }

    /// Mutations currently awaiting their remote call
    pub fn pending(&self) -> Vec<PendingMutation> {
        self.pending.lock().values().cloned().collect()
    }

    /// Number of entities with a held or awaited lock
    pub fn locked_entities(&self) -> usize {
        self.locks.lock().len()
    }
}
