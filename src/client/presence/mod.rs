//! Presence Tracking
//!
//! Announces the local user's liveness and derives the visible roster.
//!
//! ```text
//! Stopped --start--> Announcing --online written--> Heartbeating --stop--> Stopped
//! ```
//!
//! While heartbeating, the local record is rewritten every heartbeat
//! interval and the roster key is refetched every poll interval. Push
//! events on the `presence` topic patch the roster in between. A record is
//! live while `now - last_seen < window`; a client that vanishes without
//! stopping simply ages out.
//!
//! [`PresenceTracker::set_typing`] switches the written status between
//! `typing` and `online`; heartbeats keep whichever status was set last.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::client::api::{SessionProvider, WriteApi};
use crate::client::cache::CacheStore;
use crate::client::reconcile::ReconciliationEngine;
use crate::shared::config::PresenceConfig;
use crate::shared::entity::{Entity, PresenceRecord, PresenceStatus, Table};
use crate::shared::error::{Result, SyncError};
use crate::shared::query::QueryKey;

/// Lifecycle of the local presence session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Stopped,
    Announcing,
    Heartbeating,
}

/// Live records from `rows`, one per user, newest `last_seen` first
pub fn live_roster(
    rows: &[Entity],
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Vec<PresenceRecord> {
    let mut by_user: HashMap<&str, &PresenceRecord> = HashMap::new();
    for record in rows.iter().filter_map(Entity::as_presence) {
        if !record.is_live(now, window) {
            continue;
        }
        let newer = by_user
            .get(record.user_id.as_str())
            .map_or(true, |existing| record.last_seen > existing.last_seen);
        if newer {
            by_user.insert(&record.user_id, record);
        }
    }
    let mut roster: Vec<PresenceRecord> = by_user.into_values().cloned().collect();
    roster.sort_by(|a, b| {
        b.last_seen
            .cmp(&a.last_seen)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    roster
}

async fn write_status(write: &dyn WriteApi, user_id: &str, status: PresenceStatus) -> Result<()> {
    let row = serde_json::json!({
        "user_id": user_id,
        "status": status,
        "last_seen": Utc::now().to_rfc3339(),
    });
    write.upsert(Table::Presence, row, "user_id").await.map(|_| ())
}

fn active_status(typing: &AtomicBool) -> PresenceStatus {
    if typing.load(Ordering::Relaxed) {
        PresenceStatus::Typing
    } else {
        PresenceStatus::Online
    }
}

/// Heartbeat and roster maintenance for one local session
pub struct PresenceTracker {
    write: Arc<dyn WriteApi>,
    session: Arc<dyn SessionProvider>,
    engine: Arc<ReconciliationEngine>,
    cache: Arc<CacheStore>,
    config: PresenceConfig,
    state: watch::Sender<PresenceState>,
    user_id: Mutex<Option<String>>,
    typing: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("state", &*self.state.borrow())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PresenceTracker {
    pub fn new(
        write: Arc<dyn WriteApi>,
        session: Arc<dyn SessionProvider>,
        engine: Arc<ReconciliationEngine>,
        config: PresenceConfig,
    ) -> Self {
        let (state, _) = watch::channel(PresenceState::Stopped);
        Self {
            write,
            session,
            cache: engine.cache().clone(),
            engine,
            config,
            state,
            user_id: Mutex::new(None),
            typing: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> PresenceState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<PresenceState> {
        self.state.subscribe()
    }

    /// Announce the local user and start the heartbeat and roster poll.
    /// Does nothing if already started.
    pub async fn start(&self) -> Result<()> {
        if self.state() != PresenceState::Stopped {
            return Ok(());
        }
        let user_id = self.session.require_user_id()?;
        self.state.send_replace(PresenceState::Announcing);
        *self.user_id.lock() = Some(user_id.clone());
        self.typing.store(false, Ordering::Relaxed);

        match write_status(&*self.write, &user_id, PresenceStatus::Online).await {
            Ok(()) => tracing::info!("[Presence] {} online", user_id),
            Err(e) => tracing::warn!("[Presence] Initial announce for {} failed: {}", user_id, e),
        }

        let heartbeat = {
            let write = self.write.clone();
            let user_id = user_id.clone();
            let typing = self.typing.clone();
            let period = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticks = interval_at(Instant::now() + period, period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticks.tick().await;
                    let status = active_status(&typing);
                    if let Err(e) = write_status(&*write, &user_id, status).await {
                        tracing::warn!("[Presence] Heartbeat for {} failed: {}", user_id, e);
                    } else {
                        tracing::trace!("[Presence] Heartbeat for {}", user_id);
                    }
                }
            })
        };

        let poll = {
            let engine = self.engine.clone();
            let period = self.config.poll_interval;
            tokio::spawn(async move {
                let mut ticks = interval_at(Instant::now() + period, period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticks.tick().await;
                    if let Err(e) = engine.refetch(&QueryKey::Presence).await {
                        tracing::warn!("[Presence] Roster poll failed: {}", e);
                    }
                }
            })
        };

        {
            let mut tasks = self.tasks.lock();
            tasks.push(heartbeat);
            tasks.push(poll);
        }
        self.state.send_replace(PresenceState::Heartbeating);
        Ok(())
    }

    /// Cancel the timers and write one offline record. A failed write is
    /// logged, not retried.
    pub async fn stop(&self) {
        if self.state() == PresenceState::Stopped {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!("[Presence] Timer task failed: {}", e);
                }
            }
        }
        let user_id = self.user_id.lock().take();
        if let Some(user_id) = user_id {
            match write_status(&*self.write, &user_id, PresenceStatus::Offline).await {
                Ok(()) => tracing::info!("[Presence] {} offline", user_id),
                Err(e) => tracing::warn!("[Presence] Offline write for {} failed: {}", user_id, e),
            }
        }
        self.state.send_replace(PresenceState::Stopped);
    }

    /// Mark the local user as typing, or back to online. Only valid while
    /// the tracker is running.
    pub async fn set_typing(&self, typing: bool) -> Result<()> {
        let user_id = self.session.require_user_id()?;
        if self.state() != PresenceState::Heartbeating {
            return Err(SyncError::mutation(user_id, "presence is not running"));
        }
        if self.typing.swap(typing, Ordering::Relaxed) == typing {
            return Ok(());
        }
        let status = active_status(&self.typing);
        tracing::debug!("[Presence] {} -> {:?}", user_id, status);
        write_status(&*self.write, &user_id, status)
            .await
            .map_err(|e| SyncError::mutation(user_id, e.to_string()))
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Live users at `now`, one record per user
    pub fn roster(&self, now: DateTime<Utc>) -> Vec<PresenceRecord> {
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        self.cache
            .data(&QueryKey::Presence)
            .map(|rows| live_roster(&rows, now, window))
            .unwrap_or_default()
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
