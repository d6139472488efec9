//! Sync Engine
//!
//! [`SyncEngine`] wires the components together around one shared
//! [`CacheStore`]:
//!
//! ```text
//! transport -> ChangeFeedClient -> SubscriptionRegistry -> ReconciliationEngine -> CacheStore -> QueryView
//! ChatActions -> OptimisticMutationCoordinator -> CacheStore + WriteApi
//! ```
//!
//! All collaborators are injected; nothing here is a process-wide
//! singleton.

pub mod actions;
pub mod api;
pub mod cache;
pub mod feed;
pub mod http;
pub mod optimistic;
pub mod presence;
pub mod reconcile;
pub mod subscription;

pub use actions::ChatActions;
pub use api::{
    ChangeFeedTransport, DocumentQa, QaAnswer, QaSource, QueryApi, SessionProvider, StaticSession,
    TransportSubscription, WriteApi,
};
pub use cache::{CacheEntry, CacheStore, Payload, QueryState};
pub use feed::{ChangeFeedClient, FeedHandle, FeedNotice, SubscriptionStatus};
pub use optimistic::{LocalPatch, MutationKind, MutationOutcome, OptimisticMutationCoordinator};
pub use presence::{PresenceState, PresenceTracker};
pub use reconcile::ReconciliationEngine;
pub use subscription::{SubscriptionRegistry, SubscriptionToken, TopicHandler};

use std::sync::Arc;
use tokio::sync::watch;

use crate::shared::config::SyncConfig;
use crate::shared::error::SyncError;
use crate::shared::event::Topic;
use crate::shared::query::QueryKey;

/// Reactive read of one cache key. Dropping the view releases the key.
pub struct QueryView {
    key: QueryKey,
    rx: watch::Receiver<QueryState>,
    cache: Arc<CacheStore>,
}

impl QueryView {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Full current state
    pub fn state(&self) -> QueryState {
        self.rx.borrow().clone()
    }

    pub fn data(&self) -> Option<Payload> {
        self.rx.borrow().data.clone()
    }

    pub fn is_stale(&self) -> bool {
        self.rx.borrow().is_stale
    }

    pub fn error(&self) -> Option<SyncError> {
        self.rx.borrow().error.clone()
    }

    pub fn version(&self) -> u64 {
        self.rx.borrow().version
    }

    /// Wait for the next change. Returns `false` once the entry is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl Drop for QueryView {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

impl std::fmt::Debug for QueryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryView")
            .field("key", &self.key)
            .field("version", &self.version())
            .finish()
    }
}

/// A live topic subscription. Release it explicitly with
/// [`Subscription::release`]; dropping it releases in the background.
pub struct Subscription {
    token: Option<SubscriptionToken>,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<CacheStore>,
}

impl Subscription {
    pub fn topic(&self) -> Option<&Topic> {
        self.token.as_ref().map(SubscriptionToken::topic)
    }

    pub async fn status(&self) -> Option<SubscriptionStatus> {
        match self.topic() {
            Some(topic) => self.registry.status(topic).await,
            None => None,
        }
    }

    pub async fn release(mut self) {
        if let Some(token) = self.token.take() {
            self.registry.release(token).await;
            self.cache.evict_idle();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.registry.clone();
                let cache = self.cache.clone();
                handle.spawn(async move {
                    registry.release(token).await;
                    cache.evict_idle();
                });
            }
            Err(_) => tracing::warn!(
                "[Registry] Subscription {} dropped outside a runtime",
                token.topic()
            ),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic())
            .finish()
    }
}

/// Entry point tying cache, feeds, reconciliation and mutations together
#[derive(Clone)]
pub struct SyncEngine {
    config: SyncConfig,
    cache: Arc<CacheStore>,
    reconciler: Arc<ReconciliationEngine>,
    registry: Arc<SubscriptionRegistry>,
    coordinator: Arc<OptimisticMutationCoordinator>,
    write: Arc<dyn WriteApi>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        query: Arc<dyn QueryApi>,
        write: Arc<dyn WriteApi>,
        transport: Arc<dyn ChangeFeedTransport>,
    ) -> Self {
        let cache = Arc::new(CacheStore::new());
        let reconciler = Arc::new(ReconciliationEngine::new(
            cache.clone(),
            query,
            config.presence_window(),
        ));
        let feed = ChangeFeedClient::new(transport, config.reconnect.clone());
        let registry = Arc::new(SubscriptionRegistry::new(feed, config.feed_channel_capacity));
        let coordinator = Arc::new(OptimisticMutationCoordinator::new(cache.clone()));
        Self {
            config,
            cache,
            reconciler,
            registry,
            coordinator,
            write,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn reconciler(&self) -> &Arc<ReconciliationEngine> {
        &self.reconciler
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<OptimisticMutationCoordinator> {
        &self.coordinator
    }

    /// Open a view of `key`, fetching it first if it was never filled.
    /// A failed fetch shows up in the view's `error`.
    pub async fn use_query(&self, key: QueryKey) -> QueryView {
        let rx = self.cache.retain(&key);
        let view = QueryView {
            key,
            rx,
            cache: self.cache.clone(),
        };
        if !self.cache.has_payload(&view.key) && !self.reconciler.is_refetching(&view.key) {
            if let Err(e) = self.reconciler.refetch(&view.key).await {
                tracing::warn!("[Cache] Initial fetch of {} failed: {}", view.key, e);
            }
        }
        view
    }

    /// Subscribe the reconciliation engine to `topic`
    pub async fn subscribe(&self, topic: Topic) -> Subscription {
        let handler: Arc<dyn TopicHandler> = self.reconciler.clone();
        let token = self.registry.acquire(topic, handler).await;
        Subscription {
            token: Some(token),
            registry: self.registry.clone(),
            cache: self.cache.clone(),
        }
    }

    /// Presence tracker for the given session
    pub fn presence(&self, session: Arc<dyn SessionProvider>) -> PresenceTracker {
        PresenceTracker::new(
            self.write.clone(),
            session,
            self.reconciler.clone(),
            self.config.presence.clone(),
        )
    }

    /// Chat operations for the given session
    pub fn actions(
        &self,
        session: Arc<dyn SessionProvider>,
        qa: Option<Arc<dyn DocumentQa>>,
    ) -> ChatActions {
        ChatActions::new(
            self.coordinator.clone(),
            self.reconciler.clone(),
            self.write.clone(),
            session,
            qa,
        )
    }

    /// Close every subscription
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}
