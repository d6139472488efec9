//! Refcounted Topic Subscriptions
//!
//! The registry owns every feed handle. Identical topics acquired by
//! several consumers share one [`FeedHandle`] and one dispatcher task; the
//! feed is closed when the last token for the topic is released.
//!
//! Each topic's dispatcher processes notices sequentially and hands every
//! notice to each distinct handler registered for the topic. A handler
//! registered twice counts twice toward the refcount but is invoked once.
//!
//! While a topic's last release is still unsubscribing, the topic stays
//! behind a close gate. An `acquire` of that topic waits for the gate, so
//! the transport never carries two subscriptions for one topic.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::client::feed::{ChangeFeedClient, FeedHandle, FeedNotice, SubscriptionStatus};
use crate::shared::event::Topic;

/// Receives the notices of a topic
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, topic: &Topic, notice: &FeedNotice);
}

/// Proof of one acquisition; give it back with [`SubscriptionRegistry::release`].
///
/// Release is the only way to drop the refcount. A token dropped without
/// release keeps its topic open and is counted in
/// [`SubscriptionRegistry::leaked_tokens`].
#[must_use = "a subscription token must be given back with `SubscriptionRegistry::release`"]
pub struct SubscriptionToken {
    id: u64,
    topic: Topic,
    handler: Arc<dyn TopicHandler>,
    released: bool,
    leaked: Arc<AtomicUsize>,
}

impl SubscriptionToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for SubscriptionToken {
    fn drop(&mut self) {
        if !self.released {
            self.leaked.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "[Registry] Token {} for {} dropped without release",
                self.id,
                self.topic
            );
        }
    }
}

impl std::fmt::Debug for SubscriptionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionToken")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

struct HandlerSlot {
    handler: Arc<dyn TopicHandler>,
    count: usize,
}

type Handlers = Arc<RwLock<Vec<HandlerSlot>>>;

struct TopicEntry {
    refcount: usize,
    handlers: Handlers,
    feed: FeedHandle,
    dispatcher: JoinHandle<()>,
}

/// Held by the closer until the transport has unsubscribed
type CloseGate = Arc<Mutex<()>>;

#[derive(Default)]
struct Topics {
    open: HashMap<Topic, TopicEntry>,
    closing: HashMap<Topic, CloseGate>,
}

fn same_handler(a: &Arc<dyn TopicHandler>, b: &Arc<dyn TopicHandler>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Deduplicating owner of changefeed subscriptions
pub struct SubscriptionRegistry {
    feed: ChangeFeedClient,
    capacity: usize,
    topics: Mutex<Topics>,
    next_token: AtomicU64,
    leaked: Arc<AtomicUsize>,
}

impl SubscriptionRegistry {
    pub fn new(feed: ChangeFeedClient, capacity: usize) -> Self {
        Self {
            feed,
            capacity: capacity.max(1),
            topics: Mutex::new(Topics::default()),
            next_token: AtomicU64::new(1),
            leaked: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register `handler` for `topic`, opening the feed on first use.
    ///
    /// If the topic is still closing from an earlier release, waits until
    /// its unsubscribe has finished.
    pub async fn acquire(&self, topic: Topic, handler: Arc<dyn TopicHandler>) -> SubscriptionToken {
        let mut topics = loop {
            let topics = self.topics.lock().await;
            match topics.closing.get(&topic).cloned() {
                Some(gate) => {
                    drop(topics);
                    tracing::debug!("[Registry] Waiting for {} to finish closing", topic);
                    let _ = gate.lock().await;
                }
                None => break topics,
            }
        };

        match topics.open.get_mut(&topic) {
            Some(entry) => {
                entry.refcount += 1;
                let mut handlers = entry.handlers.write();
                let existing = handlers
                    .iter()
                    .position(|slot| same_handler(&slot.handler, &handler));
                match existing {
                    Some(pos) => handlers[pos].count += 1,
                    None => handlers.push(HandlerSlot {
                        handler: handler.clone(),
                        count: 1,
                    }),
                }
                tracing::debug!("[Registry] {} refcount -> {}", topic, entry.refcount);
            }
            None => {
                let (tx, rx) = mpsc::channel(self.capacity);
                let handlers: Handlers = Arc::new(RwLock::new(vec![HandlerSlot {
                    handler: handler.clone(),
                    count: 1,
                }]));
                let feed = self.feed.open(topic.clone(), tx);
                let dispatcher = tokio::spawn(dispatch(topic.clone(), rx, handlers.clone()));
                topics.open.insert(
                    topic.clone(),
                    TopicEntry {
                        refcount: 1,
                        handlers,
                        feed,
                        dispatcher,
                    },
                );
                tracing::info!("[Registry] Opened subscription {}", topic);
            }
        }
        drop(topics);

        SubscriptionToken {
            id: self.next_token.fetch_add(1, Ordering::Relaxed),
            topic,
            handler,
            released: false,
            leaked: self.leaked.clone(),
        }
    }

    /// Give back a token; the feed is closed when the refcount reaches zero
    pub async fn release(&self, mut token: SubscriptionToken) {
        token.released = true;
        let closing = {
            let mut topics = self.topics.lock().await;
            let Some(entry) = topics.open.get_mut(&token.topic) else {
                tracing::warn!("[Registry] Release of unknown topic {}", token.topic);
                return;
            };
            {
                let mut handlers = entry.handlers.write();
                if let Some(pos) = handlers
                    .iter()
                    .position(|slot| same_handler(&slot.handler, &token.handler))
                {
                    handlers[pos].count -= 1;
                    if handlers[pos].count == 0 {
                        handlers.remove(pos);
                    }
                }
            }
            entry.refcount = entry.refcount.saturating_sub(1);
            tracing::debug!("[Registry] {} refcount -> {}", token.topic, entry.refcount);
            if entry.refcount == 0 {
                match topics.open.remove(&token.topic) {
                    Some(entry) => {
                        let gate = Self::close_gate(&mut topics, &token.topic).await;
                        Some((entry, gate))
                    }
                    None => None,
                }
            } else {
                None
            }
        };

        if let Some((entry, gate)) = closing {
            self.close_entry(&token.topic, entry, gate).await;
        }
    }

    /// Close every subscription regardless of refcount
    pub async fn close_all(&self) {
        let drained = {
            let mut topics = self.topics.lock().await;
            let open: Vec<(Topic, TopicEntry)> = topics.open.drain().collect();
            let mut drained = Vec::with_capacity(open.len());
            for (topic, entry) in open {
                let gate = Self::close_gate(&mut topics, &topic).await;
                drained.push((topic, entry, gate));
            }
            drained
        };
        for (topic, entry, gate) in drained {
            self.close_entry(&topic, entry, gate).await;
        }
    }

    /// Put `topic` behind a fresh close gate and return the held gate
    async fn close_gate(topics: &mut Topics, topic: &Topic) -> (CloseGate, OwnedMutexGuard<()>) {
        let gate: CloseGate = Arc::new(Mutex::new(()));
        let held = gate.clone().lock_owned().await;
        topics.closing.insert(topic.clone(), gate.clone());
        (gate, held)
    }

    async fn close_entry(
        &self,
        topic: &Topic,
        entry: TopicEntry,
        (gate, held): (CloseGate, OwnedMutexGuard<()>),
    ) {
        entry.dispatcher.abort();
        if let Err(e) = entry.dispatcher.await {
            if !e.is_cancelled() {
                tracing::warn!("[Registry] Dispatcher for {} failed: {}", topic, e);
            }
        }
        self.feed.close(entry.feed).await;

        let mut topics = self.topics.lock().await;
        if topics
            .closing
            .get(topic)
            .is_some_and(|current| Arc::ptr_eq(current, &gate))
        {
            topics.closing.remove(topic);
        }
        drop(topics);
        drop(held);
        tracing::info!("[Registry] Closed subscription {}", topic);
    }

    pub async fn refcount(&self, topic: &Topic) -> usize {
        self.topics
            .lock()
            .await
            .open
            .get(topic)
            .map(|entry| entry.refcount)
            .unwrap_or(0)
    }

    /// Whether a feed handle exists for `topic`
    pub async fn is_open(&self, topic: &Topic) -> bool {
        self.topics.lock().await.open.contains_key(topic)
    }

    /// Whether `topic` is still unsubscribing after its last release
    pub async fn is_closing(&self, topic: &Topic) -> bool {
        self.topics.lock().await.closing.contains_key(topic)
    }

    /// Number of distinct handlers registered for `topic`
    pub async fn handler_count(&self, topic: &Topic) -> usize {
        self.topics
            .lock()
            .await
            .open
            .get(topic)
            .map(|entry| entry.handlers.read().len())
            .unwrap_or(0)
    }

    pub async fn status(&self, topic: &Topic) -> Option<SubscriptionStatus> {
        self.topics
            .lock()
            .await
            .open
            .get(topic)
            .map(|entry| entry.feed.status())
    }

    pub async fn topics(&self) -> Vec<Topic> {
        self.topics.lock().await.open.keys().cloned().collect()
    }

    /// Tokens dropped without being released
    pub fn leaked_tokens(&self) -> usize {
        self.leaked.load(Ordering::Relaxed)
    }
}

async fn dispatch(topic: Topic, mut rx: mpsc::Receiver<FeedNotice>, handlers: Handlers) {
    while let Some(notice) = rx.recv().await {
        let current: Vec<Arc<dyn TopicHandler>> = handlers
            .read()
            .iter()
            .map(|slot| slot.handler.clone())
            .collect();
        for handler in current {
            handler.handle(&topic, &notice).await;
        }
    }
    tracing::debug!("[Registry] Dispatcher for {} finished", topic);
}
