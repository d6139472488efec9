//! Changefeed Connections
//!
//! [`ChangeFeedClient::open`] spawns one connection task per topic. The task
//! subscribes through the injected [`ChangeFeedTransport`], forwards every
//! event to the caller's sink in arrival order and reconnects with
//! exponential backoff whenever the connection is lost.
//!
//! ## Status
//!
//! ```text
//! Idle -> Connecting -> Subscribed -> Error -> Connecting -> ... -> Closed
//! ```
//!
//! After every successful *re*connect the task emits [`FeedNotice::Resync`]
//! before any new event, since events may have been missed while the
//! connection was down.
//!
//! Dropping a [`FeedHandle`] has the same effect as closing it, except that
//! nobody waits for the task to finish unsubscribing.

pub mod backoff;

pub use backoff::Backoff;

use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::client::api::ChangeFeedTransport;
use crate::shared::config::BackoffConfig;
use crate::shared::event::{ChangeEvent, Topic};

/// Connection status of one feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Idle,
    Connecting,
    Subscribed,
    Error(String),
    Closed,
}

impl SubscriptionStatus {
    /// Whether the feed is between connections
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, SubscriptionStatus::Connecting | SubscriptionStatus::Error(_))
    }
}

/// What a feed delivers to its sink
#[derive(Debug, Clone, PartialEq)]
pub enum FeedNotice {
    /// A row change, in per-topic commit order
    Event(ChangeEvent),
    /// The connection was re-established; derived keys must be refetched
    Resync,
}

/// Handle to a running feed task
#[derive(Debug)]
pub struct FeedHandle {
    topic: Topic,
    status: watch::Receiver<SubscriptionStatus>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn status_receiver(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }
}

/// Opens reconnecting feeds over a transport
#[derive(Clone)]
pub struct ChangeFeedClient {
    transport: Arc<dyn ChangeFeedTransport>,
    backoff: BackoffConfig,
}

impl std::fmt::Debug for ChangeFeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedClient")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

enum Disconnect {
    Shutdown,
    SinkClosed,
    Lost(String),
}

impl ChangeFeedClient {
    pub fn new(transport: Arc<dyn ChangeFeedTransport>, backoff: BackoffConfig) -> Self {
        Self { transport, backoff }
    }

    /// Start a connection task for `topic` delivering into `sink`
    pub fn open(&self, topic: Topic, sink: mpsc::Sender<FeedNotice>) -> FeedHandle {
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Idle);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_feed(
            self.transport.clone(),
            topic.clone(),
            sink,
            status_tx,
            Backoff::new(self.backoff.clone()),
            shutdown_rx,
        ));
        tracing::debug!("[Feed] Opened {}", topic);
        FeedHandle {
            topic,
            status: status_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Stop the task and wait until it has unsubscribed
    pub async fn close(&self, mut handle: FeedHandle) {
        if let Some(shutdown) = handle.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = handle.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("[Feed] Task for {} ended abnormally: {}", handle.topic, e);
            }
        }
        tracing::debug!("[Feed] Closed {}", handle.topic);
    }
}

async fn run_feed(
    transport: Arc<dyn ChangeFeedTransport>,
    topic: Topic,
    sink: mpsc::Sender<FeedNotice>,
    status: watch::Sender<SubscriptionStatus>,
    mut backoff: Backoff,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connected_before = false;

    loop {
        status.send_replace(SubscriptionStatus::Connecting);
        let subscribed = tokio::select! {
            _ = &mut shutdown => break,
            result = transport.subscribe(&topic) => result,
        };

        match subscribed {
            Ok(subscription) => {
                tracing::info!("[Feed] Subscribed to {} ({})", topic, subscription.id);
                status.send_replace(SubscriptionStatus::Subscribed);
                backoff.reset();

                if connected_before && sink.send(FeedNotice::Resync).await.is_err() {
                    unsubscribe(&*transport, &topic, &subscription.id).await;
                    break;
                }
                connected_before = true;

                let mut events = subscription.events;
                let outcome = loop {
                    tokio::select! {
                        _ = &mut shutdown => break Disconnect::Shutdown,
                        item = events.next() => match item {
                            Some(Ok(event)) => {
                                if sink.send(FeedNotice::Event(event)).await.is_err() {
                                    break Disconnect::SinkClosed;
                                }
                            }
                            Some(Err(e)) => break Disconnect::Lost(e.to_string()),
                            None => break Disconnect::Lost("stream ended".to_string()),
                        },
                    }
                };
                drop(events);
                unsubscribe(&*transport, &topic, &subscription.id).await;

                match outcome {
                    Disconnect::Shutdown | Disconnect::SinkClosed => break,
                    Disconnect::Lost(reason) => {
                        tracing::warn!("[Feed] Connection for {} lost: {}", topic, reason);
                        status.send_replace(SubscriptionStatus::Error(reason));
                    }
                }
            }
            Err(e) => {
                tracing::warn!("[Feed] Subscribe to {} failed: {}", topic, e);
                status.send_replace(SubscriptionStatus::Error(e.to_string()));
            }
        }

        let delay = backoff.next_delay();
        tracing::debug!(
            "[Feed] Reconnecting {} in {:?} (attempt {})",
            topic,
            delay,
            backoff.attempt()
        );
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    status.send_replace(SubscriptionStatus::Closed);
}

async fn unsubscribe(transport: &dyn ChangeFeedTransport, topic: &Topic, id: &str) {
    if let Err(e) = transport.unsubscribe(id).await {
        tracing::debug!("[Feed] Unsubscribe {} from {} failed: {}", id, topic, e);
    }
}
