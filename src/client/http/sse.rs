//! Server-Sent Events Changefeed
//!
//! Each topic is one long-lived `GET /realtime/v1/changes` request with
//! `Accept: text/event-stream`. Frames are split into lines incrementally,
//! `data:` lines are joined until the blank line that ends an event, and a
//! bare JSON line is accepted as a complete event for proxies that strip
//! the framing.
//!
//! A read error or the end of the response ends the event stream, which
//! the feed client treats as a lost connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{authorize, check_status};
use crate::client::api::{ChangeFeedTransport, TransportSubscription};
use crate::shared::config::SyncConfig;
use crate::shared::entity::Table;
use crate::shared::error::{Result, SyncError};
use crate::shared::event::{ChangeEvent, ChangeKind, Topic};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Incremental SSE line decoder. Feed it raw chunks, get back complete
/// event payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every payload it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(payload) = self.line(line.trim_end_matches(&['\n', '\r'][..])) {
                payloads.push(payload);
            }
        }
        payloads
    }

    fn line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            return None;
        }
        if self.data.is_empty() && line.starts_with('{') && line.ends_with('}') {
            return Some(line.to_string());
        }
        // event:, id: and retry: fields carry nothing we use
        None
    }

    fn flush(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        Some(payload)
    }
}

/// Change notification as the realtime endpoint sends it
#[derive(Debug, Deserialize)]
struct WireChange {
    #[serde(alias = "type", alias = "eventType")]
    kind: ChangeKind,
    table: String,
    #[serde(default, alias = "old_record", alias = "old")]
    before: Option<serde_json::Value>,
    #[serde(default, alias = "record", alias = "new")]
    after: Option<serde_json::Value>,
    #[serde(default)]
    commit_timestamp: Option<DateTime<Utc>>,
}

/// Decode one event payload
pub fn decode_change(payload: &str) -> Result<ChangeEvent> {
    let wire: WireChange = serde_json::from_str(payload)?;
    let table = Table::parse(&wire.table)
        .ok_or_else(|| SyncError::decode(format!("unknown table '{}'", wire.table)))?;
    Ok(ChangeEvent {
        kind: wire.kind,
        table,
        before: wire.before.filter(|v| !v.is_null()),
        after: wire.after.filter(|v| !v.is_null()),
        commit_timestamp: wire.commit_timestamp,
    })
}

struct StreamState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    ready: VecDeque<Result<ChangeEvent>>,
    topic: Topic,
    done: bool,
}

impl StreamState {
    fn accept(&mut self, chunk: &[u8]) {
        for payload in self.decoder.push(chunk) {
            match decode_change(&payload) {
                Ok(event) if self.topic.matches(&event) => self.ready.push_back(Ok(event)),
                Ok(event) => {
                    tracing::trace!("[Feed] Dropping {} event outside {}", event.table, self.topic)
                }
                Err(e) => tracing::warn!("[Feed] Undecodable event on {}: {}", self.topic, e),
            }
        }
    }
}

fn event_stream(state: StreamState) -> BoxStream<'static, Result<ChangeEvent>> {
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.accept(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    state
                        .ready
                        .push_back(Err(SyncError::transport(format!("stream: {}", e))));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}

/// Changefeed transport over server-sent events
#[derive(Debug)]
pub struct SseTransport {
    client: Client,
    url: String,
    api_key: Option<String>,
    open: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl SseTransport {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: config.api_endpoint("/realtime/v1/changes"),
            api_key: config.api_key.clone(),
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Number of streams not yet unsubscribed
    pub fn open_streams(&self) -> usize {
        self.open.lock().len()
    }
}

#[async_trait]
impl ChangeFeedTransport for SseTransport {
    async fn subscribe(&self, topic: &Topic) -> Result<TransportSubscription> {
        let mut params = vec![("table", topic.table.as_str().to_string())];
        if let Some(filter) = &topic.filter {
            params.push(("filter", filter.to_string()));
        }
        let request = self
            .client
            .get(&self.url)
            .query(&params)
            .header("Accept", "text/event-stream");
        let response = authorize(request, self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| SyncError::transport(format!("network: {}", e)))?;
        let response = check_status(response, |msg| SyncError::transport(format!("http: {}", msg))).await?;

        let id = Uuid::new_v4().to_string();
        let (cancel, cancelled) = oneshot::channel();
        self.open.lock().insert(id.clone(), cancel);
        tracing::info!("[Feed] SSE stream {} open for {}", id, topic);

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        let events = event_stream(StreamState {
            bytes,
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
            topic: topic.clone(),
            done: false,
        })
        .take_until(cancelled)
        .boxed();
        Ok(TransportSubscription { id, events })
    }

    async fn unsubscribe(&self, id: &str) -> Result<()> {
        if let Some(cancel) = self.open.lock().remove(id) {
            let _ = cancel.send(());
            tracing::debug!("[Feed] SSE stream {} closed", id);
        }
        Ok(())
    }
}
