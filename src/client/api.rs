//! External Collaborators
//!
//! The engine reaches the outside world only through these traits. They are
//! injected at construction as `Arc<dyn ...>`, so tests can swap in
//! in-memory fakes and the binary wires up the reqwest adapters in
//! [`crate::client::http`].

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::shared::entity::{Entity, Table};
use crate::shared::error::Result;
use crate::shared::event::{ChangeEvent, Topic};
use crate::shared::query::QuerySpec;
use crate::shared::SyncError;

/// Filtered, ordered reads against the remote store
#[async_trait]
pub trait QueryApi: Send + Sync {
    async fn query(&self, spec: &QuerySpec) -> Result<Vec<Entity>>;
}

/// Writes against the remote store
#[async_trait]
pub trait WriteApi: Send + Sync {
    /// Insert a row and return the stored representation
    async fn insert(&self, table: Table, row: serde_json::Value) -> Result<Entity>;

    /// Insert several rows without asking for their representation
    async fn insert_rows(&self, table: Table, rows: Vec<serde_json::Value>) -> Result<()>;

    /// Patch the row with primary key `id`
    async fn update(&self, table: Table, id: &str, patch: serde_json::Value) -> Result<Entity>;

    /// Delete the row with primary key `id`. Returns [`SyncError::Conflict`]
    /// when the row is already gone.
    async fn delete(&self, table: Table, id: &str) -> Result<()>;

    /// Insert or merge on the `on_conflict` column
    async fn upsert(&self, table: Table, row: serde_json::Value, on_conflict: &str) -> Result<Entity>;
}

/// An open transport-level subscription
pub struct TransportSubscription {
    /// Transport-assigned id, passed back to `unsubscribe`
    pub id: String,
    /// Events in commit order. An `Err` item or the end of the stream means
    /// the connection was lost.
    pub events: BoxStream<'static, Result<ChangeEvent>>,
}

impl std::fmt::Debug for TransportSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Push channel for row changes
#[async_trait]
pub trait ChangeFeedTransport: Send + Sync {
    async fn subscribe(&self, topic: &Topic) -> Result<TransportSubscription>;
    async fn unsubscribe(&self, id: &str) -> Result<()>;
}

/// Source of the signed-in user
pub trait SessionProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;

    fn require_user_id(&self) -> Result<String> {
        self.current_user_id().ok_or(SyncError::NotAuthenticated)
    }
}

/// Fixed session, for tools and tests
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    user_id: Option<String>,
}

impl StaticSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    /// A session with nobody signed in
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }
}

impl SessionProvider for StaticSession {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

/// A retrieved passage backing an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaSource {
    pub content: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Answer from the document-QA service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaAnswer {
    pub answer: String,
    #[serde(default, alias = "results")]
    pub sources: Vec<QaSource>,
}

/// Document question answering
#[async_trait]
pub trait DocumentQa: Send + Sync {
    async fn ask(&self, question: &str) -> Result<QaAnswer>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_session() {
        assert_eq!(StaticSession::new("u1").require_user_id().unwrap(), "u1");
        assert_eq!(
            StaticSession::anonymous().require_user_id(),
            Err(SyncError::NotAuthenticated)
        );
    }

    #[test]
    fn test_qa_answer_accepts_results_field() {
        let raw = r#"{"answer":"42","results":[{"content":"doc","score":0.9,"metadata":{"file":"a.pdf"}}]}"#;
        let answer: QaAnswer = serde_json::from_str(raw).unwrap();
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].metadata["file"], "a.pdf");
    }
}
