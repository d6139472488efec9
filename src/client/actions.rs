//! Chat Actions
//!
//! User-facing writes built on the optimistic coordinator. Row ids are
//! generated client-side, so the optimistic row and the row confirmed by
//! the changefeed share an id and reconcile by identity.
//!
//! A message starting with `/ask ` is tagged as a document question. After
//! it is stored, the question goes to the document-QA service and the
//! answer is posted into the same channel as a `query_response` message
//! from the assistant user.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::client::api::{DocumentQa, QaAnswer, SessionProvider, WriteApi};
use crate::client::optimistic::{
    EntityGuard, LocalPatch, MutationKind, MutationOutcome, OptimisticMutationCoordinator,
};
use crate::client::reconcile::ReconciliationEngine;
use crate::shared::entity::{
    Channel, ChannelKind, Entity, MemberProfile, Message, MessageKind, Reaction, Table, QUERY_PREFIX,
};
use crate::shared::error::{Result, SyncError};
use crate::shared::query::QueryKey;

/// User id the document assistant posts as
pub const ASSISTANT_USER_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Display name of the document assistant
pub const ASSISTANT_USERNAME: &str = "AI Assistant";

/// Result of toggling a reaction
#[derive(Debug, Clone, PartialEq)]
pub enum ToggleOutcome {
    Added(Reaction),
    Removed,
}

/// Cache keys a message appears in
pub fn message_keys(message: &Message) -> Vec<QueryKey> {
    match &message.thread_id {
        Some(thread_id) => vec![
            QueryKey::thread(thread_id.clone()),
            QueryKey::all_messages(message.channel_id.clone()),
        ],
        None => vec![
            QueryKey::messages(message.channel_id.clone()),
            QueryKey::all_messages(message.channel_id.clone()),
        ],
    }
}

/// Render an answer and the passages it was drawn from
pub fn format_answer(answer: &QaAnswer) -> String {
    let mut content = answer.answer.trim().to_string();
    if !answer.sources.is_empty() {
        content.push_str("\n\nSources:");
        for source in &answer.sources {
            let label = source
                .metadata
                .get("source")
                .or_else(|| source.metadata.get("file_name"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| source.content.chars().take(80).collect());
            content.push_str(&format!("\n- {} ({:.2})", label, source.score));
        }
    }
    content
}

fn expect_message(entity: Entity) -> Result<Message> {
    match entity {
        Entity::Message(message) => Ok(message),
        other => Err(SyncError::decode(format!(
            "expected a message row, got {}",
            other.table()
        ))),
    }
}

/// Chat operations for one session
#[derive(Clone)]
pub struct ChatActions {
    coordinator: Arc<OptimisticMutationCoordinator>,
    reconciler: Arc<ReconciliationEngine>,
    write: Arc<dyn WriteApi>,
    session: Arc<dyn SessionProvider>,
    qa: Option<Arc<dyn DocumentQa>>,
}

impl std::fmt::Debug for ChatActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatActions")
            .field("user", &self.session.current_user_id())
            .field("qa", &self.qa.is_some())
            .finish()
    }
}

impl ChatActions {
    pub fn new(
        coordinator: Arc<OptimisticMutationCoordinator>,
        reconciler: Arc<ReconciliationEngine>,
        write: Arc<dyn WriteApi>,
        session: Arc<dyn SessionProvider>,
        qa: Option<Arc<dyn DocumentQa>>,
    ) -> Self {
        Self {
            coordinator,
            reconciler,
            write,
            session,
            qa,
        }
    }

    /// Post a top-level message
    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<Message> {
        let author = self.session.require_user_id()?;
        let message = self.post(channel_id, None, &author, content, MessageKind::infer(content)).await?;
        if message.kind == MessageKind::QueryRequest {
            self.answer_question(&message).await;
        }
        Ok(message)
    }

    /// Post a reply in the thread rooted at `thread_id`
    pub async fn send_reply(&self, channel_id: &str, thread_id: &str, content: &str) -> Result<Message> {
        let author = self.session.require_user_id()?;
        self.post(channel_id, Some(thread_id), &author, content, MessageKind::infer(content))
            .await
    }

    async fn post(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
        author: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::mutation(channel_id, "message is empty"));
        }
        let message = Message {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            author_id: author.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            updated_at: None,
            thread_id: thread_id.map(str::to_string),
            kind,
        };
        let entity = Entity::Message(message.clone());
        let patch = message_keys(&message)
            .into_iter()
            .fold(LocalPatch::new(), |patch, key| patch.upsert(key, entity.clone()));
        let row = entity.to_row()?;

        let outcome = self
            .coordinator
            .mutate(&message.id, MutationKind::Insert, patch, || {
                self.write.insert(Table::Messages, row)
            })
            .await?;
        match outcome {
            MutationOutcome::Confirmed(stored) => expect_message(stored),
            MutationOutcome::AlreadyApplied => Ok(message),
        }
    }

    /// Ask the document-QA service and post its answer. Failures are posted
    /// as a short notice instead of an answer.
    async fn answer_question(&self, request: &Message) {
        let Some(qa) = self.qa.as_ref() else {
            tracing::debug!("[Mutation] No document-QA service, leaving {} unanswered", request.id);
            return;
        };
        let question = request.content.trim_start_matches(QUERY_PREFIX).trim();
        let content = match qa.ask(question).await {
            Ok(answer) => format_answer(&answer),
            Err(e) => {
                tracing::warn!("[Mutation] Document question {} failed: {}", request.id, e);
                "Sorry, I couldn't answer that right now.".to_string()
            }
        };
        if let Err(e) = self
            .post(
                &request.channel_id,
                request.thread_id.as_deref(),
                ASSISTANT_USER_ID,
                &content,
                MessageKind::QueryResponse,
            )
            .await
        {
            tracing::warn!("[Mutation] Posting answer to {} failed: {}", request.id, e);
        }
    }

    /// Delete one of the user's own messages. Deleting a message that is
    /// already gone succeeds.
    pub async fn delete_message(&self, message: &Message) -> Result<()> {
        let user = self.session.require_user_id()?;
        if message.author_id != user {
            return Err(SyncError::mutation(
                message.id.clone(),
                "only the author can delete a message",
            ));
        }
        let patch = message_keys(message)
            .into_iter()
            .fold(LocalPatch::new(), |patch, key| patch.remove(key, message.id.clone()));
        self.coordinator
            .mutate(&message.id, MutationKind::Delete, patch, || {
                self.write.delete(Table::Messages, &message.id)
            })
            .await?;
        Ok(())
    }

    /// The user's (message, emoji) reaction as the cache knows it. A
    /// reactions key that was never filled is fetched first, so a reaction
    /// stored only on the server is not mistaken for an absent one.
    async fn current_reaction(
        &self,
        message_id: &str,
        user: &str,
        emoji: &str,
    ) -> Result<Option<Reaction>> {
        let identity = Reaction::triple_identity(message_id, user, emoji);
        let rows = self
            .reconciler
            .ensure_fetched(&QueryKey::reactions(message_id))
            .await?;
        Ok(rows
            .iter()
            .filter_map(Entity::as_reaction)
            .find(|r| Reaction::triple_identity(&r.message_id, &r.user_id, &r.emoji) == identity)
            .cloned())
    }

    /// React to a message. Reacting twice with the same emoji is a no-op.
    pub async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<Reaction> {
        let user = self.session.require_user_id()?;
        let guard = self
            .coordinator
            .lock_entity(&Reaction::triple_identity(message_id, &user, emoji))
            .await;
        if let Some(existing) = self.current_reaction(message_id, &user, emoji).await? {
            return Ok(existing);
        }
        self.add_locked(&guard, message_id, &user, emoji).await
    }

    /// Withdraw a reaction. Removing a reaction that is not there is a no-op.
    pub async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        let user = self.session.require_user_id()?;
        let guard = self
            .coordinator
            .lock_entity(&Reaction::triple_identity(message_id, &user, emoji))
            .await;
        match self.current_reaction(message_id, &user, emoji).await? {
            Some(existing) => self.remove_locked(&guard, existing).await,
            None => Ok(()),
        }
    }

    /// Add the reaction if absent, remove it if present. The check and the
    /// write happen under one entity lock.
    pub async fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Result<ToggleOutcome> {
        let user = self.session.require_user_id()?;
        let guard = self
            .coordinator
            .lock_entity(&Reaction::triple_identity(message_id, &user, emoji))
            .await;
        match self.current_reaction(message_id, &user, emoji).await? {
            Some(existing) => {
                self.remove_locked(&guard, existing).await?;
                Ok(ToggleOutcome::Removed)
            }
            None => self
                .add_locked(&guard, message_id, &user, emoji)
                .await
                .map(ToggleOutcome::Added),
        }
    }

    async fn add_locked(
        &self,
        guard: &EntityGuard,
        message_id: &str,
        user: &str,
        emoji: &str,
    ) -> Result<Reaction> {
        let reaction = Reaction {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            user_id: user.to_string(),
            emoji: emoji.to_string(),
            created_at: Utc::now(),
        };
        let entity = Entity::Reaction(reaction.clone());
        let row = entity.to_row()?;
        let patch = LocalPatch::new().upsert(QueryKey::reactions(message_id), entity);
        let outcome = self
            .coordinator
            .run_locked(guard, MutationKind::Insert, patch, || {
                self.write.insert(Table::MessageReactions, row)
            })
            .await?;
        match outcome {
            MutationOutcome::Confirmed(Entity::Reaction(stored)) => Ok(stored),
            _ => Ok(reaction),
        }
    }

    async fn remove_locked(&self, guard: &EntityGuard, existing: Reaction) -> Result<()> {
        let identity = Entity::Reaction(existing.clone()).identity();
        let patch = LocalPatch::new().remove(QueryKey::reactions(&existing.message_id), identity);
        self.coordinator
            .run_locked(guard, MutationKind::Delete, patch, || {
                self.write.delete(Table::MessageReactions, &existing.id)
            })
            .await?;
        Ok(())
    }

    /// Create a channel with the current user and `member_ids` as members
    pub async fn create_channel(
        &self,
        name: &str,
        kind: ChannelKind,
        member_ids: &[String],
    ) -> Result<Channel> {
        let creator = self.session.require_user_id()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::mutation("channel", "channel name is empty"));
        }
        let mut members: Vec<String> = vec![creator.clone()];
        for id in member_ids {
            if !members.contains(id) {
                members.push(id.clone());
            }
        }
        if kind == ChannelKind::Direct && members.len() != 2 {
            return Err(SyncError::mutation(
                name,
                "a direct channel has exactly two members",
            ));
        }

        let channel = Channel {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind,
            created_by: creator,
            created_at: Utc::now(),
            updated_at: None,
            members: members
                .iter()
                .map(|id| (id.clone(), MemberProfile::default()))
                .collect(),
        };
        let row = serde_json::json!({
            "id": channel.id,
            "name": channel.name,
            "type": channel.kind,
            "created_by": channel.created_by,
            "created_at": channel.created_at.to_rfc3339(),
        });
        let member_rows: Vec<serde_json::Value> = members
            .iter()
            .map(|user_id| serde_json::json!({ "channel_id": channel.id, "user_id": user_id }))
            .collect();
        let patch = LocalPatch::new().upsert(QueryKey::Channels, Entity::Channel(channel.clone()));

        let outcome = self
            .coordinator
            .mutate(&channel.id, MutationKind::Insert, patch, || async {
                let stored = self.write.insert(Table::Channels, row).await?;
                self.write.insert_rows(Table::ChannelMembers, member_rows).await?;
                Ok::<Entity, SyncError>(stored)
            })
            .await?;
        match outcome {
            MutationOutcome::Confirmed(Entity::Channel(mut stored)) => {
                if stored.members.is_empty() {
                    stored.members = channel.members;
                }
                Ok(stored)
            }
            _ => Ok(channel),
        }
    }
}
