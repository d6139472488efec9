//! Cached Entities
//!
//! Row types mirrored from the remote store: channels, messages, reactions
//! and presence records. Column names follow the remote schema
//! (`user_id`, `channel_id`, `thread_id`, `type`, ...), so a row image from
//! the changefeed or a query response decodes straight into these types.
//!
//! Every entity exposes an [`Entity::identity`] used to deduplicate rows in
//! cached collections and a [`Entity::version_ts`] used to discard stale
//! change events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::shared::error::{Result, SyncError};

/// Remote tables the engine knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Group channels and direct-message channels
    Channels,
    /// Channel membership junction rows
    ChannelMembers,
    /// Messages and thread replies
    Messages,
    /// Emoji reactions on messages
    MessageReactions,
    /// Liveness records
    Presence,
    /// User display profiles
    Profiles,
}

impl Table {
    /// Table name on the remote store
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Channels => "channels",
            Table::ChannelMembers => "channel_members",
            Table::Messages => "messages",
            Table::MessageReactions => "message_reactions",
            Table::Presence => "presence",
            Table::Profiles => "profiles",
        }
    }

    /// Parse a remote table name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "channels" => Some(Table::Channels),
            "channel_members" => Some(Table::ChannelMembers),
            "messages" => Some(Table::Messages),
            "message_reactions" => Some(Table::MessageReactions),
            "presence" => Some(Table::Presence),
            "profiles" => Some(Table::Profiles),
            _ => None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display profile joined onto member and presence rows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MemberProfile {
    /// Display name
    pub username: String,
    /// Avatar URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture_url: Option<String>,
}

/// Kind of channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Named channel open to its members
    Group,
    /// Two-person conversation
    #[serde(alias = "dm")]
    Direct,
}

impl Default for ChannelKind {
    fn default() -> Self {
        ChannelKind::Group
    }
}

/// A channel row with its member set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ChannelKind,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// user id -> display profile
    #[serde(
        default,
        alias = "channel_members",
        deserialize_with = "deserialize_members",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub members: BTreeMap<String, MemberProfile>,
}

/// Tag describing what a message carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text
    Text,
    /// Reference to an uploaded file (`[File: name](path)`)
    FileRef,
    /// A question addressed to the document assistant
    QueryRequest,
    /// The assistant's answer
    #[serde(alias = "rag_response")]
    QueryResponse,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

/// Prefix that tags a message as a document question
pub const QUERY_PREFIX: &str = "/ask ";

impl MessageKind {
    /// Infer the tag from message content
    pub fn infer(content: &str) -> Self {
        if content.starts_with(QUERY_PREFIX) {
            MessageKind::QueryRequest
        } else if content.starts_with("[File: ") && content.contains("](") {
            MessageKind::FileRef
        } else {
            MessageKind::Text
        }
    }
}

/// A message row. A non-null `thread_id` marks a thread reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    #[serde(rename = "user_id")]
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

impl Message {
    /// Whether this message is a thread reply
    pub fn is_reply(&self) -> bool {
        self.thread_id.is_some()
    }
}

/// A reaction row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl Reaction {
    /// Identity of the (message, user, emoji) triple
    pub fn triple_identity(message_id: &str, user_id: &str, emoji: &str) -> String {
        format!("reaction:{}:{}:{}", message_id, user_id, emoji)
    }
}

/// Liveness status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Typing,
}

/// A presence row, keyed by user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(default, alias = "profiles", skip_serializing_if = "Option::is_none")]
    pub profile: Option<MemberProfile>,
}

impl PresenceRecord {
    /// Whether the record is live at `now` for the given window
    pub fn is_live(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        now - self.last_seen < window
    }
}

/// Any cached row
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Entity {
    Channel(Channel),
    Message(Message),
    Reaction(Reaction),
    Presence(PresenceRecord),
}

impl Entity {
    /// Decode a full row image belonging to `table`
    pub fn from_row(table: Table, row: &serde_json::Value) -> Result<Self> {
        let entity = match table {
            Table::Channels => Entity::Channel(serde_json::from_value(row.clone())?),
            Table::Messages => Entity::Message(serde_json::from_value(row.clone())?),
            Table::MessageReactions => Entity::Reaction(serde_json::from_value(row.clone())?),
            Table::Presence => Entity::Presence(serde_json::from_value(row.clone())?),
            Table::ChannelMembers | Table::Profiles => {
                return Err(SyncError::decode(format!(
                    "rows of '{}' are not cached directly",
                    table
                )))
            }
        };
        Ok(entity)
    }

    /// Encode as a row image
    pub fn to_row(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Table this entity lives in
    pub fn table(&self) -> Table {
        match self {
            Entity::Channel(_) => Table::Channels,
            Entity::Message(_) => Table::Messages,
            Entity::Reaction(_) => Table::MessageReactions,
            Entity::Presence(_) => Table::Presence,
        }
    }

    /// Primary key on the remote store
    pub fn id(&self) -> &str {
        match self {
            Entity::Channel(c) => &c.id,
            Entity::Message(m) => &m.id,
            Entity::Reaction(r) => &r.id,
            Entity::Presence(p) => &p.user_id,
        }
    }

    /// Identity used to deduplicate rows in a cached collection.
    ///
    /// Reactions are identified by their (message, user, emoji) triple so an
    /// optimistic row and the confirmed row can never both be present.
    pub fn identity(&self) -> String {
        match self {
            Entity::Reaction(r) => Reaction::triple_identity(&r.message_id, &r.user_id, &r.emoji),
            other => other.id().to_string(),
        }
    }

    /// Ordering timestamp
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Entity::Channel(c) => c.created_at,
            Entity::Message(m) => m.created_at,
            Entity::Reaction(r) => r.created_at,
            Entity::Presence(p) => p.last_seen,
        }
    }

    /// Row version used for stale-event detection
    pub fn version_ts(&self) -> DateTime<Utc> {
        match self {
            Entity::Channel(c) => c.updated_at.unwrap_or(c.created_at),
            Entity::Message(m) => m.updated_at.unwrap_or(m.created_at),
            Entity::Reaction(r) => r.created_at,
            Entity::Presence(p) => p.last_seen,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Entity::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_reaction(&self) -> Option<&Reaction> {
        match self {
            Entity::Reaction(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_presence(&self) -> Option<&PresenceRecord> {
        match self {
            Entity::Presence(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Channel> {
        match self {
            Entity::Channel(c) => Some(c),
            _ => None,
        }
    }
}

/// Sort rows by creation time, oldest first, with id as tie-break
pub fn sort_by_created(rows: &mut [Entity]) {
    rows.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.id().cmp(b.id()))
    });
}

/// Read a string column from a (possibly partial) row image
pub fn row_str<'a>(row: &'a serde_json::Value, column: &str) -> Option<&'a str> {
    row.get(column).and_then(|v| v.as_str())
}

/// Read a timestamp column from a (possibly partial) row image
pub fn row_ts(row: &serde_json::Value, column: &str) -> Option<DateTime<Utc>> {
    row_str(row, column)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Members arrive either as a map or as embedded `channel_members` rows
fn deserialize_members<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, MemberProfile>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct EmbeddedMember {
        user_id: String,
        #[serde(default)]
        profiles: Option<MemberProfile>,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Members {
        Map(BTreeMap<String, MemberProfile>),
        Rows(Vec<EmbeddedMember>),
    }

    let members = Option::<Members>::deserialize(deserializer)?;
    Ok(match members {
        None => BTreeMap::new(),
        Some(Members::Map(map)) => map,
        Some(Members::Rows(rows)) => rows
            .into_iter()
            .map(|m| (m.user_id, m.profiles.unwrap_or_default()))
            .collect(),
    })
}
