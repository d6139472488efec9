//! Changefeed Events and Topics
//!
//! A [`Topic`] names a logical subscription target: a table plus an optional
//! equality filter. The changefeed delivers [`ChangeEvent`]s for rows that
//! match the topic, each tagged insert/update/delete and carrying the row
//! image before and/or after the change.
//!
//! # Wire Shape
//!
//! ```json
//! {"kind":"insert","table":"messages","after":{"id":"m1","channel_id":"C1",...}}
//! {"kind":"delete","table":"message_reactions","before":{"id":"r1"}}
//! ```
//!
//! Delete events may carry only the primary key in `before`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::shared::entity::{row_str, row_ts, Entity, Table};
use crate::shared::error::Result;

/// Equality filter applied to a topic (`column=eq.value`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicFilter {
    pub column: String,
    pub value: String,
}

impl TopicFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Parse the `column=eq.value` form
    pub fn parse(raw: &str) -> Option<Self> {
        let (column, rest) = raw.split_once('=')?;
        let value = rest.strip_prefix("eq.")?;
        if column.is_empty() || value.is_empty() {
            return None;
        }
        Some(Self::eq(column, value))
    }

    /// Whether a (possibly partial) row satisfies the filter.
    ///
    /// A row missing the column is treated as matching, since delete
    /// images often carry only the primary key.
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        match row.get(&self.column) {
            None => true,
            Some(serde_json::Value::String(s)) => s == &self.value,
            Some(_) => false,
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// A (table, filter) subscription target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic {
    pub table: Table,
    pub filter: Option<TopicFilter>,
}

impl Topic {
    pub fn new(table: Table, filter: Option<TopicFilter>) -> Self {
        Self { table, filter }
    }

    /// All channel changes
    pub fn channels() -> Self {
        Self::new(Table::Channels, None)
    }

    /// Membership changes
    pub fn channel_members() -> Self {
        Self::new(Table::ChannelMembers, None)
    }

    /// Messages (top-level and replies) in one channel
    pub fn channel_messages(channel_id: impl Into<String>) -> Self {
        Self::new(Table::Messages, Some(TopicFilter::eq("channel_id", channel_id)))
    }

    /// Replies in one thread
    pub fn thread(thread_id: impl Into<String>) -> Self {
        Self::new(Table::Messages, Some(TopicFilter::eq("thread_id", thread_id)))
    }

    /// Reactions on one message
    pub fn reactions(message_id: impl Into<String>) -> Self {
        Self::new(
            Table::MessageReactions,
            Some(TopicFilter::eq("message_id", message_id)),
        )
    }

    /// All presence changes
    pub fn presence() -> Self {
        Self::new(Table::Presence, None)
    }

    /// All profile changes
    pub fn profiles() -> Self {
        Self::new(Table::Profiles, None)
    }

    /// Value of the filter for `column`, if the topic filters on it
    pub fn filter_value(&self, column: &str) -> Option<&str> {
        self.filter
            .as_ref()
            .filter(|f| f.column == column)
            .map(|f| f.value.as_str())
    }

    /// Whether an event belongs to this topic
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        match (&self.filter, event.row()) {
            (None, _) => true,
            (Some(filter), Some(row)) => filter.matches(row),
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{}({})", self.table, filter),
            None => write!(f, "{}()", self.table),
        }
    }
}

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
}

/// A row-level change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Table,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    /// Server commit time, when the transport provides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    /// Insert event carrying a full row image
    pub fn insert(entity: &Entity) -> Result<Self> {
        Ok(Self {
            kind: ChangeKind::Insert,
            table: entity.table(),
            before: None,
            after: Some(entity.to_row()?),
            commit_timestamp: None,
        })
    }

    /// Update event carrying a full row image
    pub fn update(entity: &Entity) -> Result<Self> {
        Ok(Self {
            kind: ChangeKind::Update,
            table: entity.table(),
            before: None,
            after: Some(entity.to_row()?),
            commit_timestamp: None,
        })
    }

    /// Delete event with an arbitrary (possibly partial) before image
    pub fn delete(table: Table, before: serde_json::Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table,
            before: Some(before),
            after: None,
            commit_timestamp: None,
        }
    }

    pub fn with_commit_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.commit_timestamp = Some(ts);
        self
    }

    /// The most informative row image: `after` for inserts/updates,
    /// `before` for deletes
    pub fn row(&self) -> Option<&serde_json::Value> {
        match self.kind {
            ChangeKind::Delete => self.before.as_ref().or(self.after.as_ref()),
            _ => self.after.as_ref().or(self.before.as_ref()),
        }
    }

    /// Decode the row image into a full entity, if it is complete
    pub fn entity(&self) -> Option<Entity> {
        self.row().and_then(|row| Entity::from_row(self.table, row).ok())
    }

    /// Primary key of the changed row
    pub fn row_id(&self) -> Option<&str> {
        let row = self.row()?;
        match self.table {
            Table::Presence => row_str(row, "user_id").or_else(|| row_str(row, "id")),
            _ => row_str(row, "id"),
        }
    }

    /// String column of the row image
    pub fn column(&self, name: &str) -> Option<&str> {
        self.row().and_then(|row| row_str(row, name))
    }

    /// Timestamp that orders this event against previously applied ones
    pub fn row_timestamp(&self) -> Option<DateTime<Utc>> {
        if let Some(entity) = self.entity() {
            return Some(entity.version_ts());
        }
        self.commit_timestamp.or_else(|| {
            self.row().and_then(|row| {
                row_ts(row, "updated_at").or_else(|| row_ts(row, "created_at"))
            })
        })
    }
}
