//! Cache Keys and Query Descriptions
//!
//! A [`QueryKey`] identifies one cached result set. Each key knows the
//! [`QuerySpec`] that fills it through the external query API, which rows
//! belong to it, and which changefeed topics it is derived from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::shared::entity::{Entity, Table};
use crate::shared::event::Topic;

/// Identifier for a cached result set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueryKey {
    /// All channels visible to the user
    Channels,
    /// Messages in a channel; top-level only unless `include_replies`
    Messages {
        channel_id: String,
        include_replies: bool,
    },
    /// Replies in one thread
    Thread { thread_id: String },
    /// Reactions on one message
    Reactions { message_id: String },
    /// Presence roster
    Presence,
}

impl QueryKey {
    /// Top-level messages of a channel (the main message list)
    pub fn messages(channel_id: impl Into<String>) -> Self {
        QueryKey::Messages {
            channel_id: channel_id.into(),
            include_replies: false,
        }
    }

    /// Every message of a channel, replies included
    pub fn all_messages(channel_id: impl Into<String>) -> Self {
        QueryKey::Messages {
            channel_id: channel_id.into(),
            include_replies: true,
        }
    }

    pub fn thread(thread_id: impl Into<String>) -> Self {
        QueryKey::Thread {
            thread_id: thread_id.into(),
        }
    }

    pub fn reactions(message_id: impl Into<String>) -> Self {
        QueryKey::Reactions {
            message_id: message_id.into(),
        }
    }

    /// Ordered tuple form of the key
    pub fn parts(&self) -> Vec<String> {
        match self {
            QueryKey::Channels => vec!["channels".into()],
            QueryKey::Messages {
                channel_id,
                include_replies,
            } => vec![
                "messages".into(),
                channel_id.clone(),
                if *include_replies { "all" } else { "top" }.into(),
            ],
            QueryKey::Thread { thread_id } => vec!["thread".into(), thread_id.clone()],
            QueryKey::Reactions { message_id } => vec!["reactions".into(), message_id.clone()],
            QueryKey::Presence => vec!["presence".into()],
        }
    }

    /// Table the result rows come from
    pub fn table(&self) -> Table {
        match self {
            QueryKey::Channels => Table::Channels,
            QueryKey::Messages { .. } | QueryKey::Thread { .. } => Table::Messages,
            QueryKey::Reactions { .. } => Table::MessageReactions,
            QueryKey::Presence => Table::Presence,
        }
    }

    /// Small bounded sets kept in the cache even without consumers
    pub fn always_kept(&self) -> bool {
        matches!(self, QueryKey::Channels | QueryKey::Presence)
    }

    /// Whether `entity` belongs to this key's result set
    pub fn accepts(&self, entity: &Entity) -> bool {
        match (self, entity) {
            (QueryKey::Channels, Entity::Channel(_)) => true,
            (
                QueryKey::Messages {
                    channel_id,
                    include_replies,
                },
                Entity::Message(m),
            ) => &m.channel_id == channel_id && (*include_replies || m.thread_id.is_none()),
            (QueryKey::Thread { thread_id }, Entity::Message(m)) => {
                m.thread_id.as_deref() == Some(thread_id.as_str())
            }
            (QueryKey::Reactions { message_id }, Entity::Reaction(r)) => &r.message_id == message_id,
            (QueryKey::Presence, Entity::Presence(_)) => true,
            _ => false,
        }
    }

    /// Whether this key is fed by the given topic (used for resync)
    pub fn derived_from(&self, topic: &Topic) -> bool {
        match (self, topic.table) {
            (QueryKey::Channels, Table::Channels | Table::ChannelMembers | Table::Profiles) => true,
            (QueryKey::Presence, Table::Presence | Table::Profiles) => true,
            (QueryKey::Messages { channel_id, .. }, Table::Messages) => {
                match topic.filter_value("channel_id") {
                    Some(value) => value == channel_id,
                    None => topic.filter.is_none(),
                }
            }
            (QueryKey::Thread { thread_id }, Table::Messages) => {
                match topic.filter_value("thread_id") {
                    Some(value) => value == thread_id,
                    None => topic.filter.is_none(),
                }
            }
            (QueryKey::Reactions { message_id }, Table::MessageReactions) => {
                match topic.filter_value("message_id") {
                    Some(value) => value == message_id,
                    None => topic.filter.is_none(),
                }
            }
            _ => false,
        }
    }

    /// Query that fills this key
    pub fn to_query(&self, now: DateTime<Utc>, presence_window: chrono::Duration) -> QuerySpec {
        let created_asc = Some(Order::asc("created_at"));
        match self {
            QueryKey::Channels => QuerySpec {
                table: Table::Channels,
                filters: Vec::new(),
                order: created_asc,
            },
            QueryKey::Messages {
                channel_id,
                include_replies,
            } => {
                let mut filters = vec![Filter::Eq("channel_id".into(), channel_id.clone())];
                if !include_replies {
                    filters.push(Filter::IsNull("thread_id".into()));
                }
                QuerySpec {
                    table: Table::Messages,
                    filters,
                    order: created_asc,
                }
            }
            QueryKey::Thread { thread_id } => QuerySpec {
                table: Table::Messages,
                filters: vec![Filter::Eq("thread_id".into(), thread_id.clone())],
                order: created_asc,
            },
            QueryKey::Reactions { message_id } => QuerySpec {
                table: Table::MessageReactions,
                filters: vec![Filter::Eq("message_id".into(), message_id.clone())],
                order: created_asc,
            },
            QueryKey::Presence => QuerySpec {
                table: Table::Presence,
                filters: vec![Filter::Gt(
                    "last_seen".into(),
                    (now - presence_window).to_rfc3339(),
                )],
                order: None,
            },
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts().join(":"))
    }
}

/// Row filter understood by the query API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// `column = value`
    Eq(String, String),
    /// `column IS NULL`
    IsNull(String),
    /// `column > value`
    Gt(String, String),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _) | Filter::IsNull(c) | Filter::Gt(c, _) => c,
        }
    }
}

/// Result ordering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }
}

/// A filtered, ordered query against one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::entity::{Message, MessageKind};

    fn message(channel: &str, thread: Option<&str>) -> Entity {
        Entity::Message(Message {
            id: "m1".into(),
            channel_id: channel.into(),
            author_id: "u1".into(),
            content: "hi".into(),
            created_at: Utc::now(),
            updated_at: None,
            thread_id: thread.map(String::from),
            kind: MessageKind::Text,
        })
    }

    #[test]
    fn test_key_display() {
        assert_eq!(QueryKey::messages("C1").to_string(), "messages:C1:top");
        assert_eq!(QueryKey::all_messages("C1").to_string(), "messages:C1:all");
        assert_eq!(QueryKey::reactions("m1").to_string(), "reactions:m1");
    }

    #[test]
    fn test_accepts_thread_filter() {
        let top = message("C1", None);
        let reply = message("C1", Some("t1"));
        assert!(QueryKey::messages("C1").accepts(&top));
        assert!(!QueryKey::messages("C1").accepts(&reply));
        assert!(QueryKey::all_messages("C1").accepts(&reply));
        assert!(QueryKey::thread("t1").accepts(&reply));
        assert!(!QueryKey::messages("C2").accepts(&top));
    }

    #[test]
    fn test_derived_from_topic() {
        assert!(QueryKey::messages("C1").derived_from(&Topic::channel_messages("C1")));
        assert!(!QueryKey::messages("C2").derived_from(&Topic::channel_messages("C1")));
        assert!(QueryKey::thread("t1").derived_from(&Topic::thread("t1")));
        assert!(!QueryKey::thread("t1").derived_from(&Topic::channel_messages("C1")));
        assert!(QueryKey::Channels.derived_from(&Topic::profiles()));
        assert!(QueryKey::Presence.derived_from(&Topic::presence()));
    }

    #[test]
    fn test_top_level_query_excludes_replies() {
        let spec = QueryKey::messages("C1").to_query(Utc::now(), chrono::Duration::seconds(300));
        assert_eq!(spec.table, Table::Messages);
        assert!(spec.filters.contains(&Filter::IsNull("thread_id".into())));
        assert_eq!(spec.order, Some(Order::asc("created_at")));
    }

    #[test]
    fn test_presence_query_uses_window() {
        let now = Utc::now();
        let spec = QueryKey::Presence.to_query(now, chrono::Duration::seconds(300));
        match &spec.filters[0] {
            Filter::Gt(column, value) => {
                assert_eq!(column, "last_seen");
                assert_eq!(value, &(now - chrono::Duration::seconds(300)).to_rfc3339());
            }
            other => panic!("unexpected filter {:?}", other),
        }
    }
}
