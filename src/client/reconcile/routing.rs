//! Static routing of change events onto cache keys.
//!
//! | table             | keys                                                    |
//! |-------------------|---------------------------------------------------------|
//! | `messages`        | top-level: `messages(c, top)` + `messages(c, all)`      |
//! |                   | reply: `thread(t)` + `messages(c, all)`                 |
//! | `message_reactions` | `reactions(m)`                                        |
//! | `channels`        | `channels()`                                            |
//! | `channel_members` | `channels()` (refetch, members are joined server-side)  |
//! | `presence`        | `presence()`                                            |
//! | `profiles`        | `presence()` + `channels()` (refetch)                   |
//!
//! Routing columns are read from the row image first and from the topic
//! filter second. When neither supplies them the event is routed to the
//! whole table family.

use serde_json::Value;

use crate::shared::entity::Table;
use crate::shared::event::{ChangeEvent, Topic};
use crate::shared::query::QueryKey;

/// Where an event lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Keys the event can be applied to directly
    Keys(Vec<QueryKey>),
    /// Keys whose rows are joined from the changed table; only a refetch helps
    Refetch(Vec<QueryKey>),
    /// Routing columns are missing; every cached key of the table is affected
    Family(Table),
}

/// Whether a message is a thread reply, as far as the event can tell
enum ThreadRef<'a> {
    TopLevel,
    Reply(&'a str),
    Unknown,
}

fn thread_ref<'a>(topic: &'a Topic, event: &'a ChangeEvent) -> ThreadRef<'a> {
    match event.row().and_then(|row| row.get("thread_id")) {
        Some(Value::String(thread_id)) => ThreadRef::Reply(thread_id),
        Some(Value::Null) => ThreadRef::TopLevel,
        _ => match topic.filter_value("thread_id") {
            Some(thread_id) => ThreadRef::Reply(thread_id),
            None => ThreadRef::Unknown,
        },
    }
}

fn routing_column<'a>(topic: &'a Topic, event: &'a ChangeEvent, column: &str) -> Option<&'a str> {
    event.column(column).or_else(|| topic.filter_value(column))
}

/// Route an event received on `topic`
pub fn route(topic: &Topic, event: &ChangeEvent) -> Route {
    match event.table {
        Table::Messages => {
            let channel = routing_column(topic, event, "channel_id");
            match (channel, thread_ref(topic, event)) {
                (Some(channel), ThreadRef::TopLevel) => Route::Keys(vec![
                    QueryKey::messages(channel),
                    QueryKey::all_messages(channel),
                ]),
                (Some(channel), ThreadRef::Reply(thread)) => Route::Keys(vec![
                    QueryKey::thread(thread),
                    QueryKey::all_messages(channel),
                ]),
                _ => Route::Family(Table::Messages),
            }
        }
        Table::MessageReactions => match routing_column(topic, event, "message_id") {
            Some(message) => Route::Keys(vec![QueryKey::reactions(message)]),
            None => Route::Family(Table::MessageReactions),
        },
        Table::Channels => Route::Keys(vec![QueryKey::Channels]),
        Table::ChannelMembers => Route::Refetch(vec![QueryKey::Channels]),
        Table::Presence => Route::Keys(vec![QueryKey::Presence]),
        Table::Profiles => Route::Refetch(vec![QueryKey::Presence, QueryKey::Channels]),
    }
}

/// The key a topic primarily feeds; an event for it with no cached entry
/// yet triggers a fetch
pub fn primary_key(topic: &Topic) -> Option<QueryKey> {
    match topic.table {
        Table::Messages => topic
            .filter_value("channel_id")
            .map(QueryKey::messages)
            .or_else(|| topic.filter_value("thread_id").map(QueryKey::thread)),
        Table::MessageReactions => topic.filter_value("message_id").map(QueryKey::reactions),
        Table::Channels | Table::ChannelMembers => Some(QueryKey::Channels),
        Table::Presence => Some(QueryKey::Presence),
        Table::Profiles => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn message_event(row: Value) -> ChangeEvent {
        ChangeEvent {
            kind: crate::shared::event::ChangeKind::Insert,
            table: Table::Messages,
            before: None,
            after: Some(row),
            commit_timestamp: None,
        }
    }

    #[test]
    fn test_top_level_message_routes_to_channel_lists() {
        let event = message_event(json!({"id": "m1", "channel_id": "C1", "thread_id": null}));
        assert_eq!(
            route(&Topic::channel_messages("C1"), &event),
            Route::Keys(vec![QueryKey::messages("C1"), QueryKey::all_messages("C1")])
        );
    }

    #[test]
    fn test_reply_routes_to_thread() {
        let event = message_event(json!({"id": "m2", "channel_id": "C1", "thread_id": "m1"}));
        assert_eq!(
            route(&Topic::channel_messages("C1"), &event),
            Route::Keys(vec![QueryKey::thread("m1"), QueryKey::all_messages("C1")])
        );
    }

    #[test]
    fn test_partial_delete_uses_topic_filter() {
        let event = ChangeEvent::delete(Table::MessageReactions, json!({"id": "r1"}));
        assert_eq!(
            route(&Topic::reactions("m1"), &event),
            Route::Keys(vec![QueryKey::reactions("m1")])
        );

        let event = ChangeEvent::delete(Table::Messages, json!({"id": "m1"}));
        assert_eq!(
            route(&Topic::channel_messages("C1"), &event),
            Route::Family(Table::Messages)
        );
    }

    #[test]
    fn test_profiles_refetch_joined_keys() {
        let event = ChangeEvent::delete(Table::Profiles, json!({"id": "u1"}));
        assert_eq!(
            route(&Topic::profiles(), &event),
            Route::Refetch(vec![QueryKey::Presence, QueryKey::Channels])
        );
    }

    #[test]
    fn test_primary_keys() {
        assert_eq!(primary_key(&Topic::channel_messages("C1")), Some(QueryKey::messages("C1")));
        assert_eq!(primary_key(&Topic::thread("t1")), Some(QueryKey::thread("t1")));
        assert_eq!(primary_key(&Topic::channel_members()), Some(QueryKey::Channels));
        assert_eq!(primary_key(&Topic::profiles()), None);
    }
}
