//! Shared Module
//!
//! Data types used by every component of the sync engine: cached entities,
//! changefeed events and topics, cache keys and query descriptions, errors,
//! and configuration.
//!
//! # Overview
//!
//! Nothing in this module performs I/O. All types are plain data that can
//! be cloned, compared and serialized, so they are safe to hand to readers
//! behind an `Arc`.

/// Cached row types
pub mod entity;

/// Changefeed events and topics
pub mod event;

/// Shared error types
pub mod error;

/// Cache keys and query descriptions
pub mod query;

/// Engine configuration
pub mod config;

/// Re-export commonly used types for convenience
pub use config::{BackoffConfig, ConfigError, PresenceConfig, SyncConfig, SyncConfigBuilder};
pub use entity::{
    Channel, ChannelKind, Entity, MemberProfile, Message, MessageKind, PresenceRecord,
    PresenceStatus, Reaction, Table,
};
pub use error::{Result, SyncError};
pub use event::{ChangeEvent, ChangeKind, Topic, TopicFilter};
pub use query::{Filter, Order, QueryKey, QuerySpec};
