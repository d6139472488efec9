//! chatsync - Realtime Sync and Reconciliation Engine
//!
//! chatsync keeps locally cached views of a chat workspace (channel lists,
//! per-channel message lists, thread replies, reaction groups and a presence
//! roster) consistent with a remote store that pushes row changes over a
//! changefeed, while letting the client apply its own writes optimistically.
//!
//! # Module Structure
//!
//! - **`shared`** - Plain data shared by every component
//!   - Entities, changefeed events and topics, cache keys
//!   - Error types and configuration
//!
//! - **`client`** - The engine itself
//!   - `cache` - Versioned, reactive query cache
//!   - `feed` - Reconnecting changefeed connections
//!   - `subscription` - Refcounted topic subscriptions
//!   - `reconcile` - Routing change events onto cache keys
//!   - `optimistic` - Optimistic writes with rollback
//!   - `presence` - Heartbeat and roster expiry
//!   - `actions` - Chat operations built on the above
//!   - `http` - reqwest adapters for the remote store and the QA service
//!
//! - **`logging`** - tracing-subscriber setup (only with the `cli` feature)
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatsync::client::{SyncEngine, http::{RestClient, SseTransport}};
//! use chatsync::shared::{QueryKey, SyncConfig, Topic};
//!
//! # async fn example() -> chatsync::shared::Result<()> {
//! let config = SyncConfig::from_env()?;
//! let rest = Arc::new(RestClient::new(&config)?);
//! let feed = Arc::new(SseTransport::new(&config)?);
//! let engine = SyncEngine::new(config, rest.clone(), rest, feed);
//!
//! let _subscription = engine.subscribe(Topic::channel_messages("C1")).await;
//! let mut view = engine.use_query(QueryKey::messages("C1")).await;
//! while view.changed().await {
//!     println!("{} messages", view.data().map(|rows| rows.len()).unwrap_or(0));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! Inbound: changefeed → reconciliation → cache → views.
//! Outbound: action → optimistic patch on the cache → remote write →
//! confirmation or rollback.

/// Shared types and utilities
pub mod shared;

/// Sync engine components
pub mod client;

/// Logging setup for binaries
#[cfg(feature = "cli")]
pub mod logging;
