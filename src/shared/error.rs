//! Sync Error Types
//!
//! This module defines the error taxonomy shared by every part of the sync
//! engine. Each variant carries a human-readable message so errors can be
//! stored in cached query state and cloned out to readers.
//!
//! # Error Categories
//!
//! - `Transport` - Changefeed disconnects (recovered internally by reconnect + resync)
//! - `Fetch` - Query failures (surfaced to the caller, stale data retained)
//! - `Mutation` - Remote write failures (optimistic state rolled back)
//! - `Conflict` - A write referenced a row that no longer exists
//! - `Decode` - A row image or payload could not be decoded
//! - `Config` - Invalid configuration
//! - `NotAuthenticated` - No session user for an operation that needs one
//!
//! # Usage
//!
//! ```rust
//! use chatsync::shared::error::SyncError;
//!
//! let error = SyncError::fetch("messages:C1:top", "connection refused");
//! assert!(error.to_string().contains("messages:C1:top"));
//! ```
//!
//! # Thread Safety
//!
//! All error types are `Send + Sync + Clone`.
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors produced by the sync engine and its collaborators
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Changefeed transport failure
    #[error("Transport error: {message}")]
    Transport {
        /// Human-readable error message
        message: String,
    },

    /// Query failure while filling or refreshing a cache key
    #[error("Fetch error for '{key}': {message}")]
    Fetch {
        /// Cache key (or table) being fetched
        key: String,
        /// Human-readable error message
        message: String,
    },

    /// Remote write failure
    #[error("Mutation error on '{entity}': {message}")]
    Mutation {
        /// Entity the mutation targeted
        entity: String,
        /// Human-readable error message
        message: String,
    },

    /// The write referenced an entity that is no longer present
    #[error("Conflict: '{entity}' is no longer present")]
    Conflict {
        /// Entity the write targeted
        entity: String,
    },

    /// Row or payload decoding error
    #[error("Decode error: {message}")]
    Decode {
        /// Human-readable error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable error message
        message: String,
    },

    /// Operation requires a signed-in user
    #[error("Not authenticated")]
    NotAuthenticated,
}

impl SyncError {
    /// Create a new transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a new fetch error
    pub fn fetch(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a new mutation error
    pub fn mutation(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Mutation {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create a new conflict error
    pub fn conflict(entity: impl Into<String>) -> Self {
        Self::Conflict {
            entity: entity.into(),
        }
    }

    /// Create a new decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the error is recovered internally rather than surfaced
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Whether the error is a conflict (treated as success for deletes)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::decode(err.to_string())
        } else {
            Self::transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error() {
        let error = SyncError::fetch("channels", "timeout");
        match error {
            SyncError::Fetch { key, message } => {
                assert_eq!(key, "channels");
                assert_eq!(message, "timeout");
            }
            _ => panic!("Expected Fetch"),
        }
    }

    #[test]
    fn test_error_display() {
        let error = SyncError::mutation("m1", "500 Internal Server Error");
        let display = format!("{}", error);
        assert!(display.contains("Mutation error"));
        assert!(display.contains("m1"));
    }

    #[test]
    fn test_transient_and_conflict() {
        assert!(SyncError::transport("reset").is_transient());
        assert!(!SyncError::fetch("k", "x").is_transient());
        assert!(SyncError::conflict("m1").is_conflict());
        assert!(!SyncError::NotAuthenticated.is_conflict());
    }

    #[test]
    fn test_from_serde_error() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let error: SyncError = result.unwrap_err().into();
        assert!(matches!(error, SyncError::Decode { .. }));
    }
}
