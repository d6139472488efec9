//! Sync engine configuration
//!
//! Configuration is assembled from three layers, later layers winning:
//! built-in defaults, an optional TOML file, and `CHATSYNC_*` environment
//! variables. [`SyncConfigBuilder`] validates the result.
//!
//! ```toml
//! api_url = "https://db.example.com"
//! api_key = "anon-key"
//! qa_url = "http://localhost:8000"
//!
//! [presence]
//! window_secs = 300
//! heartbeat_secs = 30
//! poll_secs = 30
//!
//! [reconnect]
//! base_ms = 1000
//! cap_ms = 30000
//! jitter = 0.2
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::shared::error::SyncError;

/// Default remote store URL
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:54321";

/// Default document-QA service URL
pub const DEFAULT_QA_URL: &str = "http://localhost:8000";

/// Reconnect backoff settings
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// First retry delay
    pub base: Duration,
    /// Upper bound for any delay
    pub cap: Duration,
    /// Relative jitter, applied as ±`jitter`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Presence timing settings
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceConfig {
    /// Records older than this are not live
    pub window: Duration,
    /// Interval between local heartbeats
    pub heartbeat_interval: Duration,
    /// Interval between roster refetches
    pub poll_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub qa_url: String,
    /// Number of sources requested from the document-QA service
    pub qa_top_k: usize,
    pub presence: PresenceConfig,
    pub reconnect: BackoffConfig,
    /// Buffer size between a feed connection and its dispatcher
    pub feed_channel_capacity: usize,
    /// Fixed session user, used when no auth provider is wired in
    pub user_id: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            qa_url: DEFAULT_QA_URL.to_string(),
            qa_top_k: 4,
            presence: PresenceConfig::default(),
            reconnect: BackoffConfig::default(),
            feed_channel_capacity: 256,
            user_id: None,
        }
    }
}

impl SyncConfig {
    /// Create a new builder seeded with defaults
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder().with_env().build()
    }

    /// Load from `path` (or the default config file if present), then
    /// apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        let path = path.map(Path::to_path_buf).or_else(|| {
            default_config_path().filter(|p| p.exists())
        });
        if let Some(path) = path {
            tracing::info!("[Config] Loading {}", path.display());
            let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
                path: path.clone(),
                message: e.to_string(),
            })?;
            builder = builder.with_toml(&raw)?;
        }
        builder.with_env().build()
    }

    /// Build a URL under the remote store
    pub fn api_endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), path)
    }

    /// Build a URL under the document-QA service
    pub fn qa_endpoint(&self, path: &str) -> String {
        format!("{}{}", self.qa_url.trim_end_matches('/'), path)
    }

    /// Presence window as a chrono duration
    pub fn presence_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.presence.window).unwrap_or_else(|_| chrono::Duration::seconds(300))
    }
}

/// Default config file location (`<config dir>/chatsync/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chatsync").join("config.toml"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api_url: Option<String>,
    api_key: Option<String>,
    qa_url: Option<String>,
    qa_top_k: Option<usize>,
    feed_channel_capacity: Option<usize>,
    user_id: Option<String>,
    presence: Option<FilePresence>,
    reconnect: Option<FileReconnect>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePresence {
    window_secs: Option<u64>,
    heartbeat_secs: Option<u64>,
    poll_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileReconnect {
    base_ms: Option<u64>,
    cap_ms: Option<u64>,
    jitter: Option<f64>,
}

/// Builder for SyncConfig
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    /// Set the remote store URL
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    /// Set the API key sent with every request
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    /// Set the document-QA service URL
    pub fn qa_url(mut self, url: impl Into<String>) -> Self {
        self.config.qa_url = url.into();
        self
    }

    pub fn qa_top_k(mut self, k: usize) -> Self {
        self.config.qa_top_k = k;
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.config.user_id = Some(user_id.into());
        self
    }

    pub fn presence(mut self, presence: PresenceConfig) -> Self {
        self.config.presence = presence;
        self
    }

    pub fn reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn feed_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.feed_channel_capacity = capacity;
        self
    }

    /// Merge values from a TOML document
    pub fn with_toml(mut self, raw: &str) -> Result<Self, ConfigError> {
        let file: FileConfig =
            toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let c = &mut self.config;
        if let Some(v) = file.api_url {
            c.api_url = v;
        }
        if let Some(v) = file.api_key {
            c.api_key = Some(v);
        }
        if let Some(v) = file.qa_url {
            c.qa_url = v;
        }
        if let Some(v) = file.qa_top_k {
            c.qa_top_k = v;
        }
        if let Some(v) = file.feed_channel_capacity {
            c.feed_channel_capacity = v;
        }
        if let Some(v) = file.user_id {
            c.user_id = Some(v);
        }
        if let Some(p) = file.presence {
            if let Some(v) = p.window_secs {
                c.presence.window = Duration::from_secs(v);
            }
            if let Some(v) = p.heartbeat_secs {
                c.presence.heartbeat_interval = Duration::from_secs(v);
            }
            if let Some(v) = p.poll_secs {
                c.presence.poll_interval = Duration::from_secs(v);
            }
        }
        if let Some(r) = file.reconnect {
            if let Some(v) = r.base_ms {
                c.reconnect.base = Duration::from_millis(v);
            }
            if let Some(v) = r.cap_ms {
                c.reconnect.cap = Duration::from_millis(v);
            }
            if let Some(v) = r.jitter {
                c.reconnect.jitter = v;
            }
        }
        Ok(self)
    }

    /// Apply `CHATSYNC_*` environment overrides
    pub fn with_env(mut self) -> Self {
        if let Ok(v) = std::env::var("CHATSYNC_API_URL") {
            self.config.api_url = v;
        }
        if let Ok(v) = std::env::var("CHATSYNC_API_KEY") {
            self.config.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("CHATSYNC_QA_URL") {
            self.config.qa_url = v;
        }
        if let Ok(v) = std::env::var("CHATSYNC_USER_ID") {
            self.config.user_id = Some(v);
        }
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<SyncConfig, ConfigError> {
        let c = self.config;
        for url in [&c.api_url, &c.qa_url] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidUrl(url.clone()));
            }
        }
        if c.presence.window.is_zero()
            || c.presence.heartbeat_interval.is_zero()
            || c.presence.poll_interval.is_zero()
        {
            return Err(ConfigError::invalid("presence", "intervals must be non-zero"));
        }
        if c.presence.heartbeat_interval >= c.presence.window {
            return Err(ConfigError::invalid(
                "presence.heartbeat_secs",
                "heartbeat must be shorter than the presence window",
            ));
        }
        if c.reconnect.base.is_zero() || c.reconnect.base > c.reconnect.cap {
            return Err(ConfigError::invalid(
                "reconnect",
                "base must be non-zero and not exceed cap",
            ));
        }
        if !(0.0..1.0).contains(&c.reconnect.jitter) {
            return Err(ConfigError::invalid("reconnect.jitter", "must be in [0, 1)"));
        }
        if c.feed_channel_capacity == 0 || c.qa_top_k == 0 {
            return Err(ConfigError::MissingValue("feed_channel_capacity / qa_top_k"));
        }
        Ok(c)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("failed to read {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::config(err.to_string())
    }
}
