//! TOML configuration for the link core and the daemon.
//!
//! Every section is optional; missing fields fall back to the defaults that
//! mirror the crate constants.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::feed::DEFAULT_HISTORY_CAPACITY;
use crate::policy::RunPolicy;
use crate::subscription::DEFAULT_BUFFER_CAPACITY;
use crate::types::ReconnectConfig;

/// Errors from reading or validating a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One remote server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub id: String,
    /// WebSocket endpoint, e.g. `wss://example.net/ws`.
    pub endpoint: String,
    /// OAuth token endpoint. Derived from `endpoint` when unset.
    pub token_url: Option<String>,
    pub policy: RunPolicy,
    pub enabled: bool,
    /// Network names (SSIDs) considered trusted by `WhenOnTrustedNetwork`.
    pub trusted_networks: Vec<String>,
    pub run_on_low_power: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            endpoint: String::new(),
            token_url: None,
            policy: RunPolicy::default(),
            enabled: true,
            trusted_networks: Vec::new(),
            run_on_low_power: true,
        }
    }
}

impl ServerConfig {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// The refresh endpoint: the configured one, or `/oauth/token` on the
    /// endpoint's origin with the scheme mapped `ws`→`http`, `wss`→`https`.
    pub fn token_url(&self) -> String {
        if let Some(url) = &self.token_url {
            return url.clone();
        }
        let (scheme, rest) = match self.endpoint.split_once("://") {
            Some(("wss", rest)) => ("https", rest),
            Some(("ws", rest)) => ("http", rest),
            Some((scheme, rest)) => (scheme, rest),
            None => ("https", self.endpoint.as_str()),
        };
        let authority = rest.split('/').next().unwrap_or(rest);
        format!("{scheme}://{authority}/oauth/token")
    }
}

/// Backoff settings as written in TOML (milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub error_after_failures: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let d = ReconnectConfig::default();
        Self {
            initial_delay_ms: d.initial_delay.as_millis() as u64,
            max_delay_ms: d.max_delay.as_millis() as u64,
            backoff_factor: d.backoff_factor,
            error_after_failures: d.error_after_failures,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(s: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            backoff_factor: s.backoff_factor,
            error_after_failures: s.error_after_failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Access tokens expiring within this many seconds are refreshed early.
    pub refresh_margin_secs: i64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// Per-subscription event buffer used while awaiting re-acknowledgement.
    pub buffer_capacity: usize,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub history_capacity: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    #[serde(rename = "server", alias = "servers")]
    pub servers: Vec<ServerConfig>,
    pub reconnect: ReconnectSettings,
    pub session: SessionSettings,
    pub subscriptions: SubscriptionSettings,
    pub feed: FeedSettings,
    /// Defaults to [`crate::credentials::default_credentials_path`].
    pub credentials_path: Option<PathBuf>,
    /// How often the daemon re-evaluates run policies.
    pub scheduler_interval_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            reconnect: ReconnectSettings::default(),
            session: SessionSettings::default(),
            subscriptions: SubscriptionSettings::default(),
            feed: FeedSettings::default(),
            credentials_path: None,
            scheduler_interval_secs: 30,
        }
    }
}

impl LinkConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), servers = config.servers.len(), "config loaded");
        Ok(config)
    }

    /// Server ids must be non-empty and unique; endpoints must be WebSocket
    /// URLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.id.is_empty() {
                return Err(ConfigError::Invalid("server with empty id".into()));
            }
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server id {:?}",
                    server.id
                )));
            }
            if !(server.endpoint.starts_with("ws://") || server.endpoint.starts_with("wss://")) {
                return Err(ConfigError::Invalid(format!(
                    "server {:?}: endpoint must be a ws:// or wss:// URL",
                    server.id
                )));
            }
        }
        if self.reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay_ms must be positive".into(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_delay_ms is below initial_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        (&self.reconnect).into()
    }

    pub fn refresh_margin(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::seconds(self.session.refresh_margin_secs.max(0))
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs.max(1))
    }
}

/// Default daemon config path: `<config dir>/tether/tetherd.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("tether").join("tetherd.toml"))
}

/// Per-user configuration directory.
pub(crate) fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME")
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".config"))
    }
}
