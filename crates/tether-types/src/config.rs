//! Agent configuration, loaded from `tether.toml`.
//!
//! Only the server URL and the agent credentials are mandatory; every other
//! field falls back to a default tuned for long outages (a queue large enough
//! for an hour of ~10 entries/second, five retries, 5s..60s reconnect
//! backoff).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::TetherError;

/// Default location of the agent configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tether/tether.toml";

/// Maximum config file size in bytes. Anything larger is rejected outright.
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Environment variable overriding `server.url`.
pub const ENV_SERVER_URL: &str = "TETHER_SERVER_URL";
/// Environment variable overriding `server.id`.
pub const ENV_SERVER_ID: &str = "TETHER_SERVER_ID";
/// Environment variable overriding `server.key`.
pub const ENV_SERVER_KEY: &str = "TETHER_SERVER_KEY";

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Management plane endpoint and credentials.
    pub server: ServerConfig,
    /// Outbound delivery queue and reporter pool settings.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Control channel (websocket backhaul) settings.
    #[serde(default)]
    pub control: ControlConfig,
}

/// Where the management plane lives and how to authenticate against it.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the management plane, e.g. `https://console.example.com`.
    pub url: String,
    /// Agent identifier sent in the `Authorization` header.
    pub id: String,
    /// Agent secret sent in the `Authorization` header.
    ///
    /// Never logged.
    pub key: String,
    /// Optional PEM bundle with an additional trusted root.
    #[serde(default)]
    pub ca_certificate: Option<PathBuf>,
    /// Whether to verify the server certificate chain and hostname.
    #[serde(default = "default_true")]
    pub verify_certificate: bool,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("url", &self.url)
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .field("ca_certificate", &self.ca_certificate)
            .field("verify_certificate", &self.verify_certificate)
            .finish()
    }
}

/// Delivery queue and reporter pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Number of concurrent reporter workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-call HTTP timeout applied when a request does not carry its own.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Delivery attempts per request before it is dropped.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Maximum number of pending requests held in memory.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How often the binary logs reporter statistics (0 disables).
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            request_timeout_secs: default_request_timeout_secs(),
            retry_limit: default_retry_limit(),
            queue_capacity: default_queue_capacity(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl DeliveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Control channel tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlConfig {
    /// Path of the backhaul websocket endpoint, appended to the server URL.
    #[serde(default = "default_backhaul_path")]
    pub backhaul_path: String,
    /// First reconnect delay.
    #[serde(default = "default_reconnect_initial_secs")]
    pub reconnect_initial_secs: u64,
    /// Upper bound for the reconnect delay.
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// Wall-clock limit for a single shell command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            backhaul_path: default_backhaul_path(),
            reconnect_initial_secs: default_reconnect_initial_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl ControlConfig {
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_secs(self.reconnect_initial_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_retry_limit() -> u32 {
    5
}

fn default_queue_capacity() -> usize {
    // 10 entries per second for one hour.
    10 * 60 * 60
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_backhaul_path() -> String {
    "/ws/servers/backhaul/".to_string()
}

fn default_reconnect_initial_secs() -> u64 {
    5
}

fn default_reconnect_max_secs() -> u64 {
    60
}

fn default_command_timeout_secs() -> u64 {
    600
}

impl AgentConfig {
    /// Load, apply environment overrides, and validate a config file.
    pub fn load(path: &Path) -> Result<Self, TetherError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without environment overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self, TetherError> {
        let meta = std::fs::metadata(path).map_err(|source| TetherError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if meta.len() > MAX_CONFIG_FILE_SIZE {
            return Err(TetherError::TooLarge {
                path: path.to_path_buf(),
                size: meta.len(),
                limit: MAX_CONFIG_FILE_SIZE,
            });
        }

        let content = std::fs::read_to_string(path).map_err(|source| TetherError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| TetherError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override server fields from `TETHER_SERVER_*` variables.
    ///
    /// `lookup` is injected so tests do not have to touch the process
    /// environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SERVER_URL) {
            self.server.url = url;
        }
        if let Some(id) = lookup(ENV_SERVER_ID) {
            self.server.id = id;
        }
        if let Some(key) = lookup(ENV_SERVER_KEY) {
            self.server.key = key;
        }
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<(), TetherError> {
        let url = Url::parse(&self.server.url)
            .map_err(|e| TetherError::Invalid(format!("server.url {:?}: {e}", self.server.url)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(TetherError::Invalid(format!(
                "server.url must use http or https, got {:?}",
                url.scheme()
            )));
        }
        if self.server.id.trim().is_empty() {
            return Err(TetherError::Invalid("server.id must not be empty".into()));
        }
        if self.server.key.trim().is_empty() {
            return Err(TetherError::Invalid("server.key must not be empty".into()));
        }

        let d = &self.delivery;
        if d.workers == 0 {
            return Err(TetherError::Invalid("delivery.workers must be at least 1".into()));
        }
        if d.queue_capacity == 0 {
            return Err(TetherError::Invalid(
                "delivery.queue_capacity must be at least 1".into(),
            ));
        }
        if d.request_timeout_secs == 0 {
            return Err(TetherError::Invalid(
                "delivery.request_timeout_secs must be at least 1".into(),
            ));
        }
        // 2^retry_limit seconds must stay representable.
        if d.retry_limit == 0 || d.retry_limit > 30 {
            return Err(TetherError::Invalid(format!(
                "delivery.retry_limit must be between 1 and 30, got {}",
                d.retry_limit
            )));
        }

        let c = &self.control;
        if !c.backhaul_path.starts_with('/') {
            return Err(TetherError::Invalid(format!(
                "control.backhaul_path must start with '/', got {:?}",
                c.backhaul_path
            )));
        }
        if c.reconnect_initial_secs == 0 {
            return Err(TetherError::Invalid(
                "control.reconnect_initial_secs must be at least 1".into(),
            ));
        }
        if c.command_timeout_secs == 0 {
            return Err(TetherError::Invalid(
                "control.command_timeout_secs must be at least 1".into(),
            ));
        }
        if c.reconnect_initial_secs > c.reconnect_max_secs {
            return Err(TetherError::Invalid(format!(
                "control.reconnect_initial_secs ({}) exceeds control.reconnect_max_secs ({})",
                c.reconnect_initial_secs, c.reconnect_max_secs
            )));
        }

        Ok(())
    }
}
