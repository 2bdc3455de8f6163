//! Configuration loading.
//!
//! Reads the client configuration file and applies environment overrides.
//! Every field has a default, so a partial (or missing) file is fine.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::connection::HubConnectionBuilder;
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_INVOCATION_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL,
    DEFAULT_SERVER_TIMEOUT,
};
use crate::retry::RetryConfig;

/// Configuration for a hub client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Hub endpoint (`http(s)://` or `ws(s)://`).
    pub url: String,
    /// Bearer token sent with the upgrade request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Reconnect policy.
    pub retry: RetryConfig,
    /// Socket open plus handshake limit.
    pub connect_timeout_ms: u64,
    /// Per-invocation result limit.
    pub invocation_timeout_ms: u64,
    /// Outbound silence before a Ping is sent.
    pub keep_alive_interval_ms: u64,
    /// Inbound silence before the connection counts as lost.
    pub server_timeout_ms: u64,
    /// Log every frame at debug level.
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            access_token: None,
            retry: RetryConfig::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            invocation_timeout_ms: DEFAULT_INVOCATION_TIMEOUT.as_millis() as u64,
            keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL.as_millis() as u64,
            server_timeout_ms: DEFAULT_SERVER_TIMEOUT.as_millis() as u64,
            debug: false,
        }
    }
}

impl ClientConfig {
    /// Default configuration file path.
    ///
    /// Priority:
    /// 1. `HUBSOCKET_CONFIG` env var
    /// 2. Platform config dir (Linux: `~/.config/hubsocket/config.json`)
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("HUBSOCKET_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("hubsocket").join("config.json"))
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// `path` wins over [`Self::default_path`]. An explicit path must exist; the
    /// default path is only read when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads one configuration file, without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("HUBSOCKET_URL") {
            self.url = url;
        }

        // Token from env var (for CI/CD)
        if let Some(token) = var("HUBSOCKET_TOKEN") {
            self.access_token = Some(token);
        }

        if let Some(debug) = var("HUBSOCKET_DEBUG") {
            self.debug = matches!(debug.trim(), "1" | "true" | "yes");
        }

        if let Some(timeout) = var("HUBSOCKET_INVOCATION_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => self.invocation_timeout_ms = ms,
                Err(_) => log::warn!(
                    "Ignoring invalid HUBSOCKET_INVOCATION_TIMEOUT_MS: {}",
                    timeout
                ),
            }
        }
    }

    /// Builder carrying every setting of this configuration.
    pub fn into_builder(self) -> Result<HubConnectionBuilder> {
        if self.url.is_empty() {
            anyhow::bail!("No hub URL configured (set `url` or HUBSOCKET_URL)");
        }

        let mut builder = HubConnectionBuilder::new(self.url)
            .shared_retry_policy(self.retry.build())
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .invocation_timeout(Duration::from_millis(self.invocation_timeout_ms))
            .keep_alive_interval(Duration::from_millis(self.keep_alive_interval_ms))
            .server_timeout(Duration::from_millis(self.server_timeout_ms))
            .debug(self.debug);
        if let Some(token) = self.access_token {
            builder = builder.access_token(token);
        }
        Ok(builder)
    }
}
