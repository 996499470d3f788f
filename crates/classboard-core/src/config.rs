//! Collaboration settings.
//!
//! Loaded from `collab.json` in the platform config directory, then
//! overridden by environment variables.

use crate::error::{CollabError, CollabResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable overriding `relay_url`.
pub const ENV_RELAY_URL: &str = "CLASSBOARD_RELAY_URL";

/// Environment variable overriding `direct_bind`.
pub const ENV_DIRECT_BIND: &str = "CLASSBOARD_DIRECT_BIND";

/// Config file name under `<config dir>/classboard/`.
pub const CONFIG_FILE_NAME: &str = "collab.json";

/// Relay URL shipped in the sample configuration. Treated as unset.
pub const PLACEHOLDER_RELAY_URL: &str = "wss://YOUR_RELAY_HOST/ws";

pub const DEFAULT_DIRECT_BIND: &str = "127.0.0.1:0";
pub const DEFAULT_ACTION_RETENTION_MS: u64 = 10_000;
pub const DEFAULT_CURSOR_INTERVAL_MS: u64 = 50;
pub const DEFAULT_SNAPSHOT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// WebSocket URL of the relay store (`ws://` or `wss://`).
    pub relay_url: Option<String>,
    /// Listen address of the teacher in direct mode.
    pub direct_bind: String,
    /// How long relayed actions stay in a room's log.
    pub action_retention_ms: u64,
    /// Minimum interval between cursor publishes.
    pub cursor_interval_ms: u64,
    /// Delay before the teacher sends its snapshot to a new direct peer.
    pub snapshot_delay_ms: u64,
    pub reconnect_backoff_ms: u64,
    /// How long a direct peer may take to say hello or be welcomed.
    pub handshake_timeout_ms: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            direct_bind: DEFAULT_DIRECT_BIND.to_string(),
            action_retention_ms: DEFAULT_ACTION_RETENTION_MS,
            cursor_interval_ms: DEFAULT_CURSOR_INTERVAL_MS,
            snapshot_delay_ms: DEFAULT_SNAPSHOT_DELAY_MS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl CollabConfig {
    pub fn from_json(json: &str) -> CollabResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CollabError::TransportUnavailable(format!("Invalid collaboration config: {}", e)))
    }

    /// Load from a file. A missing file yields the defaults.
    pub fn load(path: &Path) -> CollabResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_json(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No collaboration config at {}", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(CollabError::TransportUnavailable(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Load from the platform config directory, then apply environment
    /// overrides.
    pub fn load_default() -> CollabResult<Self> {
        let mut config = match Self::config_path() {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// `<config dir>/classboard/collab.json`, if the platform has one.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("classboard").join(CONFIG_FILE_NAME))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production). Empty values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_RELAY_URL) {
            self.relay_url = Some(url.trim().to_string());
        }
        if let Some(bind) = non_empty(ENV_DIRECT_BIND) {
            self.direct_bind = bind.trim().to_string();
        }
    }

    /// The configured relay endpoint, checked before any room operation.
    pub fn relay_endpoint(&self) -> CollabResult<Url> {
        let raw = match self.relay_url.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => raw,
            _ => {
                return Err(CollabError::TransportUnavailable(
                    "no relay is configured".to_string(),
                ));
            }
        };
        if raw == PLACEHOLDER_RELAY_URL || raw.contains("YOUR_") {
            return Err(CollabError::TransportUnavailable(format!(
                "relay URL is still the placeholder ({})",
                raw
            )));
        }
        let url = Url::parse(raw)
            .map_err(|e| CollabError::TransportUnavailable(format!("invalid relay URL {}: {}", raw, e)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            scheme => Err(CollabError::TransportUnavailable(format!(
                "relay URL must use ws:// or wss://, not {}://",
                scheme
            ))),
        }
    }

    pub fn action_retention(&self) -> Duration {
        Duration::from_millis(self.action_retention_ms)
    }

    pub fn cursor_interval(&self) -> Duration {
        Duration::from_millis(self.cursor_interval_ms)
    }

    pub fn snapshot_delay(&self) -> Duration {
        Duration::from_millis(self.snapshot_delay_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
