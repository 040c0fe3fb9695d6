//! Feed configuration, loaded from TOML.
//!
//! ```toml
//! url = "wss://feed.example.com/live"
//! connect_timeout_ms = 10000
//! countdown_cadence_ms = 1000
//!
//! [retry]
//! initial_backoff_ms = 500
//! max_retries = 8
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use livefeed_core::RetryPolicy;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    #[serde(default = "default_url")]
    pub url: String,

    /// Handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Reconnect backoff and retry cap.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Expiry countdown tick interval in milliseconds.
    #[serde(default = "default_countdown_cadence_ms")]
    pub countdown_cadence_ms: u64,
}

fn default_url() -> String {
    "ws://127.0.0.1:9400/live".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_countdown_cadence_ms() -> u64 {
    1_000
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry: RetryPolicy::default(),
            countdown_cadence_ms: default_countdown_cadence_ms(),
        }
    }
}

impl FeedConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn countdown_cadence(&self) -> Duration {
        Duration::from_millis(self.countdown_cadence_ms)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!("url must be ws:// or wss://, got {}", self.url)));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms must be positive".into()));
        }
        if self.countdown_cadence_ms == 0 {
            return Err(ConfigError::Invalid("countdown_cadence_ms must be positive".into()));
        }
        let retry = &self.retry;
        if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be at least 1.0".into()));
        }
        if !(0.0..=1.0).contains(&retry.jitter_pct) {
            return Err(ConfigError::Invalid("retry.jitter_pct must be within 0.0..=1.0".into()));
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}
