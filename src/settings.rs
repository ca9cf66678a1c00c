use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub api_base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_conversation_poll_interval_ms")]
    pub conversation_poll_interval_ms: u64,
    #[serde(default = "default_message_poll_interval_ms")]
    pub message_poll_interval_ms: u64,
    /// Unset leaves the HTTP client's own default in place.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::with_prefix("CHAT_SYNC").separator("__"));

        let config = builder
            .build()
            .map_err(map_config_error)
            .context("failed to build configuration")?;

        config
            .try_deserialize::<Settings>()
            .map_err(map_config_error)
            .context("failed to deserialize configuration")
    }

    pub fn conversation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.conversation_poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn message_poll_interval(&self) -> Duration {
        Duration::from_millis(self.message_poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }
}

// Guards against a zero interval turning the poll loop into a busy loop.
const MIN_POLL_INTERVAL_MS: u64 = 100;

fn map_config_error(err: ConfigError) -> anyhow::Error {
    match err {
        ConfigError::NotFound(_) => err.into(),
        _ => anyhow::anyhow!(err),
    }
}

fn default_conversation_poll_interval_ms() -> u64 {
    10_000
}

fn default_message_poll_interval_ms() -> u64 {
    3_000
}
