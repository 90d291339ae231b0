use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use crate::engine::hub::DEFAULT_COMMAND_QUEUE_CAPACITY;
use crate::engine::mailbox::DEFAULT_MAILBOX_CAPACITY;
use crate::engine::session::SessionSettings;
use crate::engine::store::DEFAULT_HISTORY_LIMIT;
use crate::engine::validation::DEFAULT_MAX_MESSAGE_LENGTH;

/// Top-level server configuration, loaded from channelhub.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub hub: HubSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub web_address: String,
    /// Origin allowed by CORS. Localhost origins allow any.
    pub public_url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            web_address: "0.0.0.0:8080".into(),
            public_url: "http://localhost:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:channelhub.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub mailbox_capacity: usize,
    pub command_queue_capacity: usize,
    pub history_limit: usize,
    pub history_timeout_secs: u64,
    pub save_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub max_message_length: usize,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            command_queue_capacity: DEFAULT_COMMAND_QUEUE_CAPACITY,
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_timeout_secs: 5,
            save_timeout_secs: 5,
            write_timeout_secs: 10,
            ping_interval_secs: 54,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            Self::from_toml(&contents).with_context(|| format!("failed to parse config file {path}"))?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WEB_ADDRESS") {
            self.server.web_address = v;
        }
        if let Ok(v) = std::env::var("PUBLIC_URL") {
            self.server.public_url = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("MAILBOX_CAPACITY")
            && let Ok(n) = v.parse()
        {
            self.hub.mailbox_capacity = n;
        }
        if let Ok(v) = std::env::var("HISTORY_LIMIT")
            && let Ok(n) = v.parse()
        {
            self.hub.history_limit = n;
        }
        if let Ok(v) = std::env::var("PING_INTERVAL_SECS")
            && let Ok(secs) = v.parse()
        {
            self.hub.ping_interval_secs = secs;
        }
        if let Ok(v) = std::env::var("WRITE_TIMEOUT_SECS")
            && let Ok(secs) = v.parse()
        {
            self.hub.write_timeout_secs = secs;
        }
        if let Ok(v) = std::env::var("MAX_MESSAGE_LENGTH")
            && let Ok(len) = v.parse()
        {
            self.hub.max_message_length = len;
        }
    }

    /// Convert into the settings each client session runs with.
    /// Zero capacities and intervals are clamped to one.
    pub fn session_settings(&self) -> SessionSettings {
        let hub = &self.hub;
        SessionSettings {
            mailbox_capacity: hub.mailbox_capacity.max(1),
            history_limit: hub.history_limit,
            history_timeout: Duration::from_secs(hub.history_timeout_secs),
            save_timeout: Duration::from_secs(hub.save_timeout_secs),
            write_timeout: Duration::from_secs(hub.write_timeout_secs),
            ping_interval: Duration::from_secs(hub.ping_interval_secs.max(1)),
            max_message_length: hub.max_message_length,
        }
    }

    pub fn command_queue_capacity(&self) -> usize {
        self.hub.command_queue_capacity.max(1)
    }
}
