use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pubsub: PubSubConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    /// Separate listener for the health endpoint. When unset the endpoint is
    /// mounted on the main router.
    pub health_listen_address: Option<String>,
    pub health_endpoint: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            health_listen_address: None,
            health_endpoint: "/health".to_string(),
        }
    }
}

/// Broker connection settings for the pub/sub layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Broker `host:port` addresses, tried in order. Empty means single-node mode.
    pub addresses: Vec<String>,
    pub default_topic: String,
    pub connect_timeout_seconds: u64,
    /// How long startup blocks on the initial connection
    pub connect_wait_seconds: u64,
    /// 0 retries until connected, aborted or disconnected
    pub max_connect_attempts: u32,
    pub read_block_ms: u64,
    pub read_batch_size: usize,
    pub max_stream_length: usize,
    /// Most entries replayed to a topic's first subscriber in a session
    pub max_replay_entries: usize,
    pub announce_lifecycle: bool,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            default_topic: "events".to_string(),
            connect_timeout_seconds: 5,
            connect_wait_seconds: 10,
            max_connect_attempts: 0,
            read_block_ms: 250,
            read_batch_size: 256,
            max_stream_length: 10_000,
            max_replay_entries: 100,
            announce_lifecycle: false,
        }
    }
}

impl PubSubConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    #[must_use]
    pub const fn connect_wait(&self) -> Duration {
        Duration::from_secs(self.connect_wait_seconds)
    }

    #[must_use]
    pub const fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    #[must_use]
    pub fn max_connect_attempts(&self) -> Option<u32> {
        (self.max_connect_attempts > 0).then_some(self.max_connect_attempts)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // RELAYKIT_PUBSUB__DEFAULT_TOPIC, RELAYKIT_PUBSUB__ADDRESSES=a:1,b:2, ...
        builder = builder.add_source(
            Environment::with_prefix("RELAYKIT")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("pubsub.addresses")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check every setting and report all problems at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.listen_address.is_empty() {
            errors.push("server.listen_address must not be empty".to_string());
        }
        if !self.server.health_endpoint.starts_with('/') {
            errors.push(format!(
                "server.health_endpoint must start with '/', got '{}'",
                self.server.health_endpoint
            ));
        }
        if self.pubsub.default_topic.is_empty() {
            errors.push("pubsub.default_topic must not be empty".to_string());
        }
        if self.pubsub.addresses.iter().any(String::is_empty) {
            errors.push("pubsub.addresses must not contain empty entries".to_string());
        }
        if self.pubsub.connect_timeout_seconds == 0 {
            errors.push("pubsub.connect_timeout_seconds must be greater than 0".to_string());
        }
        if self.pubsub.read_block_ms == 0 {
            errors.push("pubsub.read_block_ms must be greater than 0".to_string());
        }
        if self.pubsub.read_batch_size == 0 {
            errors.push("pubsub.read_batch_size must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Whether a broker is configured at all
    #[must_use]
    pub fn broker_enabled(&self) -> bool {
        !self.pubsub.addresses.is_empty()
    }
}
