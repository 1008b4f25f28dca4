use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use relaykit_core::PubSubConfig;

use crate::auth::{AccessPolicy, Authenticator, Authorizer};
use crate::error::{Error, Result};

/// Broker connection settings plus the optional access capabilities
#[derive(Clone)]
pub struct PushServerConfig {
    pub addresses: Vec<String>,
    pub default_topic: String,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Bound on each broker connection attempt
    pub connect_timeout: Duration,
    /// `None` keeps retrying until connected, aborted or disconnected
    pub max_connect_attempts: Option<u32>,
    /// XREAD BLOCK interval; also bounds how long disconnect waits on the reader
    pub read_block: Duration,
    pub read_batch_size: usize,
    pub max_stream_length: usize,
    /// Bound on the backlog delivered when a topic gains its first subscriber
    /// in a session; entries older than the session are never replayed
    pub max_replay_entries: usize,
    /// Publish a lifecycle publication to the default topic after connecting
    pub announce_lifecycle: bool,
}

impl PushServerConfig {
    /// # Panics
    ///
    /// Panics if `addresses` or `default_topic` is empty. Both are startup
    /// configuration; use [`PushServerConfig::try_new`] to get an error instead.
    #[must_use]
    pub fn new(addresses: Vec<String>, default_topic: impl Into<String>) -> Self {
        match Self::try_new(addresses, default_topic) {
            Ok(config) => config,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn try_new(addresses: Vec<String>, default_topic: impl Into<String>) -> Result<Self> {
        let default_topic = default_topic.into();

        if addresses.is_empty() {
            return Err(Error::Configuration(
                "at least one address should be provided to PushServerConfig".to_string(),
            ));
        }
        if addresses.iter().any(String::is_empty) {
            return Err(Error::Configuration(
                "PushServerConfig addresses must not be empty strings".to_string(),
            ));
        }
        if default_topic.is_empty() {
            return Err(Error::Configuration(
                "a valid default topic should be provided to PushServerConfig".to_string(),
            ));
        }

        let defaults = PubSubConfig::default();
        Ok(Self {
            addresses,
            default_topic,
            authorizer: None,
            authenticator: None,
            connect_timeout: defaults.connect_timeout(),
            max_connect_attempts: defaults.max_connect_attempts(),
            read_block: defaults.read_block(),
            read_batch_size: defaults.read_batch_size,
            max_stream_length: defaults.max_stream_length,
            max_replay_entries: defaults.max_replay_entries,
            announce_lifecycle: defaults.announce_lifecycle,
        })
    }

    /// Build from the `pubsub` section of the application configuration
    pub fn from_settings(settings: &PubSubConfig) -> Result<Self> {
        let mut config = Self::try_new(settings.addresses.clone(), settings.default_topic.clone())?;
        config.connect_timeout = settings.connect_timeout();
        config.max_connect_attempts = settings.max_connect_attempts();
        config.read_block = settings.read_block();
        config.read_batch_size = settings.read_batch_size.max(1);
        config.max_stream_length = settings.max_stream_length;
        config.max_replay_entries = settings.max_replay_entries;
        config.announce_lifecycle = settings.announce_lifecycle;
        Ok(config)
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    #[must_use]
    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy {
            authenticator: self.authenticator.clone(),
            authorizer: self.authorizer.clone(),
        }
    }
}

impl fmt::Display for PushServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<PushServerConfig addresses: [{}] default_topic: {}>",
            self.addresses.join(" "),
            self.default_topic
        )
    }
}

impl fmt::Debug for PushServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushServerConfig")
            .field("addresses", &self.addresses)
            .field("default_topic", &self.default_topic)
            .field("authorizer", &self.authorizer.is_some())
            .field("authenticator", &self.authenticator.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .field("max_connect_attempts", &self.max_connect_attempts)
            .field("read_block", &self.read_block)
            .field("max_replay_entries", &self.max_replay_entries)
            .finish_non_exhaustive()
    }
}
