use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PushServerConfig;
use crate::error::Result;
use crate::publication::Publication;
use crate::redis_pubsub::RedisPubSub;
use crate::registry::{PublicationSender, Subscription};
use crate::waiter::Waiter;

/// Broker connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic-based publish/subscribe used by the rest of the process.
///
/// Implementations are shared across tasks; every method takes `&self`.
#[async_trait]
pub trait PubSubServer: Send + Sync {
    /// Send a publication to every subscriber of its topic, on every node.
    ///
    /// Fails with [`crate::Error::NotConnected`] outside the `Connected` state.
    async fn publish(&self, publication: &Publication) -> Result<()>;

    /// Register `sender` for `topic`. Allowed in any state; deliveries start
    /// once the server is connected.
    fn subscribe(&self, sender: PublicationSender, topic: &str) -> Result<Subscription>;

    /// Start connecting to the broker. Never blocks; the returned waiter
    /// reports the outcome.
    fn connect(&self) -> Waiter;

    /// Release broker clients and stop background work. Idempotent.
    async fn disconnect(&self);

    fn state(&self) -> ConnectionState;

    fn default_topic(&self) -> &str;
}

/// Build the broker-backed server for `config`
#[must_use]
pub fn new_pubsub_server(config: PushServerConfig) -> Arc<dyn PubSubServer> {
    Arc::new(RedisPubSub::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Connected.as_str(), "connected");
    }

    #[tokio::test]
    async fn test_new_pubsub_server_starts_disconnected() {
        let server = new_pubsub_server(PushServerConfig::new(vec![":1234".to_string()], "topic"));
        assert_eq!(server.state(), ConnectionState::Disconnected);
        assert_eq!(server.default_topic(), "topic");
    }
}
