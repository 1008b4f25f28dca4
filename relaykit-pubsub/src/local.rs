//! In-process [`PubSubServer`] for single-node deployments

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::auth::{AccessPolicy, Operation};
use crate::error::{Error, Result};
use crate::publication::Publication;
use crate::registry::{PublicationSender, SubscriberRegistry, Subscription};
use crate::server::{ConnectionState, PubSubServer};
use crate::waiter::Waiter;

/// Fans publications out to local subscribers only. Connecting always
/// succeeds immediately; publishing still requires a connected server so
/// callers see the same lifecycle as with a broker.
pub struct LocalPubSub {
    default_topic: String,
    registry: Arc<SubscriberRegistry>,
    access: AccessPolicy,
    state: watch::Sender<ConnectionState>,
}

impl LocalPubSub {
    #[must_use]
    pub fn new(default_topic: impl Into<String>, access: AccessPolicy) -> Self {
        let default_topic = default_topic.into();
        info!(default_topic = %default_topic, "Running pub/sub in single-node mode");

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            default_topic,
            registry: Arc::new(SubscriberRegistry::new()),
            access,
            state,
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.subscriber_count(topic)
    }
}

#[async_trait]
impl PubSubServer for LocalPubSub {
    async fn publish(&self, publication: &Publication) -> Result<()> {
        publication.validate()?;
        self.access.check(
            Operation::Publish,
            publication.topic(),
            Some(publication.metadata()),
        )?;

        if *self.state.borrow() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        let delivered = self.registry.dispatch(publication);
        debug!(topic = %publication.topic(), delivered = delivered, "Local publication delivered");
        Ok(())
    }

    fn subscribe(&self, sender: PublicationSender, topic: &str) -> Result<Subscription> {
        if topic.is_empty() {
            return Err(Error::InvalidPublication(
                "subscription topic must not be empty".to_string(),
            ));
        }
        self.access.check(Operation::Subscribe, topic, None)?;

        Ok(self.registry.register(topic, sender))
    }

    fn connect(&self) -> Waiter {
        self.state.send_replace(ConnectionState::Connected);
        Waiter::resolved(true)
    }

    async fn disconnect(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn default_topic(&self) -> &str {
        &self.default_topic
    }
}
