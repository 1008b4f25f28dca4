use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::publication::Publication;

/// Delivery channel handed to `subscribe`
pub type PublicationSender = mpsc::Sender<Publication>;

/// Identifies one `subscribe` call
pub type SubscriptionId = u64;

#[derive(Debug)]
struct Registration {
    id: SubscriptionId,
    sender: PublicationSender,
}

/// Topic -> registered delivery channels.
///
/// Each shard of the map is locked while a topic's list is mutated or
/// iterated, so a dispatch never observes a half-updated list. Delivery is
/// `try_send` only: a full channel drops that message for that subscriber, a
/// closed channel drops the registration. Neither blocks the other
/// subscribers.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    topics: DashMap<String, Vec<Registration>>,
    next_id: AtomicU64,
    addresses: Vec<String>,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry fed from the brokers at `addresses`, which are reported
    /// with every dropped delivery
    #[must_use]
    pub fn with_addresses(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Register `sender` for `topic`. The same sender may be registered many
    /// times; every call is an independent registration.
    pub fn register(self: &Arc<Self>, topic: &str, sender: PublicationSender) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(Registration { id, sender });

        info!(topic = %topic, subscription_id = id, "Subscriber registered");

        Subscription {
            id,
            topic: topic.to_string(),
            registry: Arc::downgrade(self),
        }
    }

    /// Remove exactly one registration. Returns whether it was still present.
    fn remove(&self, topic: &str, id: SubscriptionId) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(mut registrations) => {
                let before = registrations.len();
                registrations.retain(|r| r.id != id);
                registrations.len() != before
            }
            None => false,
        };

        if self.topics.remove_if(topic, |_, regs| regs.is_empty()).is_some() {
            debug!(topic = %topic, "Topic has no more subscribers, removed");
        }

        removed
    }

    /// Deliver a copy of `publication` to every channel registered for its
    /// topic. Returns how many channels accepted it.
    pub fn dispatch(&self, publication: &Publication) -> usize {
        let topic = publication.topic();
        let mut sent_count = 0;
        let mut closed = Vec::new();

        if let Some(registrations) = self.topics.get(topic) {
            for registration in registrations.iter() {
                match registration.sender.try_send(publication.clone()) {
                    Ok(()) => sent_count += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            addresses = ?self.addresses,
                            topic = %topic,
                            subscription_id = registration.id,
                            error = "subscriber channel full",
                            "Dropped publication for slow subscriber"
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!(
                            addresses = ?self.addresses,
                            topic = %topic,
                            subscription_id = registration.id,
                            error = "subscriber channel closed",
                            "Dropped publication, removing closed subscriber"
                        );
                        closed.push(registration.id);
                    }
                }
            }
        }

        for id in closed {
            self.remove(topic, id);
        }

        debug!(topic = %topic, sent_count = sent_count, "Publication dispatched");
        sent_count
    }

    /// Topics with at least one registration
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |regs| regs.len())
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// Cancellation handle for one registration
#[derive(Debug)]
#[must_use = "the registration stays active until cancel() is called"]
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop delivery for this registration only
    pub fn cancel(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        if registry.remove(&self.topic, self.id) {
            info!(topic = %self.topic, subscription_id = self.id, "Subscriber cancelled");
        } else {
            debug!(
                topic = %self.topic,
                subscription_id = self.id,
                "Subscription already removed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::LogCapture;

    fn registry() -> Arc<SubscriberRegistry> {
        Arc::new(SubscriberRegistry::new())
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_subscriber() {
        let registry = registry();
        let mut receivers = Vec::new();
        let mut subscriptions = Vec::new();

        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(8);
            subscriptions.push(registry.register("events", tx));
            receivers.push(rx);
        }
        assert_eq!(registry.subscriber_count("events"), 3);

        let publication = Publication::new("events", "hello").with_metadata("k", "v");
        assert_eq!(registry.dispatch(&publication), 3);

        for rx in &mut receivers {
            assert_eq!(rx.recv().await.unwrap(), publication);
        }
    }

    #[test]
    fn test_dispatch_without_subscribers() {
        let registry = registry();
        assert_eq!(registry.dispatch(&Publication::new("nobody", "hello")), 0);
        assert_eq!(registry.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_removes_only_that_registration() {
        let registry = registry();
        let (tx, mut rx) = mpsc::channel(8);
        let (other_tx, mut other_rx) = mpsc::channel(8);

        // same channel, same topic, twice: two independent registrations
        let first = registry.register("events", tx.clone());
        let _second = registry.register("events", tx.clone());
        let _elsewhere = registry.register("audit", tx);
        let _other = registry.register("events", other_tx);

        first.cancel();
        assert_eq!(registry.subscriber_count("events"), 2);
        assert_eq!(registry.subscriber_count("audit"), 1);

        assert_eq!(registry.dispatch(&Publication::new("events", "a")), 2);
        assert_eq!(rx.recv().await.unwrap().payload_str(), Some("a"));
        assert!(rx.try_recv().is_err());
        assert_eq!(other_rx.recv().await.unwrap().payload_str(), Some("a"));

        assert_eq!(registry.dispatch(&Publication::new("audit", "b")), 1);
        assert_eq!(rx.recv().await.unwrap().payload_str(), Some("b"));
    }

    #[test]
    fn test_last_cancel_removes_topic() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(1);

        let subscription = registry.register("events", tx);
        assert_eq!(subscription.topic(), "events");
        assert_eq!(registry.topics(), vec!["events".to_string()]);

        subscription.cancel();
        assert_eq!(registry.topic_count(), 0);
        assert!(registry.topics().is_empty());
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block_others() {
        let registry = registry();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let _slow = registry.register("events", slow_tx);
        let _fast = registry.register("events", fast_tx);

        assert_eq!(registry.dispatch(&Publication::new("events", "1")), 2);
        // slow channel is now full; the second message is dropped for it only
        assert_eq!(registry.dispatch(&Publication::new("events", "2")), 1);

        assert_eq!(slow_rx.recv().await.unwrap().payload_str(), Some("1"));
        assert!(slow_rx.try_recv().is_err());
        assert_eq!(fast_rx.recv().await.unwrap().payload_str(), Some("1"));
        assert_eq!(fast_rx.recv().await.unwrap().payload_str(), Some("2"));

        // still registered after a drop
        assert_eq!(registry.subscriber_count("events"), 2);
    }

    #[test]
    fn test_dropped_delivery_logs_broker_addresses() {
        let registry = Arc::new(SubscriberRegistry::with_addresses(vec![
            "10.0.0.5:6379".to_string(),
            "10.0.0.6:6379".to_string(),
        ]));
        assert_eq!(registry.addresses().len(), 2);

        let (full_tx, _full_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = mpsc::channel(1);
        let _full = registry.register("events", full_tx);
        let _closed = registry.register("events", closed_tx);
        drop(closed_rx);

        let logs = LogCapture::new();
        logs.in_scope(|| {
            registry.dispatch(&Publication::new("events", "1"));
            registry.dispatch(&Publication::new("events", "2"));
        });

        let output = logs.contents();
        assert!(output.contains("subscriber channel full"));
        assert!(output.contains("subscriber channel closed"));
        for line in output.lines().filter(|l| l.contains("Dropped publication")) {
            assert!(line.contains("10.0.0.5:6379"), "{line}");
            assert!(line.contains("10.0.0.6:6379"), "{line}");
        }
    }

    #[test]
    fn test_closed_subscriber_is_removed() {
        let registry = registry();
        let (tx, rx) = mpsc::channel(1);
        let _subscription = registry.register("events", tx);
        drop(rx);

        assert_eq!(registry.dispatch(&Publication::new("events", "hello")), 0);
        assert_eq!(registry.subscriber_count("events"), 0);
    }

    #[test]
    fn test_cancel_after_registry_dropped() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(1);
        let subscription = registry.register("events", tx);
        let id = subscription.id();
        assert!(id > 0);

        drop(registry);
        subscription.cancel();
    }
}
