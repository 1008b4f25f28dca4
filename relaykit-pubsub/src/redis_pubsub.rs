//! Redis Streams backed [`PubSubServer`].
//!
//! Each session (one successful connect up to the next disconnect) owns a
//! producer connection for XADD and a consumer task that XREADs every subscribed
//! topic and fans entries out through the [`SubscriberRegistry`]. The session
//! is torn down through its `CancellationToken`, which is also how an
//! unattended connection attempt gets stopped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::streams::StreamId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AccessPolicy, Operation};
use crate::config::PushServerConfig;
use crate::error::{Error, Result};
use crate::factory::{BrokerClientFactory, BrokerClients, Consumer, Producer};
use crate::publication::Publication;
use crate::registry::{PublicationSender, SubscriberRegistry, Subscription};
use crate::server::{ConnectionState, PubSubServer};
use crate::waiter::{ConnectAttempt, Waiter};

/// Initial backoff between connection attempts
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff between connection attempts
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct RedisPubSub {
    inner: Arc<Inner>,
}

struct Inner {
    config: PushServerConfig,
    factory: BrokerClientFactory,
    registry: Arc<SubscriberRegistry>,
    access: AccessPolicy,
    node_id: String,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    cancel: Option<CancellationToken>,
    producer: Option<Producer>,
    tasks: Vec<JoinHandle<()>>,
}

impl RedisPubSub {
    #[must_use]
    pub fn new(config: PushServerConfig) -> Self {
        let node_id = format!("node_{}", nanoid::nanoid!(8));
        info!(node_id = %node_id, config = %config, "Creating Redis pub/sub server");

        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                factory: BrokerClientFactory::new(&config),
                access: config.access_policy(),
                registry: Arc::new(SubscriberRegistry::with_addresses(config.addresses.clone())),
                config,
                node_id,
                state,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    #[must_use]
    pub fn config(&self) -> &PushServerConfig {
        &self.inner.config
    }

    /// Follow state transitions
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.registry.subscriber_count(topic)
    }
}

#[async_trait]
impl PubSubServer for RedisPubSub {
    async fn publish(&self, publication: &Publication) -> Result<()> {
        publication.validate()?;
        self.inner.access.check(
            Operation::Publish,
            publication.topic(),
            Some(publication.metadata()),
        )?;

        let mut producer = self
            .inner
            .session
            .lock()
            .producer
            .clone()
            .ok_or(Error::NotConnected)?;

        match producer
            .append(publication, self.inner.config.max_stream_length)
            .await
        {
            Ok(entry_id) => {
                debug!(
                    topic = %publication.topic(),
                    entry_id = %entry_id,
                    payload_len = publication.payload().len(),
                    "Publication appended"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    addresses = ?self.inner.config.addresses,
                    topic = %publication.topic(),
                    error = %e,
                    "Failed to publish"
                );
                Err(e)
            }
        }
    }

    fn subscribe(&self, sender: PublicationSender, topic: &str) -> Result<Subscription> {
        if topic.is_empty() {
            return Err(Error::InvalidPublication(
                "subscription topic must not be empty".to_string(),
            ));
        }
        self.inner.access.check(Operation::Subscribe, topic, None)?;

        Ok(self.inner.registry.register(topic, sender))
    }

    fn connect(&self) -> Waiter {
        let mut session = self.inner.session.lock();
        let state = *self.inner.state.borrow();

        match state {
            ConnectionState::Connected => return Waiter::resolved(true),
            ConnectionState::Connecting => {
                debug!(node_id = %self.inner.node_id, "Connection attempt already in flight");
                return Waiter::observe(self.inner.state.subscribe());
            }
            ConnectionState::Disconnected => {}
        }

        let token = CancellationToken::new();
        session.cancel = Some(token.clone());
        session.tasks.retain(|task| !task.is_finished());
        self.inner.state.send_replace(ConnectionState::Connecting);

        info!(
            node_id = %self.inner.node_id,
            addresses = ?self.inner.config.addresses,
            "Connecting to broker"
        );

        let (waiter, attempt) = Waiter::pair();
        let task = tokio::spawn(Inner::run_connect(Arc::clone(&self.inner), token, attempt));
        session.tasks.push(task);

        waiter
    }

    async fn disconnect(&self) {
        let tasks = {
            let mut session = self.inner.session.lock();
            let Some(token) = session.cancel.take() else {
                debug!(node_id = %self.inner.node_id, "Already disconnected");
                return;
            };
            token.cancel();
            session.producer = None;
            self.inner.state.send_replace(ConnectionState::Disconnected);
            std::mem::take(&mut session.tasks)
        };

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Pub/sub background task failed");
            }
        }

        info!(node_id = %self.inner.node_id, "Disconnected from broker");
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    fn default_topic(&self) -> &str {
        &self.inner.config.default_topic
    }
}

impl Drop for RedisPubSub {
    fn drop(&mut self) {
        if let Some(token) = self.inner.session.lock().cancel.take() {
            token.cancel();
        }
    }
}

impl Inner {
    /// Background half of `connect`: retry with backoff until a client pair
    /// exists, the waiter aborts, the session is cancelled, or the attempt
    /// budget runs out.
    async fn run_connect(self: Arc<Self>, token: CancellationToken, mut attempt: ConnectAttempt) {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let clients = tokio::select! {
                () = token.cancelled() => {
                    attempt.resolve(false);
                    return;
                }
                () = attempt.aborted() => {
                    self.abandon(&token, "connection attempt aborted by waiter");
                    return;
                }
                clients = self.factory.make_clients() => clients,
            };

            if let Some(mut clients) = clients {
                let start_id = tokio::select! {
                    () = token.cancelled() => {
                        attempt.resolve(false);
                        return;
                    }
                    () = attempt.aborted() => {
                        self.abandon(&token, "connection attempt aborted by waiter");
                        return;
                    }
                    id = clients.consumer.session_start_id() => id,
                };

                let connected = self.activate(&token, clients, start_id);
                attempt.resolve(connected);
                if connected && self.config.announce_lifecycle {
                    self.announce("connected").await;
                }
                return;
            }

            if self
                .config
                .max_connect_attempts
                .is_some_and(|max| attempts >= max)
            {
                warn!(
                    addresses = ?self.config.addresses,
                    attempts = attempts,
                    "Giving up connecting to broker"
                );
                self.abandon(&token, "connection attempts exhausted");
                attempt.resolve(false);
                return;
            }

            warn!(
                addresses = ?self.config.addresses,
                attempt = attempts,
                backoff_secs = backoff.as_secs(),
                "Broker connection failed, retrying after backoff"
            );

            tokio::select! {
                () = token.cancelled() => {
                    attempt.resolve(false);
                    return;
                }
                () = attempt.aborted() => {
                    self.abandon(&token, "connection attempt aborted by waiter");
                    return;
                }
                () = sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Install the clients and start consuming, unless the session was
    /// cancelled meanwhile
    fn activate(
        self: &Arc<Self>,
        token: &CancellationToken,
        clients: BrokerClients,
        start_id: String,
    ) -> bool {
        let mut session = self.session.lock();
        if token.is_cancelled() {
            debug!("Session cancelled before activation, dropping broker clients");
            return false;
        }

        let BrokerClients { producer, consumer } = clients;
        info!(
            node_id = %self.node_id,
            producer = %producer.address(),
            consumer = %consumer.address(),
            start_id = %start_id,
            "Connected to broker"
        );

        session.producer = Some(producer);
        let task = tokio::spawn(Arc::clone(self).consume(token.clone(), consumer, start_id));
        session.tasks.push(task);
        self.state.send_replace(ConnectionState::Connected);

        true
    }

    /// End an attempt nobody is waiting on. A disconnect that already took
    /// over the session wins.
    fn abandon(&self, token: &CancellationToken, reason: &str) {
        let mut session = self.session.lock();
        if token.is_cancelled() {
            return;
        }

        token.cancel();
        session.cancel = None;
        self.state.send_replace(ConnectionState::Disconnected);
        info!(node_id = %self.node_id, reason = reason, "Connection attempt abandoned");
    }

    /// The consumption process of one session
    async fn consume(self: Arc<Self>, token: CancellationToken, mut consumer: Consumer, start_id: String) {
        let mut cursors: HashMap<String, String> = HashMap::new();
        let mut backoff = INITIAL_BACKOFF;

        info!(node_id = %self.node_id, "Broker consumer started");

        loop {
            let read = tokio::select! {
                () = token.cancelled() => break,
                read = self.read_subscribed(&mut consumer, &mut cursors, &start_id) => read,
            };

            match read {
                Ok(entries) => {
                    backoff = INITIAL_BACKOFF;
                    for (topic, entry) in entries {
                        match Publication::from_stream_entry(&topic, &entry) {
                            Ok(publication) => {
                                self.registry.dispatch(&publication);
                            }
                            Err(e) => {
                                warn!(
                                    topic = %topic,
                                    entry_id = %entry.id,
                                    error = %e,
                                    "Skipping undecodable stream entry"
                                );
                            }
                        }
                        cursors.insert(topic, entry.id);
                    }
                }
                Err(e) => {
                    warn!(
                        addresses = ?self.config.addresses,
                        address = %consumer.address(),
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Broker read failed, reconnecting consumer"
                    );

                    tokio::select! {
                        () = token.cancelled() => break,
                        () = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);

                    let fresh = tokio::select! {
                        () = token.cancelled() => break,
                        fresh = self.factory.make_consumer() => fresh,
                    };
                    if let Some(fresh) = fresh {
                        info!(address = %fresh.address(), "Broker consumer reconnected");
                        consumer = fresh;
                    }
                }
            }
        }

        info!(node_id = %self.node_id, "Broker consumer stopped");
    }

    /// Align the read set with the topics that have subscribers right now,
    /// then read one batch.
    ///
    /// A topic left without subscribers loses its cursor. When it gains one
    /// again it rejoins like a topic never seen before, so its backlog is
    /// bounded by `max_replay_entries` and never reaches past `start_id`.
    async fn read_subscribed(
        &self,
        consumer: &mut Consumer,
        cursors: &mut HashMap<String, String>,
        start_id: &str,
    ) -> Result<Vec<(String, StreamId)>> {
        let subscribed: HashSet<String> = self.registry.topics().into_iter().collect();

        cursors.retain(|topic, _| {
            let keep = subscribed.contains(topic);
            if !keep {
                debug!(topic = %topic, "Topic has no subscribers, leaving read set");
            }
            keep
        });

        for topic in subscribed {
            if cursors.contains_key(&topic) {
                continue;
            }
            let cursor = consumer
                .replay_start(&topic, start_id, self.config.max_replay_entries)
                .await?;
            debug!(topic = %topic, cursor = %cursor, "Topic joined read set");
            cursors.insert(topic, cursor);
        }

        if cursors.is_empty() {
            sleep(self.config.read_block).await;
            return Ok(Vec::new());
        }

        let (topics, ids): (Vec<String>, Vec<String>) =
            cursors.iter().map(|(t, id)| (t.clone(), id.clone())).unzip();

        consumer
            .read(&topics, &ids, self.config.read_block, self.config.read_batch_size)
            .await
    }

    /// Diagnostic publication on the default topic
    async fn announce(&self, state: &str) {
        let Some(mut producer) = self.session.lock().producer.clone() else {
            return;
        };

        let publication = Publication::new(self.config.default_topic.clone(), bytes::Bytes::new())
            .with_metadata("kind", "lifecycle")
            .with_metadata("state", state)
            .with_metadata("node", self.node_id.clone());

        if let Err(e) = producer
            .append(&publication, self.config.max_stream_length)
            .await
        {
            warn!(
                topic = %self.config.default_topic,
                error = %e,
                "Failed to announce lifecycle change"
            );
        }
    }
}
