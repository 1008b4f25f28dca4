//! Broker client construction.
//!
//! The factory never fails hard: an unreachable broker yields an absent
//! client and an error log carrying the address list and the cause, so the
//! owning process keeps serving everything that does not need the broker.

use std::future::Future;
use std::time::Duration;

use redis::aio::{ConnectionManager, ConnectionManagerConfig, MultiplexedConnection};
use redis::streams::{StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, AsyncConnectionConfig, Client as RedisClient, RedisResult};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::config::PushServerConfig;
use crate::error::{Error, Result};
use crate::publication::Publication;

/// Slack on top of the XREAD block interval before a read counts as stuck
const READ_GRACE: Duration = Duration::from_secs(2);

/// Timeout for a single XADD
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect attempts the producer makes in the background after its
/// connection drops. The next failing publish starts another round.
const PRODUCER_RECONNECT_RETRIES: usize = 2;

/// Turn a configured broker address into a connection URL.
///
/// `host:port` becomes `redis://host:port`, a bare `:port` targets the local
/// host, and full URLs pass through unchanged.
#[must_use]
pub fn broker_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else if address.starts_with(':') {
        format!("redis://127.0.0.1{address}")
    } else {
        format!("redis://{address}")
    }
}

/// Appends publications to topic streams.
///
/// The connection is managed: once the broker drops it, the publish that
/// hit the dead connection fails and a replacement is dialled in the
/// background for the ones that follow.
#[derive(Clone)]
pub struct Producer {
    conn: ConnectionManager,
    address: String,
}

impl Producer {
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// XADD the publication to its topic stream, returning the entry ID
    pub async fn append(&mut self, publication: &Publication, max_len: usize) -> Result<String> {
        let topic = publication.topic();
        let fields = publication.to_stream_fields();

        timeout(
            WRITE_TIMEOUT,
            self.conn.xadd_maxlen::<_, _, _, _, String>(
                topic,
                StreamMaxlen::Approx(max_len),
                "*",
                fields.as_slice(),
            ),
        )
        .await
        .map_err(|_| Error::BrokerWrite(format!("timed out appending to topic '{topic}'")))?
        .map_err(|e| Error::BrokerWrite(format!("failed to append to topic '{topic}': {e}")))
    }
}

/// Reads topic streams on a connection of its own, so blocking reads never
/// hold up publishes
pub struct Consumer {
    conn: MultiplexedConnection,
    address: String,
}

impl Consumer {
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stream ID matching the broker's current clock, used as the starting
    /// cursor for topics first seen in this session
    pub async fn session_start_id(&mut self) -> String {
        let clock: std::result::Result<redis::RedisResult<(u64, u64)>, _> =
            timeout(WRITE_TIMEOUT, redis::cmd("TIME").query_async(&mut self.conn)).await;

        let millis = match clock {
            Ok(Ok((secs, micros))) => secs * 1000 + micros / 1000,
            Ok(Err(e)) => self.local_clock_fallback(&e.to_string()),
            Err(_) => self.local_clock_fallback("timed out reading broker clock"),
        };

        format!("{millis}-0")
    }

    fn local_clock_fallback(&self, cause: &str) -> u64 {
        warn!(
            address = %self.address,
            error = %cause,
            "Failed to read broker clock, falling back to local time"
        );
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
    }

    /// Cursor for a topic joining the read set: at most `depth` of its
    /// entries at or after `floor` are still ahead of it
    pub async fn replay_start(&mut self, topic: &str, floor: &str, depth: usize) -> Result<String> {
        let newest: StreamRangeReply = timeout(
            WRITE_TIMEOUT,
            self.conn.xrevrange_count(topic, "+", floor, depth + 1),
        )
        .await
        .map_err(|_| Error::BrokerRead(format!("XREVRANGE on topic '{topic}' timed out")))?
        .map_err(|e| Error::BrokerRead(e.to_string()))?;

        Ok(replay_cursor(floor, &newest.ids, depth))
    }

    /// One XREAD over `topics` from their `cursors`, blocking at most `block`
    /// when nothing is pending. Returns `(topic, entry)` pairs in stream order.
    pub async fn read(
        &mut self,
        topics: &[String],
        cursors: &[String],
        block: Duration,
        count: usize,
    ) -> Result<Vec<(String, StreamId)>> {
        let block_ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
        let options = StreamReadOptions::default().count(count).block(block_ms);

        let reply: Option<StreamReadReply> = timeout(
            block + READ_GRACE,
            self.conn.xread_options(topics, cursors, &options),
        )
        .await
        .map_err(|_| Error::BrokerRead(format!("XREAD on {} topic(s) timed out", topics.len())))?
        .map_err(|e| Error::BrokerRead(e.to_string()))?;

        let mut entries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream.ids {
                entries.push((stream.key.clone(), entry));
            }
        }
        Ok(entries)
    }
}

/// XREAD cursors are exclusive, so starting at the entry just past the
/// `depth` newest leaves exactly those to be read
fn replay_cursor(floor: &str, newest_first: &[StreamId], depth: usize) -> String {
    newest_first
        .get(depth)
        .map_or_else(|| floor.to_string(), |entry| entry.id.clone())
}

/// A producer and a consumer, always created and released together
pub struct BrokerClients {
    pub producer: Producer,
    pub consumer: Consumer,
}

/// Creates broker clients from the configured address list
#[derive(Debug, Clone)]
pub struct BrokerClientFactory {
    addresses: Vec<String>,
    connect_timeout: Duration,
}

impl BrokerClientFactory {
    #[must_use]
    pub fn new(config: &PushServerConfig) -> Self {
        Self {
            addresses: config.addresses.clone(),
            connect_timeout: config.connect_timeout,
        }
    }

    #[must_use]
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub async fn make_producer(&self) -> Option<Producer> {
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(Some(self.connect_timeout))
            .set_response_timeout(Some(WRITE_TIMEOUT))
            .set_number_of_retries(PRODUCER_RECONNECT_RETRIES);

        self.connect("producer", |client| {
            let config = config.clone();
            async move { client.get_connection_manager_with_config(config).await }
        })
        .await
        .map(|(address, conn)| Producer { conn, address })
    }

    /// The consumer's reads block on the broker for up to `read_block`, so
    /// its connection has no response timeout of its own. `read` bounds
    /// each call instead.
    pub async fn make_consumer(&self) -> Option<Consumer> {
        let config = AsyncConnectionConfig::new()
            .set_connection_timeout(Some(self.connect_timeout))
            .set_response_timeout(None);

        self.connect("consumer", |client| {
            let config = config.clone();
            async move { client.get_multiplexed_async_connection_with_config(&config).await }
        })
        .await
        .map(|(address, conn)| Consumer { conn, address })
    }

    /// Both clients or neither. Each side is attempted even if the other
    /// failed, so both causes end up in the log.
    pub async fn make_clients(&self) -> Option<BrokerClients> {
        let producer = self.make_producer().await;
        let consumer = self.make_consumer().await;

        match (producer, consumer) {
            (Some(producer), Some(consumer)) => Some(BrokerClients { producer, consumer }),
            (producer, consumer) => {
                if producer.is_some() || consumer.is_some() {
                    warn!(
                        addresses = ?self.addresses,
                        producer = producer.is_some(),
                        consumer = consumer.is_some(),
                        "Discarding half-connected broker clients"
                    );
                }
                None
            }
        }
    }

    /// First address that accepts a connection wins
    async fn connect<C, F, Fut>(&self, role: &'static str, open: F) -> Option<(String, C)>
    where
        F: Fn(RedisClient) -> Fut,
        Fut: Future<Output = RedisResult<C>>,
    {
        let mut causes = Vec::with_capacity(self.addresses.len());

        for address in &self.addresses {
            let client = match RedisClient::open(broker_url(address)) {
                Ok(client) => client,
                Err(e) => {
                    causes.push(format!("{address}: {e}"));
                    continue;
                }
            };

            match timeout(self.connect_timeout, open(client)).await {
                Ok(Ok(conn)) => {
                    debug!(address = %address, role = role, "Broker client connected");
                    return Some((address.clone(), conn));
                }
                Ok(Err(e)) => causes.push(format!("{address}: {e}")),
                Err(_) => causes.push(format!(
                    "{address}: timed out after {}s",
                    self.connect_timeout.as_secs_f32()
                )),
            }
        }

        let err = Error::BrokerUnavailable(causes.join("; "));
        error!(
            addresses = ?self.addresses,
            role = role,
            error = %err,
            "Unable to create broker {}",
            role
        );
        None
    }
}
