//! Redis Streams-backed message bus.
//!
//! - **Publish**: `XADD <stream> * payload <bytes>`; the reply id is the ack
//! - **Consume**: one consumer group per worker pool, `XREADGROUP ... >`
//! - **Ack**: `XACK` once the consumer acks the delivery; a nack (or a
//!   delivery dropped unsettled) leaves the entry pending, and the reader
//!   replays this consumer's pending entries (`XREADGROUP ... 0`) before reading
//!   new ones
//!
//! ## Architecture
//!
//! - **Stream Key**: the configured bus topic (default `cloudtasker.jobs`)
//! - **Consumer Group**: `cloudtasker.workers` unless overridden
//! - **Consumers**: named per process (`worker-<pid>`)
//!
//! Entries left pending by a consumer that died stay in the group's pending
//! list and can be reclaimed with `XCLAIM` by an operator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio::sync::{OnceCell, mpsc, oneshot};
use tracing::{debug, instrument, warn};

use cloudtasker_events::{BusError, Delivery, MessageBus, Settlement, Subscription};

/// Default consumer group for task workers
const DEFAULT_GROUP: &str = "cloudtasker.workers";

/// Field that carries the message bytes in each stream entry
const PAYLOAD_FIELD: &str = "payload";

/// Messages fetched per XREADGROUP call
const READ_COUNT: usize = 16;

/// How long XREADGROUP blocks waiting for new entries
const READ_BLOCK_MS: usize = 1_000;

/// Pause before replaying entries a consumer handed back
const REPLAY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),
}

impl From<RedisStreamsError> for BusError {
    fn from(value: RedisStreamsError) -> Self {
        BusError::Unavailable(value.to_string())
    }
}

#[derive(Clone)]
pub struct RedisStreamsBus {
    client: Arc<redis::Client>,
    connection: Arc<OnceCell<ConnectionManager>>,
    stream_key: String,
    group: String,
    consumer: String,
}

impl std::fmt::Debug for RedisStreamsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBus")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl RedisStreamsBus {
    /// Create a bus publishing to `stream_key`.
    ///
    /// No connection is made until the first publish or subscribe.
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: impl Into<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            connection: Arc::new(OnceCell::new()),
            stream_key: stream_key.into(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("worker-{}", std::process::id()),
        })
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    async fn connection(&self) -> Result<ConnectionManager, RedisStreamsError> {
        let client = self.client.clone();
        self.connection
            .get_or_try_init(|| async move {
                ConnectionManager::new((*client).clone())
                    .await
                    .map_err(|e| RedisStreamsError::Connection(e.to_string()))
            })
            .await
            .cloned()
    }

    /// Ensure the consumer group exists (idempotent).
    pub async fn ensure_consumer_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection().await?;

        // XGROUP CREATE ... MKSTREAM creates the stream too; BUSYGROUP means it exists.
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream_key, &self.group, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    #[instrument(skip(self, message), fields(stream_key = %self.stream_key, bytes = message.len()), err)]
    async fn xadd(&self, message: &[u8]) -> Result<String, RedisStreamsError> {
        let mut conn = self.connection().await?;
        conn.xadd(&self.stream_key, "*", &[(PAYLOAD_FIELD, message)])
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))
    }

    /// Read entries for this consumer and forward them until the subscription
    /// is dropped. Each entry is acknowledged only once its delivery is acked.
    async fn consume(self, tx: mpsc::UnboundedSender<Delivery>) {
        if let Err(err) = self.ensure_consumer_group().await {
            warn!(stream_key = %self.stream_key, error = %err, "cannot create consumer group");
            return;
        }

        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_COUNT)
            .block(READ_BLOCK_MS);

        // Start with whatever a previous run of this consumer left unacked.
        let mut replay_pending = true;

        while !tx.is_closed() {
            let mut conn = match self.connection().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "redis unavailable; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let start_id = if replay_pending { "0" } else { ">" };
            let reply: StreamReadReply = match conn
                .xread_options(&[&self.stream_key], &[start_id], &options)
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(error = %err, "XREADGROUP failed; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if replay_pending && reply.keys.iter().all(|stream| stream.ids.is_empty()) {
                replay_pending = false;
                continue;
            }

            let mut handed_back = false;
            for stream in reply.keys {
                for entry in stream.ids {
                    let settled = match entry.get::<Vec<u8>>(PAYLOAD_FIELD) {
                        Some(bytes) => {
                            let (settle_tx, settle_rx) = oneshot::channel();
                            let delivery = Delivery::new(bytes, move |outcome| {
                                let _ = settle_tx.send(outcome);
                            });
                            if tx.send(delivery).is_err() {
                                // Unacked: stays pending for the group.
                                return;
                            }
                            // Dropped without settling counts as a nack.
                            settle_rx.await.unwrap_or(Settlement::Nack)
                        }
                        None => {
                            warn!(id = %entry.id, "stream entry without payload field");
                            Settlement::Ack
                        }
                    };

                    if settled == Settlement::Nack {
                        debug!(id = %entry.id, "delivery handed back; left pending");
                        handed_back = true;
                        continue;
                    }

                    let acked: Result<u64, redis::RedisError> =
                        conn.xack(&self.stream_key, &self.group, &[&entry.id]).await;
                    if let Err(err) = acked {
                        warn!(id = %entry.id, error = %err, "XACK failed");
                    }
                }
            }

            if handed_back {
                replay_pending = true;
                tokio::time::sleep(REPLAY_DELAY).await;
            }
        }

        debug!(stream_key = %self.stream_key, consumer = %self.consumer, "subscription closed");
    }
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
    async fn publish(&self, message: &[u8]) -> Result<(), BusError> {
        self.xadd(message).await?;
        Ok(())
    }

    /// Join the consumer group; the reader runs on the current tokio runtime.
    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().consume(tx));
        Subscription::new(rx)
    }
}
