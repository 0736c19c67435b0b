//! Redis-backed store
//!
//! Plain commands share one multiplexed connection. Optimistic transactions
//! need WATCH/MULTI/EXEC on a connection nobody else is using, so they borrow
//! one from a small idle pool. Blocking stream reads get a connection per
//! stream so a parked XREADGROUP never stalls unrelated commands.

use crate::store::{
    Fields, MatchStore, ReadFrom, StoreError, StoreResult, StreamEntry, Subscription, TxOp,
    WatchedTransaction,
};
use crate::utils::next_backoff;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use redis::{Client, RedisError, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Connection settings for the Redis backend
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Bound on each connection attempt
    pub connection_timeout: Duration,
    /// Idle transaction connections kept for reuse
    pub tx_pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_retries: 5,
            retry_delay_ms: 1000,
            connection_timeout: Duration::from_secs(10),
            tx_pool_size: 16,
        }
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Connection {
                message: err.to_string(),
            }
        } else {
            StoreError::Command {
                message: err.to_string(),
            }
        }
    }
}

/// `MatchStore` over a Redis server
pub struct RedisStore {
    client: Client,
    shared: MultiplexedConnection,
    tx_pool: Arc<Mutex<Vec<MultiplexedConnection>>>,
    stream_connections: Mutex<HashMap<String, MultiplexedConnection>>,
    config: RedisConfig,
}

impl RedisStore {
    /// Connect with exponential backoff
    pub async fn connect(config: RedisConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let shared = Self::connect_with_retry(&client, &config).await?;

        Ok(Self {
            client,
            shared,
            tx_pool: Arc::new(Mutex::new(Vec::new())),
            stream_connections: Mutex::new(HashMap::new()),
            config,
        })
    }

    async fn connect_with_retry(
        client: &Client,
        config: &RedisConfig,
    ) -> StoreResult<MultiplexedConnection> {
        let mut retry_count = 0;
        let mut delay = Duration::from_millis(config.retry_delay_ms);

        loop {
            let attempt = tokio::time::timeout(
                config.connection_timeout,
                client.get_multiplexed_async_connection(),
            )
            .await;
            let failure = match attempt {
                Ok(Ok(connection)) => {
                    info!("Connected to Redis at {}", config.url);
                    return Ok(connection);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", config.connection_timeout),
            };

            retry_count += 1;
            if retry_count > config.max_retries {
                error!(
                    "Failed to connect to Redis after {} retries",
                    config.max_retries
                );
                return Err(StoreError::Connection {
                    message: format!("Max retries exceeded: {}", failure),
                });
            }

            warn!(
                "Redis connection attempt {} failed: {}. Retrying in {:?}",
                retry_count, failure, delay
            );

            sleep(delay).await;
            delay = next_backoff(delay, MAX_RETRY_DELAY);
        }
    }

    fn shared(&self) -> MultiplexedConnection {
        self.shared.clone()
    }

    async fn tx_connection(&self) -> StoreResult<MultiplexedConnection> {
        let pooled = self.tx_pool.lock().ok().and_then(|mut pool| pool.pop());
        match pooled {
            Some(connection) => Ok(connection),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    async fn stream_connection(&self, stream: &str) -> StoreResult<MultiplexedConnection> {
        let cached = self
            .stream_connections
            .lock()
            .ok()
            .and_then(|connections| connections.get(stream).cloned());
        if let Some(connection) = cached {
            return Ok(connection);
        }

        let connection = self.client.get_multiplexed_async_connection().await?;
        if let Ok(mut connections) = self.stream_connections.lock() {
            connections.insert(stream.to_string(), connection.clone());
        }
        Ok(connection)
    }

    fn forget_stream_connection(&self, stream: &str) {
        if let Ok(mut connections) = self.stream_connections.lock() {
            connections.remove(stream);
        }
    }
}

fn string_fields(map: HashMap<String, Value>) -> StoreResult<HashMap<String, String>> {
    map.into_iter()
        .map(|(field, value)| Ok((field, redis::from_redis_value::<String>(&value)?)))
        .collect()
}

fn into_entries(reply: Option<StreamReadReply>) -> StoreResult<Vec<StreamEntry>> {
    let Some(reply) = reply else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for key in reply.keys {
        for stream_id in key.ids {
            entries.push(StreamEntry {
                id: stream_id.id,
                fields: string_fields(stream_id.map)?,
            });
        }
    }
    Ok(entries)
}

#[async_trait]
impl MatchStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.shared()).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let count: u64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.shared())
            .await?;
        Ok(count == 1)
    }

    async fn read_fields(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.shared())
            .await?;
        Ok(fields)
    }

    async fn watch(&self, key: &str) -> StoreResult<Box<dyn WatchedTransaction>> {
        let mut connection = self.tx_connection().await?;
        let _: () = redis::cmd("WATCH")
            .arg(key)
            .query_async(&mut connection)
            .await?;

        Ok(Box::new(RedisTransaction {
            connection,
            key: key.to_string(),
            pool: self.tx_pool.clone(),
            pool_size: self.config.tx_pool_size,
        }))
    }

    async fn append(&self, stream: &str, fields: Fields) -> StoreResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in &fields {
            cmd.arg(field).arg(value);
        }
        let id: String = cmd.query_async(&mut self.shared()).await?;
        Ok(id)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut self.shared())
            .await?;
        debug!("Published to '{}' ({} receivers)", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!("Subscribed to channel '{}'", channel);

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().map_err(StoreError::from));
        Ok(Box::pin(stream))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let result: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.shared())
            .await;

        match result {
            Ok(()) => {
                info!("Created consumer group '{}' on '{}'", group, stream);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group '{}' already exists on '{}'", group, stream);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count.max(1));

        let start_id = match from {
            ReadFrom::Pending => "0",
            ReadFrom::New => {
                if !block.is_zero() {
                    cmd.arg("BLOCK").arg(block.as_millis() as u64);
                }
                ">"
            }
        };
        cmd.arg("STREAMS").arg(stream).arg(start_id);

        let mut connection = self.stream_connection(stream).await?;
        let reply: Result<Option<StreamReadReply>, RedisError> =
            cmd.query_async(&mut connection).await;

        match reply {
            Ok(reply) => into_entries(reply),
            Err(e) if e.code() == Some("NOGROUP") => Err(StoreError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            }),
            Err(e) => {
                self.forget_stream_connection(stream);
                Err(e.into())
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids)
            .query_async(&mut self.shared())
            .await?;
        Ok(acked)
    }
}

struct RedisTransaction {
    connection: MultiplexedConnection,
    key: String,
    pool: Arc<Mutex<Vec<MultiplexedConnection>>>,
    pool_size: usize,
}

impl RedisTransaction {
    /// Return the connection for reuse; only called once no watch is active
    fn release(self) {
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < self.pool_size {
                pool.push(self.connection);
            }
        }
    }
}

#[async_trait]
impl WatchedTransaction for RedisTransaction {
    async fn read_fields(&mut self) -> StoreResult<HashMap<String, String>> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&self.key)
            .query_async(&mut self.connection)
            .await?;
        Ok(fields)
    }

    async fn commit(mut self: Box<Self>, ops: Vec<TxOp>) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                TxOp::SetFields { key, fields } => {
                    let cmd = pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        cmd.arg(field).arg(value);
                    }
                    cmd.ignore();
                }
                TxOp::StreamAppend { stream, fields } => {
                    let cmd = pipe.cmd("XADD").arg(stream).arg("*");
                    for (field, value) in fields {
                        cmd.arg(field).arg(value);
                    }
                    cmd.ignore();
                }
                TxOp::Publish { channel, payload } => {
                    pipe.cmd("PUBLISH").arg(channel).arg(payload).ignore();
                }
            }
        }

        // EXEC answers nil when a watched key changed
        let result: Result<Option<Value>, RedisError> =
            pipe.query_async(&mut self.connection).await;

        match result {
            Ok(Some(_)) => {
                self.release();
                Ok(())
            }
            Ok(None) => {
                let key = self.key.clone();
                self.release();
                Err(StoreError::TxConflict { key })
            }
            // Connection state unknown: do not return it to the pool
            Err(e) => Err(e.into()),
        }
    }

    async fn discard(mut self: Box<Self>) -> StoreResult<()> {
        let _: () = redis::cmd("UNWATCH")
            .query_async(&mut self.connection)
            .await?;
        self.release();
        Ok(())
    }
}
