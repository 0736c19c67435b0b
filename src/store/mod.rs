//! Store abstraction: per-key optimistic transactions over hashes,
//! append-only streams with consumer groups, and publish/subscribe.
//!
//! `RedisStore` is the production backend; `MemoryStore` implements the same
//! semantics in process for tests and single-node runs.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisConfig, RedisStore};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

/// Result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Hash or stream field list
pub type Fields = Vec<(String, String)>;

/// Stream of published payloads on one channel
pub type Subscription = BoxStream<'static, StoreResult<String>>;

/// Store failures, split by whether a caller may retry them
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A watched key changed before commit; the transaction was not applied
    #[error("Transaction aborted: watched key {key} changed")]
    TxConflict { key: String },

    #[error("Store connection failed: {message}")]
    Connection { message: String },

    #[error("Store command failed: {message}")]
    Command { message: String },

    #[error("Consumer group {group} does not exist on stream {stream}")]
    NoGroup { stream: String, group: String },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::TxConflict { .. })
    }
}

/// Write queued inside an optimistic transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    SetFields { key: String, fields: Fields },
    StreamAppend { stream: String, fields: Fields },
    Publish { channel: String, payload: String },
}

/// One stream entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Where a consumer-group read starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries already delivered to this consumer but not acknowledged
    Pending,
    /// Entries never delivered to any consumer of the group
    New,
}

/// A watch on one key. Dropping it without commit abandons the watch.
#[async_trait]
pub trait WatchedTransaction: Send {
    /// Hash fields of the watched key (empty when the key does not exist)
    async fn read_fields(&mut self) -> StoreResult<HashMap<String, String>>;

    /// Apply `ops` atomically, or fail with `TxConflict` if the key changed
    async fn commit(self: Box<Self>, ops: Vec<TxOp>) -> StoreResult<()>;

    /// Release the watch without writing
    async fn discard(self: Box<Self>) -> StoreResult<()>;
}

/// Everything the engine needs from the external store
#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Round-trip check for health probes
    async fn ping(&self) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// All fields of a hash (empty when absent)
    async fn read_fields(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Begin an optimistic transaction watching `key`
    async fn watch(&self, key: &str) -> StoreResult<Box<dyn WatchedTransaction>>;

    /// Append an entry, returning its id
    async fn append(&self, stream: &str, fields: Fields) -> StoreResult<String>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    /// Create `group` on `stream` (and the stream itself) unless it exists
    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()>;

    /// Read entries for `consumer`. `New` reads wait up to `block` when the
    /// stream has nothing undelivered; an empty result means the wait ran out.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamEntry>>;

    /// Remove ids from the group's pending lists, returning how many were pending
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StoreResult<u64>;
}
