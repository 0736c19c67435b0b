//! In-process store with the same transactional, stream and pub/sub
//! semantics as the Redis backend

use crate::store::{
    Fields, MatchStore, ReadFrom, StoreError, StoreResult, StreamEntry, Subscription, TxOp,
    WatchedTransaction,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct GroupState {
    /// Number of stream entries already handed to some consumer
    delivered: usize,
    /// Per-consumer ids delivered but not acknowledged, in delivery order
    pending: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct MemoryStream {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    /// Bumped on every write to a key; a watch compares against it at commit
    versions: HashMap<String, u64>,
    streams: HashMap<String, MemoryStream>,
    next_entry_seq: u64,
    injected_conflicts: u32,
    unavailable: bool,
    commits: u64,
}

impl Inner {
    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable {
            return Err(StoreError::Connection {
                message: "memory store marked unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn set_fields(&mut self, key: &str, fields: Fields) {
        self.hashes.entry(key.to_string()).or_default().extend(fields);
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn append(&mut self, stream: &str, fields: Fields) -> String {
        self.next_entry_seq += 1;
        let id = format!("{}-0", self.next_entry_seq);
        self.streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push(StreamEntry {
                id: id.clone(),
                fields: fields.into_iter().collect(),
            });
        id
    }
}

/// In-memory `MatchStore`.
///
/// Clones share state, so a test can hand one clone to the engine and keep
/// another to inspect or perturb the store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    appended: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Command {
            message: "memory store lock poisoned".to_string(),
        })
    }

    fn sender(&self, channel: &str) -> StoreResult<broadcast::Sender<String>> {
        let mut channels = self.channels.lock().map_err(|_| StoreError::Command {
            message: "memory store channel lock poisoned".to_string(),
        })?;
        Ok(channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone())
    }

    fn deliver(&self, channel: &str, payload: String) -> StoreResult<()> {
        // No subscribers is not an error, same as PUBLISH returning 0
        let _ = self.sender(channel)?.send(payload);
        Ok(())
    }

    /// Make the next `count` commits fail as if a concurrent writer got there first
    pub fn inject_conflicts(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.injected_conflicts = count;
        }
    }

    /// While set, every operation fails with a connection error
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    /// Write a hash outside of any transaction
    pub fn put_fields(&self, key: &str, fields: Fields) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.set_fields(key, fields);
        }
    }

    /// Every entry ever appended to `stream`
    pub fn stream_entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .streams
                    .get(stream)
                    .map(|s| s.entries.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Ids `consumer` holds unacknowledged in `group`
    pub fn pending_ids(&self, stream: &str, group: &str, consumer: &str) -> Vec<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| {
                inner
                    .streams
                    .get(stream)
                    .and_then(|s| s.groups.get(group))
                    .and_then(|g| g.pending.get(consumer).cloned())
            })
            .unwrap_or_default()
    }

    /// Number of successful transactional commits
    pub fn commit_count(&self) -> u64 {
        self.inner.lock().map(|inner| inner.commits).unwrap_or(0)
    }

    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut inner = self.lock()?;
        inner.check_available()?;

        let no_group = || StoreError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let state = inner.streams.get_mut(stream).ok_or_else(no_group)?;
        let entries = &state.entries;
        let group_state = state.groups.get_mut(group).ok_or_else(no_group)?;

        let end = (group_state.delivered + count.max(1)).min(entries.len());
        let batch: Vec<StreamEntry> = entries[group_state.delivered..end].to_vec();
        group_state.delivered = end;
        group_state
            .pending
            .entry(consumer.to_string())
            .or_default()
            .extend(batch.iter().map(|e| e.id.clone()));

        Ok(batch)
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.lock()?.check_available()
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let inner = self.lock()?;
        inner.check_available()?;
        Ok(inner.hashes.get(key).is_some_and(|h| !h.is_empty()))
    }

    async fn read_fields(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let inner = self.lock()?;
        inner.check_available()?;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn watch(&self, key: &str) -> StoreResult<Box<dyn WatchedTransaction>> {
        let inner = self.lock()?;
        inner.check_available()?;
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            key: key.to_string(),
            version: inner.version(key),
        }))
    }

    async fn append(&self, stream: &str, fields: Fields) -> StoreResult<String> {
        let id = {
            let mut inner = self.lock()?;
            inner.check_available()?;
            inner.append(stream, fields)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        self.lock()?.check_available()?;
        self.deliver(channel, payload.to_string())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        self.lock()?.check_available()?;
        let receiver = self.sender(channel)?.subscribe();
        let channel = channel.to_string();

        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let channel = channel.clone();
            async move {
                match item {
                    Ok(payload) => Some(Ok(payload)),
                    Err(e) => {
                        warn!("Subscriber on '{}' fell behind: {}", channel, e);
                        None
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.check_available()?;
        let groups = &mut inner.streams.entry(stream.to_string()).or_default().groups;
        if !groups.contains_key(group) {
            groups.insert(group.to_string(), GroupState::default());
            debug!("Created consumer group '{}' on '{}'", group, stream);
        }
        Ok(())
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
        match from {
            ReadFrom::Pending => {
                let inner = self.lock()?;
                inner.check_available()?;
                let state = inner
                    .streams
                    .get(stream)
                    .and_then(|s| s.groups.get(group).map(|g| (s, g)));
                let Some((state, group_state)) = state else {
                    return Err(StoreError::NoGroup {
                        stream: stream.to_string(),
                        group: group.to_string(),
                    });
                };
                let pending = group_state.pending.get(consumer).cloned().unwrap_or_default();
                Ok(state
                    .entries
                    .iter()
                    .filter(|e| pending.contains(&e.id))
                    .take(count.max(1))
                    .cloned()
                    .collect())
            }
            ReadFrom::New => {
                // Register for the wakeup before looking, so an append between
                // the check and the wait is not missed.
                let notified = self.appended.notified();
                let batch = self.take_new(stream, group, consumer, count)?;
                if !batch.is_empty() || block.is_zero() {
                    return Ok(batch);
                }
                if tokio::time::timeout(block, notified).await.is_err() {
                    return Ok(Vec::new());
                }
                self.take_new(stream, group, consumer, count)
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        inner.check_available()?;
        let Some(group_state) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let mut acked = 0;
        for pending in group_state.pending.values_mut() {
            let before = pending.len();
            pending.retain(|id| !ids.contains(id));
            acked += (before - pending.len()) as u64;
        }
        Ok(acked)
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    key: String,
    version: u64,
}

#[async_trait]
impl WatchedTransaction for MemoryTransaction {
    async fn read_fields(&mut self) -> StoreResult<HashMap<String, String>> {
        self.store.read_fields(&self.key).await
    }

    async fn commit(self: Box<Self>, ops: Vec<TxOp>) -> StoreResult<()> {
        let mut publishes = Vec::new();
        let mut appended = false;
        {
            let mut inner = self.store.lock()?;
            inner.check_available()?;

            if inner.injected_conflicts > 0 {
                inner.injected_conflicts -= 1;
                return Err(StoreError::TxConflict {
                    key: self.key.clone(),
                });
            }
            if inner.version(&self.key) != self.version {
                return Err(StoreError::TxConflict {
                    key: self.key.clone(),
                });
            }

            for op in ops {
                match op {
                    TxOp::SetFields { key, fields } => inner.set_fields(&key, fields),
                    TxOp::StreamAppend { stream, fields } => {
                        inner.append(&stream, fields);
                        appended = true;
                    }
                    TxOp::Publish { channel, payload } => publishes.push((channel, payload)),
                }
            }
            inner.commits += 1;
        }

        if appended {
            self.store.appended.notify_waiters();
        }
        for (channel, payload) in publishes {
            self.store.deliver(&channel, payload)?;
        }
        Ok(())
    }

    async fn discard(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
