//! Matchmaking observer
//!
//! One worker per announcement partition. Each worker joins the consumer
//! group, first replays whatever it claimed earlier without acknowledging,
//! then follows new entries. An entry is acknowledged only after its match
//! exists, so a crash between the two leaves it pending and it is replayed;
//! `ensure_match` being idempotent makes the replay harmless.

use crate::config::MatchmakingSettings;
use crate::engine::MatchStateEngine;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::partition::with_partition;
use crate::store::{MatchStore, ReadFrom, StreamEntry};
use crate::supervisor::Supervisor;
use crate::types::MatchmakingAnnouncement;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// What happened to one stream entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Created,
    ForeignGame,
}

pub struct MatchmakingObserver {
    engine: Arc<MatchStateEngine>,
    store: Arc<dyn MatchStore>,
    settings: MatchmakingSettings,
    block: Duration,
    is_running: Arc<RwLock<bool>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl MatchmakingObserver {
    pub fn new(
        engine: Arc<MatchStateEngine>,
        settings: MatchmakingSettings,
        is_running: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            store: engine.store(),
            engine,
            block: Duration::from_secs(settings.block_timeout_seconds),
            settings,
            is_running,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the longest wait for new entries
    pub fn with_block_timeout(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Physical stream of one partition
    pub fn stream_for(&self, partition: u32) -> String {
        with_partition(&self.settings.stream_prefix, partition)
    }

    /// Start one supervised worker per partition
    pub fn spawn_workers(self: &Arc<Self>, supervisor: &Supervisor) -> Vec<JoinHandle<()>> {
        (0..self.settings.partitions)
            .map(|partition| {
                let observer = self.clone();
                supervisor.spawn(format!("matchmaking-{}", partition), move || {
                    let observer = observer.clone();
                    async move { observer.run_partition(partition).await }
                })
            })
            .collect()
    }

    /// Consume one partition until the run flag clears
    pub async fn run_partition(&self, partition: u32) -> Result<()> {
        let stream = self.stream_for(partition);
        self.store
            .ensure_group(&stream, &self.settings.group_name)
            .await?;
        info!(
            "Consuming {} as '{}' in group '{}'",
            stream, self.settings.consumer_name, self.settings.group_name
        );

        while self.poll(&stream, ReadFrom::Pending).await? > 0 {}

        while *self.is_running.read().await {
            self.poll(&stream, ReadFrom::New).await?;
        }

        Ok(())
    }

    /// Fetch and handle one batch, returning how many entries were fetched.
    ///
    /// Entries are handled in order and the ones handled are acknowledged
    /// together. The first failure stops the batch: that entry and the rest
    /// stay pending and the error is returned.
    pub async fn poll(&self, stream: &str, from: ReadFrom) -> Result<usize> {
        let entries = self
            .store
            .read_group(
                stream,
                &self.settings.group_name,
                &self.settings.consumer_name,
                from,
                self.settings.batch_size,
                self.block,
            )
            .await?;

        let mut handled = Vec::with_capacity(entries.len());
        let mut failure = None;

        for entry in &entries {
            match self.claim(entry).await {
                Ok(claim) => {
                    self.record(match claim {
                        Claim::Created => "processed",
                        Claim::ForeignGame => "skipped",
                    });
                    handled.push(entry.id.clone());
                }
                Err(e) => {
                    error!("Failed to handle entry {} on {}: {:#}", entry.id, stream, e);
                    self.record("failed");
                    failure = Some(e);
                    break;
                }
            }
        }

        if !handled.is_empty() {
            let acked = self
                .store
                .ack(stream, &self.settings.group_name, &handled)
                .await?;
            debug!("Acknowledged {} entries on {}", acked, stream);
            if let Some(metrics) = &self.metrics {
                metrics.record_acked(acked);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(entries.len()),
        }
    }

    async fn claim(&self, entry: &StreamEntry) -> Result<Claim> {
        let announcement = MatchmakingAnnouncement::from_fields(&entry.fields)?;

        if announcement.game != self.settings.game_tag {
            debug!(
                "Skipping entry {} for game '{}'",
                entry.id, announcement.game
            );
            return Ok(Claim::ForeignGame);
        }

        self.engine.ensure_match(&announcement.match_id).await?;
        info!("Claimed match {} from matchmaking", announcement.match_id);
        Ok(Claim::Created)
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_matchmaking_entry(outcome);
        }
    }
}
