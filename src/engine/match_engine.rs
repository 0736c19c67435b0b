//! Match state engine
//!
//! Owns the match record in the store. Moves are applied with a watched
//! read-modify-write: the record is read under a watch, the new grid is
//! computed locally and the write, the ended announcement and the update
//! event are committed in one transaction. A concurrent writer on the same
//! key aborts the commit and the move is retried from a fresh read, up to
//! `max_move_attempts` times.

use crate::config::EngineSettings;
use crate::error::{EngineError, Result};
use crate::metrics::MetricsCollector;
use crate::partition::Partitioner;
use crate::puzzle::{generate_puzzle, Grid, PuzzleProvider, SIZE};
use crate::store::{MatchStore, StoreError, TxOp, WatchedTransaction};
use crate::types::{Announcement, MatchRecord, MatchState, MoveOutcome, UpdateEvent};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine over one store namespace
pub struct MatchStateEngine {
    store: Arc<dyn MatchStore>,
    puzzles: Arc<dyn PuzzleProvider>,
    namespace: String,
    partitioner: Partitioner,
    max_attempts: u32,
    metrics: Option<Arc<MetricsCollector>>,
}

impl MatchStateEngine {
    pub fn new(
        store: Arc<dyn MatchStore>,
        puzzles: Arc<dyn PuzzleProvider>,
        config: &EngineSettings,
    ) -> Self {
        Self {
            store,
            puzzles,
            namespace: config.key_namespace.clone(),
            partitioner: Partitioner::new(config.slots),
            max_attempts: config.max_move_attempts.max(1),
            metrics: None,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> Arc<dyn MatchStore> {
        self.store.clone()
    }

    /// Store key of a match record: `<namespace><mid>-{<partition>}`
    pub fn key_for(&self, mid: &str) -> String {
        self.partitioner
            .name_for(&format!("{}{}", self.namespace, mid), mid)
    }

    /// Readiness/ended stream carrying `mid`'s announcements
    pub fn games_stream_for(&self, mid: &str) -> String {
        self.partitioner
            .name_for(&format!("{}games", self.namespace), mid)
    }

    /// Channel carrying update events for every match
    pub fn updates_channel(&self) -> String {
        format!("{}game-updates", self.namespace)
    }

    /// Create the match if it does not exist yet, then announce it as ready.
    ///
    /// Safe to call any number of times: an existing record is left untouched
    /// and only the READY announcement is repeated.
    pub async fn ensure_match(&self, mid: &str) -> Result<()> {
        let key = self.key_for(mid);

        if !self.store.exists(&key).await? {
            self.create_match(mid, &key).await?;
        }

        let stream = self.games_stream_for(mid);
        self.store
            .append(&stream, Announcement::ready(mid).to_fields())
            .await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_announcement("READY");
        }
        debug!("Announced match {} ready on {}", mid, stream);

        Ok(())
    }

    async fn create_match(&self, mid: &str, key: &str) -> Result<()> {
        let puzzles = self.puzzles.clone();
        let puzzle = tokio::task::spawn_blocking(move || generate_puzzle(puzzles.as_ref()))
            .await
            .map_err(|e| EngineError::InternalError {
                message: format!("Puzzle generation failed: {}", e),
            })?;

        let mut tx = self.store.watch(key).await?;
        if !tx.read_fields().await?.is_empty() {
            discard(tx, key).await;
            debug!("Match {} appeared while generating its puzzle", mid);
            return Ok(());
        }

        let record = MatchRecord::new(puzzle.to_string());
        let ops = vec![TxOp::SetFields {
            key: key.to_string(),
            fields: record.to_fields(),
        }];

        match tx.commit(ops).await {
            Ok(()) => {
                info!(
                    "Created match {} with {} blank cells",
                    mid,
                    puzzle.num_unknowns()
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_match_created();
                }
                Ok(())
            }
            // Another engine created it first; its record stands
            Err(e) if e.is_conflict() => {
                debug!("Match {} was created concurrently", mid);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current record of a match, `None` if it was never created
    pub async fn get_match(&self, mid: &str) -> Result<Option<MatchRecord>> {
        let fields = self.store.read_fields(&self.key_for(mid)).await?;
        Ok(MatchRecord::from_fields(&fields)?)
    }

    /// Fill one cell of a match.
    ///
    /// Moves on a clue cell or on an ended match succeed without writing
    /// anything. A move that leaves the grid full and valid ends the match in
    /// the same transaction.
    pub async fn make_move(
        &self,
        mid: &str,
        row: usize,
        col: usize,
        value: char,
    ) -> Result<MoveOutcome> {
        let digit = validate_move(row, col, value)?;
        let timer = self.metrics.as_ref().map(|metrics| metrics.start_timer());

        let result = self.apply_move(mid, row, col, digit).await;

        if let (Some(metrics), Some(timer)) = (&self.metrics, timer) {
            let elapsed = timer.stop();
            match &result {
                Ok(outcome) => metrics.record_move(*outcome, elapsed),
                Err(e) => {
                    let reason = match e.downcast_ref::<EngineError>() {
                        Some(EngineError::Conflict { .. }) => "conflict",
                        Some(EngineError::MatchNotFound { .. }) => "not_found",
                        _ => "error",
                    };
                    metrics.record_move_failure(reason, elapsed);
                }
            }
        }

        result
    }

    async fn apply_move(&self, mid: &str, row: usize, col: usize, digit: u8) -> Result<MoveOutcome> {
        let key = self.key_for(mid);

        for attempt in 1..=self.max_attempts {
            let mut tx = self.store.watch(&key).await?;

            let fields = tx.read_fields().await?;
            let Some(mut record) = MatchRecord::from_fields(&fields)? else {
                discard(tx, &key).await;
                return Err(EngineError::MatchNotFound {
                    mid: mid.to_string(),
                }
                .into());
            };

            if record.is_ended() {
                discard(tx, &key).await;
                debug!("Move on ended match {} ignored", mid);
                return Ok(MoveOutcome::Ignored);
            }

            let original = Grid::parse(&record.original)?;
            if original.get(row, col).is_some() {
                discard(tx, &key).await;
                debug!("Move on clue cell ({}, {}) of match {} ignored", row, col, mid);
                return Ok(MoveOutcome::Ignored);
            }

            let mut puzzle = Grid::parse(&record.puzzle)?;
            puzzle.set(row, col, digit);
            record.puzzle = puzzle.to_string();

            let completed = puzzle.is_solved();
            let mut ops = Vec::with_capacity(3);
            if completed {
                record.state = MatchState::Ended;
            }
            ops.push(TxOp::SetFields {
                key: key.clone(),
                fields: record.mutable_fields().into_iter().collect(),
            });
            if completed {
                ops.push(TxOp::StreamAppend {
                    stream: self.games_stream_for(mid),
                    fields: Announcement::ended(mid).to_fields(),
                });
            }
            ops.push(TxOp::Publish {
                channel: self.updates_channel(),
                payload: UpdateEvent::new(mid, record.mutable_fields()).to_json()?,
            });

            match tx.commit(ops).await {
                Ok(()) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_update_published();
                        if completed {
                            metrics.record_announcement("ENDED");
                        }
                    }
                    if completed {
                        info!("Match {} solved", mid);
                        return Ok(MoveOutcome::Completed);
                    }
                    debug!("Applied {} at ({}, {}) on match {}", digit, row, col, mid);
                    return Ok(MoveOutcome::Applied);
                }
                Err(e) if e.is_conflict() => {
                    warn!(
                        "Move on match {} lost a race (attempt {}/{})",
                        mid, attempt, self.max_attempts
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_move_retry();
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Conflict {
            mid: mid.to_string(),
            attempts: self.max_attempts,
        }
        .into())
    }

    /// Forward every update event on the channel into `tx`.
    ///
    /// Returns `Ok` once the receiving side is gone. A payload that does not
    /// decode, or the subscription ending, is an error.
    pub async fn run_update_subscriber(&self, tx: mpsc::Sender<UpdateEvent>) -> Result<()> {
        let channel = self.updates_channel();
        let mut subscription = self.store.subscribe(&channel).await?;
        info!("Listening for match updates on {}", channel);

        while let Some(payload) = subscription.next().await {
            let event = UpdateEvent::from_json(&payload?)?;
            if tx.send(event).await.is_err() {
                info!("Update receiver closed, stopping subscriber");
                return Ok(());
            }
        }

        Err(StoreError::Connection {
            message: format!("subscription to {} ended", channel),
        }
        .into())
    }
}

async fn discard(tx: Box<dyn WatchedTransaction>, key: &str) {
    if let Err(e) = tx.discard().await {
        warn!("Failed to release watch on {}: {}", key, e);
    }
}

/// Bounds-check a move and turn its value into a digit
fn validate_move(row: usize, col: usize, value: char) -> std::result::Result<u8, EngineError> {
    if row >= SIZE || col >= SIZE {
        return Err(EngineError::InvalidMove {
            reason: format!("cell ({}, {}) is outside the grid", row, col),
        });
    }
    match value {
        '1'..='9' => Ok(value as u8 - b'0'),
        other => Err(EngineError::InvalidMove {
            reason: format!("{:?} is not a digit between 1 and 9", other),
        }),
    }
}
