//! Test fixtures shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sudoku_engine::config::{EngineSettings, MatchmakingSettings};
use sudoku_engine::puzzle::{Grid, Mask, PuzzleProvider};
use sudoku_engine::store::MemoryStore;
use sudoku_engine::MatchStateEngine;

/// A valid, completely filled grid
pub const SOLVED: &str = "534678912\n\
                          672195348\n\
                          198342567\n\
                          859761423\n\
                          426853791\n\
                          713924856\n\
                          961537284\n\
                          287419635\n\
                          345286179";

/// Provider that always hands out `SOLVED` with a fixed set of blank cells
pub struct FixedPuzzleProvider {
    blanks: Vec<(usize, usize)>,
    generated: AtomicUsize,
}

impl FixedPuzzleProvider {
    pub fn new(blanks: &[(usize, usize)]) -> Self {
        Self {
            blanks: blanks.to_vec(),
            generated: AtomicUsize::new(0),
        }
    }

    /// How many solutions were requested, i.e. how many creations were attempted
    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }
}

impl PuzzleProvider for FixedPuzzleProvider {
    fn generate_solution(&self) -> Grid {
        self.generated.fetch_add(1, Ordering::SeqCst);
        solved()
    }

    fn minimal_mask(&self, _solution: &Grid) -> Mask {
        let mut mask = Mask::full();
        for (row, col) in &self.blanks {
            mask.set(*row, *col, false);
        }
        mask
    }
}

pub fn solved() -> Grid {
    Grid::parse(SOLVED).expect("fixture grid parses")
}

/// Correct digit of a cell, as a move value
pub fn solution_digit(row: usize, col: usize) -> char {
    let digit = solved().get(row, col).expect("fixture grid is full");
    (b'0' + digit) as char
}

/// A digit that is wrong for the cell
pub fn wrong_digit(row: usize, col: usize) -> char {
    let right = solved().get(row, col).expect("fixture grid is full");
    (b'0' + right % 9 + 1) as char
}

/// The first `count` cells in row-major order
pub fn first_cells(count: usize) -> Vec<(usize, usize)> {
    (0..count).map(|i| (i / 9, i % 9)).collect()
}

pub fn engine_settings() -> EngineSettings {
    EngineSettings {
        key_namespace: "it:".to_string(),
        ..EngineSettings::default()
    }
}

pub fn matchmaking_settings(partitions: u32) -> MatchmakingSettings {
    MatchmakingSettings {
        consumer_name: "it-consumer".to_string(),
        stream_prefix: "it:mm".to_string(),
        partitions,
        group_name: "it-group".to_string(),
        block_timeout_seconds: 1,
        ..MatchmakingSettings::default()
    }
}

/// Engine over `store` whose puzzles have `blanks` empty
pub fn engine(store: &MemoryStore, blanks: &[(usize, usize)]) -> Arc<MatchStateEngine> {
    engine_with(store, Arc::new(FixedPuzzleProvider::new(blanks)), engine_settings())
}

pub fn engine_with(
    store: &MemoryStore,
    puzzles: Arc<FixedPuzzleProvider>,
    settings: EngineSettings,
) -> Arc<MatchStateEngine> {
    Arc::new(MatchStateEngine::new(
        Arc::new(store.clone()),
        puzzles,
        &settings,
    ))
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
