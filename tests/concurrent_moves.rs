//! Concurrent move handling
//!
//! Many writers on one match key: every move either lands exactly once or is
//! reported as a conflict, and nothing is ever half-applied.

mod fixtures;

use std::sync::Arc;
use sudoku_engine::config::EngineSettings;
use sudoku_engine::puzzle::Grid;
use sudoku_engine::store::MemoryStore;
use sudoku_engine::{EngineError, MatchState, MoveOutcome};

use fixtures::{engine_settings, engine_with, first_cells, solution_digit, FixedPuzzleProvider};

fn patient_settings() -> EngineSettings {
    EngineSettings {
        max_move_attempts: 64,
        ..engine_settings()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_moves_on_distinct_cells_all_land() {
    let store = MemoryStore::new();
    let blanks = first_cells(12);
    let puzzles = Arc::new(FixedPuzzleProvider::new(&blanks));
    let engine = engine_with(&store, puzzles, patient_settings());
    engine.ensure_match("race").await.unwrap();

    let handles: Vec<_> = blanks
        .iter()
        .map(|&(row, col)| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .make_move("race", row, col, solution_digit(row, col))
                    .await
            })
        })
        .collect();

    let mut completed = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            MoveOutcome::Completed => completed += 1,
            MoveOutcome::Applied => {}
            MoveOutcome::Ignored => panic!("blank cell move must not be ignored"),
        }
    }

    let record = engine.get_match("race").await.unwrap().unwrap();
    let puzzle = Grid::parse(&record.puzzle).unwrap();
    assert_eq!(puzzle.num_unknowns(), 0);
    assert!(puzzle.is_solved());
    assert_eq!(record.state, MatchState::Ended);
    // Only the move that filled the last blank ended the match
    assert_eq!(completed, 1);

    let ended = store
        .stream_entries(&engine.games_stream_for("race"))
        .into_iter()
        .filter(|entry| entry.fields.get("state").map(String::as_str) == Some("ENDED"))
        .count();
    assert_eq!(ended, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bounded_retries_report_conflicts() {
    let store = MemoryStore::new();
    let blanks = first_cells(16);
    let puzzles = Arc::new(FixedPuzzleProvider::new(&blanks));
    let engine = engine_with(&store, puzzles, engine_settings());
    engine.ensure_match("race").await.unwrap();

    let handles: Vec<_> = blanks
        .iter()
        .map(|&(row, col)| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let result = engine
                    .make_move("race", row, col, solution_digit(row, col))
                    .await;
                ((row, col), result)
            })
        })
        .collect();

    let mut landed = Vec::new();
    for handle in handles {
        let (cell, result) = handle.await.unwrap();
        match result {
            Ok(_) => landed.push(cell),
            Err(e) => match e.downcast_ref::<EngineError>() {
                Some(EngineError::Conflict { attempts, .. }) => assert_eq!(*attempts, 2),
                other => panic!("unexpected failure: {:?}", other),
            },
        }
    }

    // The stored grid holds exactly the moves that reported success
    let record = engine.get_match("race").await.unwrap().unwrap();
    let puzzle = Grid::parse(&record.puzzle).unwrap();
    for &(row, col) in &blanks {
        assert_eq!(
            !puzzle.is_blank(row, col),
            landed.contains(&(row, col)),
            "cell ({}, {})",
            row,
            col
        );
    }
    assert!(!landed.is_empty());
}

#[tokio::test]
async fn test_concurrent_creation_yields_one_record() {
    let store = MemoryStore::new();
    let puzzles = Arc::new(FixedPuzzleProvider::new(&first_cells(5)));
    let engine = engine_with(&store, puzzles.clone(), patient_settings());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.ensure_match("twice").await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let record = engine.get_match("twice").await.unwrap().unwrap();
    assert_eq!(record.puzzle, record.original);
    assert_eq!(store.commit_count(), 1);
    assert!(puzzles.generated() >= 1);
}
