//! Puzzle generation and validation
//!
//! The engine only sees the `PuzzleProvider` seam and the `Grid` helpers;
//! the backtracking generator behind it can be swapped freely.

pub mod grid;
pub mod provider;

pub use grid::{Grid, GridViolation, Mask, SIZE};
pub use provider::{generate_puzzle, PuzzleProvider, SudokuProvider};
