//! Sudoku Engine - match-state engine for multiplayer sudoku
//!
//! Matches are created from matchmaking announcements, mutated with
//! optimistic transactions on a shared store and every change is fanned out
//! to the live observers of the match.

pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod matchmaking;
pub mod metrics;
pub mod partition;
pub mod puzzle;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{EngineError, Result};
pub use types::*;

// Re-export key components
pub use engine::MatchStateEngine;
pub use fanout::{DispatcherHandle, FanoutDispatcher};
pub use store::{MatchStore, MemoryStore, RedisStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
