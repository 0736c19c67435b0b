//! Match lifecycle, move application and change propagation

pub mod match_engine;

pub use match_engine::MatchStateEngine;
