//! Consumption of match-creation announcements from matchmaking

pub mod observer;

pub use observer::MatchmakingObserver;
