//! Configuration management for the sudoku engine
//!
//! Loading from file or environment, defaults and validation.

pub mod app;

pub use app::{
    validate_config, AppConfig, EngineSettings, MatchmakingSettings, ServiceSettings,
    StoreBackend, StoreSettings, SupervisorSettings,
};
