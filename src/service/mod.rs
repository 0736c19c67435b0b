//! Service layer for the sudoku engine
//!
//! Application state, the game HTTP surface and the health probes.

pub mod app;
pub mod health;
pub mod http;

pub use app::{AppState, RunMode, ServiceError};
pub use health::{HealthCheck, HealthProbe, HealthStatus};
pub use http::{GameApiState, GameServer, GameServerConfig};
