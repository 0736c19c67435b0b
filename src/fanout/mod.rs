//! Local fan-out of match updates to live observers

pub mod dispatcher;

pub use dispatcher::{DispatcherHandle, FanoutDispatcher, ObserverId, RegistryStats};
