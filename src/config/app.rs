//! Main application configuration
//!
//! Settings come from a TOML file or from environment variables layered over
//! the defaults; command line flags are applied on top by the binary and the
//! result is checked by `validate_config`.

use crate::utils::host_consumer_name;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub store: StoreSettings,
    pub engine: EngineSettings,
    pub matchmaking: MatchmakingSettings,
    pub supervisor: SupervisorSettings,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service name for logging and metrics
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Port of the game endpoints
    pub http_port: u16,
    /// Port of the health and metrics endpoints
    pub metrics_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
}

/// Which store implementation backs the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    /// In-process store; state is lost on exit
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow!("Unknown store backend: {}", other)),
        }
    }
}

/// Store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Redis URL
    pub url: String,
    /// Connection timeout in seconds
    pub connection_timeout_seconds: u64,
    /// Connection attempts before giving up at startup
    pub max_retry_attempts: u32,
    /// Initial reconnect delay in milliseconds
    pub retry_delay_ms: u64,
    /// Idle connections kept for optimistic transactions
    pub tx_pool_size: usize,
}

/// Match engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Prefix of every key, stream and channel the engine owns
    pub key_namespace: String,
    /// Partition count of match keys and games streams
    pub slots: u32,
    /// Optimistic transaction attempts per move
    pub max_move_attempts: u32,
    /// Capacity of the queue between the update subscriber and the dispatcher
    pub update_queue_capacity: usize,
    /// Per-observer buffer before updates are dropped for that observer
    pub observer_buffer: usize,
}

/// Matchmaking stream consumption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingSettings {
    /// Run the partition workers
    pub enabled: bool,
    /// This process's identity inside the consumer group
    pub consumer_name: String,
    /// Base name of the announcement streams
    pub stream_prefix: String,
    pub partitions: u32,
    pub group_name: String,
    /// Only announcements carrying this game tag are claimed
    pub game_tag: String,
    /// Entries fetched per read
    pub batch_size: usize,
    /// Longest wait for new entries before re-polling, in seconds
    pub block_timeout_seconds: u64,
}

/// Worker restart policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "sudoku-engine".to_string(),
            log_level: "info".to_string(),
            http_port: 8082,
            metrics_port: 8080,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://localhost:6379".to_string(),
            connection_timeout_seconds: 10,
            max_retry_attempts: 5,
            retry_delay_ms: 1000,
            tx_pool_size: 16,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            key_namespace: "sudoku-engine:".to_string(),
            slots: 3,
            max_move_attempts: 2,
            update_queue_capacity: 1024,
            observer_buffer: 64,
        }
    }
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            consumer_name: host_consumer_name("sudoku-engine"),
            stream_prefix: "mm:matches".to_string(),
            partitions: 3,
            group_name: "sudoku-engine".to_string(),
            game_tag: "sudoku".to_string(),
            batch_size: 10,
            block_timeout_seconds: 60,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// Parse `name` from `lookup` if it is set
fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("Invalid {} value: {}", name, raw)),
        None => Ok(None),
    }
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from a TOML file. Missing sections keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        validate_config(&config)?;
        Ok(config)
    }

    /// Defaults overridden by whatever `lookup` knows about
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        // Service settings
        if let Some(name) = lookup("SERVICE_NAME") {
            config.service.name = name;
        }
        if let Some(log_level) = lookup("LOG_LEVEL") {
            config.service.log_level = log_level;
        }
        if let Some(port) = parse_var(&lookup, "HTTP_PORT")? {
            config.service.http_port = port;
        }
        if let Some(port) = parse_var(&lookup, "METRICS_PORT")? {
            config.service.metrics_port = port;
        }
        if let Some(timeout) = parse_var(&lookup, "SHUTDOWN_TIMEOUT_SECONDS")? {
            config.service.shutdown_timeout_seconds = timeout;
        }

        // Store settings
        if let Some(backend) = parse_var(&lookup, "STORE_BACKEND")? {
            config.store.backend = backend;
        }
        if let Some(url) = lookup("REDIS_URL") {
            config.store.url = url;
        }
        if let Some(timeout) = parse_var(&lookup, "STORE_CONNECTION_TIMEOUT_SECONDS")? {
            config.store.connection_timeout_seconds = timeout;
        }
        if let Some(retries) = parse_var(&lookup, "STORE_MAX_RETRY_ATTEMPTS")? {
            config.store.max_retry_attempts = retries;
        }
        if let Some(delay) = parse_var(&lookup, "STORE_RETRY_DELAY_MS")? {
            config.store.retry_delay_ms = delay;
        }

        // Engine settings
        if let Some(namespace) = lookup("KEY_NAMESPACE") {
            config.engine.key_namespace = namespace;
        }
        if let Some(slots) = parse_var(&lookup, "SLOTS")? {
            config.engine.slots = slots;
        }
        if let Some(attempts) = parse_var(&lookup, "MAX_MOVE_ATTEMPTS")? {
            config.engine.max_move_attempts = attempts;
        }
        if let Some(capacity) = parse_var(&lookup, "UPDATE_QUEUE_CAPACITY")? {
            config.engine.update_queue_capacity = capacity;
        }

        // Matchmaking settings
        if let Some(enabled) = parse_var(&lookup, "MATCHMAKING_ENABLED")? {
            config.matchmaking.enabled = enabled;
        }
        if let Some(consumer) = lookup("CONSUMER_NAME") {
            config.matchmaking.consumer_name = consumer;
        }
        if let Some(prefix) = lookup("MM_STREAM_PREFIX") {
            config.matchmaking.stream_prefix = prefix;
        }
        if let Some(partitions) = parse_var(&lookup, "MM_PARTITIONS")? {
            config.matchmaking.partitions = partitions;
        }
        if let Some(group) = lookup("MM_GROUP_NAME") {
            config.matchmaking.group_name = group;
        }
        if let Some(tag) = lookup("GAME_TAG") {
            config.matchmaking.game_tag = tag;
        }
        if let Some(batch) = parse_var(&lookup, "MM_BATCH_SIZE")? {
            config.matchmaking.batch_size = batch;
        }
        if let Some(block) = parse_var(&lookup, "MM_BLOCK_TIMEOUT_SECONDS")? {
            config.matchmaking.block_timeout_seconds = block;
        }

        // Supervisor settings
        if let Some(initial) = parse_var(&lookup, "SUPERVISOR_INITIAL_BACKOFF_MS")? {
            config.supervisor.initial_backoff_ms = initial;
        }
        if let Some(max) = parse_var(&lookup, "SUPERVISOR_MAX_BACKOFF_MS")? {
            config.supervisor.max_backoff_ms = max;
        }

        validate_config(&config)?;
        Ok(config)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_timeout_seconds)
    }

    /// Get store connection timeout as Duration
    pub fn store_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.store.connection_timeout_seconds)
    }

    /// Get matchmaking block timeout as Duration
    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.matchmaking.block_timeout_seconds)
    }

    /// Get (initial, max) supervisor backoff
    pub fn supervisor_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.supervisor.initial_backoff_ms),
            Duration::from_millis(self.supervisor.max_backoff_ms),
        )
    }
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.service.log_level)),
    }

    if config.service.http_port == 0 || config.service.metrics_port == 0 {
        return Err(anyhow!("Ports cannot be 0"));
    }
    if config.service.http_port == config.service.metrics_port {
        return Err(anyhow!(
            "HTTP and metrics ports must differ (both {})",
            config.service.http_port
        ));
    }
    if config.service.shutdown_timeout_seconds == 0 {
        return Err(anyhow!("Shutdown timeout must be greater than 0"));
    }

    if config.store.backend == StoreBackend::Redis && config.store.url.is_empty() {
        return Err(anyhow!("Redis URL cannot be empty"));
    }
    if config.store.connection_timeout_seconds == 0 {
        return Err(anyhow!("Store connection timeout must be greater than 0"));
    }

    if config.engine.key_namespace.is_empty() {
        return Err(anyhow!("Key namespace cannot be empty"));
    }
    if config.engine.slots == 0 {
        return Err(anyhow!("Slot count must be greater than 0"));
    }
    if config.engine.max_move_attempts == 0 {
        return Err(anyhow!("Move attempts must be greater than 0"));
    }
    if config.engine.update_queue_capacity == 0 || config.engine.observer_buffer == 0 {
        return Err(anyhow!("Queue capacities must be greater than 0"));
    }

    if config.matchmaking.enabled {
        if config.matchmaking.consumer_name.is_empty() {
            return Err(anyhow!("Consumer name cannot be empty"));
        }
        if config.matchmaking.stream_prefix.is_empty() || config.matchmaking.group_name.is_empty()
        {
            return Err(anyhow!("Matchmaking stream prefix and group name are required"));
        }
        if config.matchmaking.partitions == 0 {
            return Err(anyhow!("Matchmaking partition count must be greater than 0"));
        }
        if config.matchmaking.batch_size == 0 {
            return Err(anyhow!("Matchmaking batch size must be greater than 0"));
        }
    }

    if config.supervisor.initial_backoff_ms == 0
        || config.supervisor.initial_backoff_ms > config.supervisor.max_backoff_ms
    {
        return Err(anyhow!(
            "Supervisor backoff must satisfy 0 < initial ({}) <= max ({})",
            config.supervisor.initial_backoff_ms,
            config.supervisor.max_backoff_ms
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.service.http_port, 8082);
        assert_eq!(config.engine.slots, 3);
        assert_eq!(config.engine.max_move_attempts, 2);
        assert_eq!(config.matchmaking.stream_prefix, "mm:matches");
        assert!(config.matchmaking.consumer_name.starts_with("sudoku-engine"));
        // A restarted process must come back under the same identity
        assert_eq!(
            config.matchmaking.consumer_name,
            AppConfig::default().matchmaking.consumer_name
        );
    }

    #[test]
    fn test_lookup_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("HTTP_PORT", "9000"),
            ("STORE_BACKEND", "memory"),
            ("GAME_TAG", "sudoku-v2"),
            ("MATCHMAKING_ENABLED", "false"),
        ]))
        .unwrap();

        assert_eq!(config.service.http_port, 9000);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.matchmaking.game_tag, "sudoku-v2");
        assert!(!config.matchmaking.enabled);
    }

    #[test]
    fn test_lookup_rejects_garbage() {
        let err = AppConfig::from_lookup(lookup(&[("SLOTS", "three")])).unwrap_err();
        assert!(err.to_string().contains("SLOTS"));

        assert!(AppConfig::from_lookup(lookup(&[("SLOTS", "0")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("STORE_BACKEND", "etcd")])).is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [service]
            http_port = 9100

            [store]
            backend = "memory"

            [matchmaking]
            consumer_name = "engine-a"
            "#,
        )
        .unwrap();

        assert_eq!(config.service.http_port, 9100);
        assert_eq!(config.service.metrics_port, 8080);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.matchmaking.consumer_name, "engine-a");
        assert_eq!(config.matchmaking.batch_size, 10);
        assert_eq!(config.engine.key_namespace, "sudoku-engine:");
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("sudoku-engine-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[engine]\nslots = 5\n").unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.engine.slots, 5);

        std::fs::remove_file(&path).unwrap();
        assert!(AppConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        config.service.metrics_port = config.service.http_port;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.supervisor.initial_backoff_ms = 60_000;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.service.log_level = "loud".to_string();
        assert!(validate_config(&config).is_err());

        // Matchmaking fields are not checked when the workers are off
        let mut config = AppConfig::default();
        config.matchmaking.enabled = false;
        config.matchmaking.consumer_name.clear();
        assert!(validate_config(&config).is_ok());
    }
}
