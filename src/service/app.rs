//! Main application state and service coordination
//!
//! `AppState` builds the store, the engine and the fan-out dispatcher, then
//! runs the long-lived workers under the supervisor next to the game and
//! health servers.

use crate::config::{validate_config, AppConfig, StoreBackend};
use crate::engine::MatchStateEngine;
use crate::fanout::{DispatcherHandle, FanoutDispatcher};
use crate::matchmaking::MatchmakingObserver;
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::puzzle::{PuzzleProvider, SudokuProvider};
use crate::service::health::{HealthCheck, HealthProbe, HealthStatus};
use crate::service::http::{GameApiState, GameServer, GameServerConfig};
use crate::store::{MatchStore, MemoryStore, RedisConfig, RedisStore};
use crate::supervisor::Supervisor;
use crate::types::UpdateEvent;
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

const HEALTH_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Store connection error: {message}")]
    StoreConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },
}

/// Which halves of the service this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RunMode {
    /// Game endpoints and matchmaking consumption
    All,
    /// Game endpoints, update subscriber and fan-out only
    Server,
    /// Matchmaking consumption only
    Observer,
}

impl RunMode {
    pub fn serves_games(&self) -> bool {
        matches!(self, RunMode::All | RunMode::Server)
    }

    pub fn consumes_matchmaking(&self) -> bool {
        matches!(self, RunMode::All | RunMode::Observer)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::All => write!(f, "all"),
            RunMode::Server => write!(f, "server"),
            RunMode::Observer => write!(f, "observer"),
        }
    }
}

/// Game-serving half: dispatcher loop plus the queue feeding it
struct FanoutParts {
    dispatcher: Arc<Mutex<FanoutDispatcher>>,
    handle: DispatcherHandle,
    updates: mpsc::Sender<UpdateEvent>,
    server: Arc<GameServer>,
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,
    mode: RunMode,
    store: Arc<dyn MatchStore>,
    engine: Arc<MatchStateEngine>,
    metrics_service: Arc<MetricsService>,
    fanout: Option<FanoutParts>,
    supervisor: Supervisor,
    background_tasks: Vec<JoinHandle<()>>,
    /// Partition workers, joined on shutdown before anything is aborted
    matchmaking_workers: Vec<JoinHandle<()>>,
    is_running: Arc<RwLock<bool>>,
}

impl AppState {
    /// Connect to the configured store and build every component
    pub async fn new(config: AppConfig, mode: RunMode) -> Result<Self, ServiceError> {
        info!(
            "Initializing {} (mode={}, store={:?})",
            config.service.name, mode, config.store.backend
        );

        validate_config(&config).map_err(|e| ServiceError::Configuration {
            message: format!("{:#}", e),
        })?;

        let store = Self::connect_store(&config).await?;
        Self::with_store(config, mode, store, Arc::new(SudokuProvider::new()))
    }

    /// Build every component over an existing store
    pub fn with_store(
        config: AppConfig,
        mode: RunMode,
        store: Arc<dyn MatchStore>,
        puzzles: Arc<dyn PuzzleProvider>,
    ) -> Result<Self, ServiceError> {
        let is_running = Arc::new(RwLock::new(false));
        let collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let engine = Arc::new(
            MatchStateEngine::new(store.clone(), puzzles, &config.engine)
                .with_metrics(collector.clone()),
        );

        let fanout = mode
            .serves_games()
            .then(|| Self::initialize_fanout(&config, engine.clone(), collector.clone()));

        let probe = HealthProbe::new(
            config.service.name.clone(),
            is_running.clone(),
            store.clone(),
            fanout.as_ref().map(|parts| parts.handle.clone()),
        );
        let health_server = HealthServer::new(
            HealthServerConfig {
                port: config.service.metrics_port,
                host: "0.0.0.0".to_string(),
            },
            collector.clone(),
        )
        .with_probe(probe);
        let metrics_service = Arc::new(MetricsService::new(collector.clone(), Arc::new(health_server)));

        let (initial, max) = config.supervisor_backoff();
        let supervisor = Supervisor::new(is_running.clone(), initial, max).with_metrics(collector);

        Ok(Self {
            config,
            mode,
            store,
            engine,
            metrics_service,
            fanout,
            supervisor,
            background_tasks: Vec::new(),
            matchmaking_workers: Vec::new(),
            is_running,
        })
    }

    /// Start servers and workers
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting {} in {} mode", self.config.service.name, self.mode);
        *self.is_running.write().await = true;

        self.start_metrics_service().await;

        if self.fanout.is_some() {
            self.start_game_serving().await;
        }

        if self.mode.consumes_matchmaking() {
            if self.config.matchmaking.enabled {
                self.start_matchmaking();
            } else {
                info!("Matchmaking consumption disabled - skipping partition workers");
            }
        }

        self.start_health_refresh();

        info!(
            "{} started with {} background tasks",
            self.config.service.name,
            self.background_tasks.len() + self.matchmaking_workers.len()
        );
        Ok(())
    }

    /// Stop servers and workers
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of {}", self.config.service.name);
        *self.is_running.write().await = false;

        if let Some(fanout) = &self.fanout {
            if let Err(e) = fanout.server.stop().await {
                warn!("Failed to stop game server: {}", e);
            }
        }

        self.stop_matchmaking_workers().await;
        self.stop_background_tasks().await;

        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        }

        info!("{} shutdown completed", self.config.service.name);
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn engine(&self) -> Arc<MatchStateEngine> {
        self.engine.clone()
    }

    pub fn store(&self) -> Arc<dyn MatchStore> {
        self.store.clone()
    }

    /// Handle for attaching observers; absent in observer mode
    pub fn dispatcher(&self) -> Option<DispatcherHandle> {
        self.fanout.as_ref().map(|parts| parts.handle.clone())
    }

    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    /// Open the configured store backend
    pub async fn connect_store(config: &AppConfig) -> Result<Arc<dyn MatchStore>, ServiceError> {
        match config.store.backend {
            StoreBackend::Memory => {
                warn!("Using the in-memory store; match state is lost on exit");
                Ok(Arc::new(MemoryStore::new()))
            }
            StoreBackend::Redis => {
                info!("Connecting to Redis: {}", config.store.url);
                let redis_config = RedisConfig {
                    url: config.store.url.clone(),
                    max_retries: config.store.max_retry_attempts,
                    retry_delay_ms: config.store.retry_delay_ms,
                    connection_timeout: config.store_connection_timeout(),
                    tx_pool_size: config.store.tx_pool_size,
                };
                let store = RedisStore::connect(redis_config).await.map_err(|e| {
                    ServiceError::StoreConnection {
                        message: e.to_string(),
                    }
                })?;
                Ok(Arc::new(store))
            }
        }
    }

    fn initialize_fanout(
        config: &AppConfig,
        engine: Arc<MatchStateEngine>,
        collector: Arc<MetricsCollector>,
    ) -> FanoutParts {
        let (updates, updates_rx) = mpsc::channel(config.engine.update_queue_capacity.max(1));
        let (dispatcher, handle) =
            FanoutDispatcher::new(updates_rx, config.engine.observer_buffer);
        let dispatcher = Arc::new(Mutex::new(dispatcher.with_metrics(collector)));

        let server = Arc::new(GameServer::new(
            GameServerConfig {
                port: config.service.http_port,
                host: "0.0.0.0".to_string(),
            },
            GameApiState {
                engine,
                dispatcher: handle.clone(),
            },
        ));

        FanoutParts {
            dispatcher,
            handle,
            updates,
            server,
        }
    }

    async fn start_metrics_service(&mut self) {
        let metrics_service = self.metrics_service.clone();
        let port = self.config.service.metrics_port;

        self.background_tasks.push(tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Metrics service failed: {:#}", e);
            }
        }));

        // Give the listener a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("Metrics service started on port {}", port);
    }

    /// Update subscriber, dispatcher loop and game endpoints
    async fn start_game_serving(&mut self) {
        let Some(fanout) = &self.fanout else {
            return;
        };

        let engine = self.engine.clone();
        let updates = fanout.updates.clone();
        let subscriber = self.supervisor.spawn("update-subscriber", move || {
            let engine = engine.clone();
            let updates = updates.clone();
            async move { engine.run_update_subscriber(updates).await }
        });

        let dispatcher = fanout.dispatcher.clone();
        let dispatch_loop = self.supervisor.spawn("fanout", move || {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.lock().await.run().await }
        });

        let server = fanout.server.clone();
        let port = self.config.service.http_port;
        let game_server = tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Game server failed: {:#}", e);
            }
        });

        self.background_tasks
            .extend([subscriber, dispatch_loop, game_server]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("Game endpoints started on port {}", port);
    }

    fn start_matchmaking(&mut self) {
        let settings = self.config.matchmaking.clone();
        info!(
            "Starting {} matchmaking workers on {} as '{}'",
            settings.partitions, settings.stream_prefix, settings.consumer_name
        );

        let observer = Arc::new(
            MatchmakingObserver::new(self.engine.clone(), settings, self.is_running.clone())
                .with_metrics(self.metrics_service.collector()),
        );
        self.matchmaking_workers = observer.spawn_workers(&self.supervisor);
    }

    /// Periodically fold the health report into the gauges
    fn start_health_refresh(&mut self) {
        let collector = self.metrics_service.collector();
        let probe = HealthProbe::new(
            self.config.service.name.clone(),
            self.is_running.clone(),
            self.store.clone(),
            self.dispatcher(),
        );
        let is_running = self.is_running.clone();

        self.background_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_REFRESH_INTERVAL);
            let started = tokio::time::Instant::now();

            while *is_running.read().await {
                interval.tick().await;
                collector
                    .service()
                    .uptime_seconds
                    .set(started.elapsed().as_secs() as i64);

                match HealthCheck::check(&probe).await {
                    Ok(health) => {
                        collector.update_health_status(health.status.as_gauge());
                        for check in &health.checks {
                            collector.update_component_health(
                                &check.name,
                                check.status == HealthStatus::Healthy,
                            );
                        }
                        debug!("Health refreshed: {}", health.status);
                    }
                    Err(e) => warn!("Health refresh failed: {}", e),
                }
            }
        }));
    }

    /// Give partition workers one read interval to finish their batch
    async fn stop_matchmaking_workers(&mut self) {
        if self.matchmaking_workers.is_empty() {
            return;
        }

        let grace = (self.config.block_timeout() + Duration::from_secs(1))
            .min(self.config.shutdown_timeout() / 2);
        info!(
            "Waiting up to {:?} for {} matchmaking workers",
            grace,
            self.matchmaking_workers.len()
        );
        let workers = std::mem::take(&mut self.matchmaking_workers);
        let aborted = join_or_abort(workers, grace).await;
        if aborted > 0 {
            warn!("Aborted {} matchmaking workers still running after {:?}", aborted, grace);
        }
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            return;
        }

        info!("Stopping {} background tasks...", task_count);
        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wait up to `grace` for `workers` to return, then abort the stragglers.
/// Returns how many were aborted.
async fn join_or_abort(mut workers: Vec<JoinHandle<()>>, grace: Duration) -> usize {
    let joined = tokio::time::timeout(grace, join_all(workers.iter_mut())).await;
    if joined.is_ok() {
        return 0;
    }

    let mut aborted = 0;
    for worker in &workers {
        if !worker.is_finished() {
            worker.abort();
            aborted += 1;
        }
    }
    aborted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::puzzle::grid::tests::SOLVED;
    use crate::puzzle::provider::MockPuzzleProvider;
    use crate::puzzle::{Grid, Mask};
    use crate::store::{Fields, MemoryStore};
    use crate::types::MatchmakingAnnouncement;

    fn puzzles() -> Arc<dyn PuzzleProvider> {
        let mut mock = MockPuzzleProvider::new();
        mock.expect_generate_solution()
            .returning(|| Grid::parse(SOLVED).unwrap());
        mock.expect_minimal_mask().returning(|_| {
            let mut mask = Mask::full();
            mask.set(3, 3, false);
            mask
        });
        Arc::new(mock)
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.store.backend = StoreBackend::Memory;
        config.service.http_port = 0;
        config.service.metrics_port = 0;
        config.matchmaking.partitions = 1;
        config.matchmaking.block_timeout_seconds = 1;
        config
    }

    #[tokio::test]
    async fn test_observer_mode_has_no_dispatcher() {
        let store = Arc::new(MemoryStore::new());
        let state =
            AppState::with_store(test_config(), RunMode::Observer, store, puzzles()).unwrap();

        assert!(state.dispatcher().is_none());
        assert!(!state.is_running().await);
    }

    #[tokio::test]
    async fn test_full_pipeline() {
        let store = MemoryStore::new();
        let config = test_config();
        let mut state =
            AppState::with_store(config.clone(), RunMode::All, Arc::new(store.clone()), puzzles())
                .unwrap();
        state.start().await.unwrap();
        assert!(state.is_running().await);

        // Announce a match on the only matchmaking partition
        let stream = format!("{}-{{0}}", config.matchmaking.stream_prefix);
        let fields: Fields = MatchmakingAnnouncement {
            game: "sudoku".to_string(),
            match_id: "p1".to_string(),
        }
        .to_fields();
        store.append(&stream, fields).await.unwrap();

        let engine = state.engine();
        let mut record = None;
        for _ in 0..100 {
            record = engine.get_match("p1").await.unwrap();
            if record.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(record.is_some(), "matchmaking worker never created the match");

        let (_, mut observer) = state.dispatcher().unwrap().register("p1").await.unwrap();
        // Let the dispatcher take the registration before the move publishes
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.make_move("p1", 3, 3, '1').await.unwrap();

        let update = tokio::time::timeout(Duration::from_secs(1), observer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.mid, "p1");

        state.shutdown().await.unwrap();
        assert!(!state.is_running().await);
    }

    #[tokio::test]
    async fn test_shutdown_joins_workers_that_see_the_flag() {
        let flag = Arc::new(RwLock::new(true));
        let seen = flag.clone();
        let cooperative = tokio::spawn(async move {
            while *seen.read().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let stuck = tokio::spawn(std::future::pending::<()>());
        *flag.write().await = false;

        let aborted = join_or_abort(vec![cooperative], Duration::from_secs(1)).await;
        assert_eq!(aborted, 0);

        let aborted = join_or_abort(vec![stuck], Duration::from_millis(20)).await;
        assert_eq!(aborted, 1);
    }

    #[tokio::test]
    async fn test_observer_mode_workers_stop_within_block_interval() {
        let store = Arc::new(MemoryStore::new());
        let mut state =
            AppState::with_store(test_config(), RunMode::Observer, store, puzzles()).unwrap();
        state.start().await.unwrap();
        assert_eq!(state.matchmaking_workers.len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let worker = state.matchmaking_workers[0].abort_handle();
        tokio::time::timeout(Duration::from_secs(5), state.shutdown())
            .await
            .unwrap()
            .unwrap();
        assert!(worker.is_finished());
        assert!(state.matchmaking_workers.is_empty());
    }

    #[test]
    fn test_run_mode_halves() {
        assert!(RunMode::All.serves_games() && RunMode::All.consumes_matchmaking());
        assert!(RunMode::Server.serves_games() && !RunMode::Server.consumes_matchmaking());
        assert!(!RunMode::Observer.serves_games() && RunMode::Observer.consumes_matchmaking());
    }
}
