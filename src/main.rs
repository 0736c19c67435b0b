//! Main entry point for the sudoku match-state engine
//!
//! Loads configuration, starts the requested halves of the service and shuts
//! down gracefully on SIGINT/SIGTERM.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use sudoku_engine::config::{validate_config, AppConfig, StoreBackend};
use sudoku_engine::service::{AppState, HealthCheck, HealthProbe, HealthStatus, RunMode};
use tokio::signal;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Sudoku Engine - multiplayer sudoku match state over Redis
#[derive(Parser)]
#[command(
    name = "sudoku-engine",
    version,
    about = "Multiplayer sudoku match-state engine",
    long_about = "Creates sudoku matches announced by matchmaking, applies moves with optimistic \
                 concurrency on a shared store and pushes every state change to the WebSocket \
                 observers of the match."
)]
struct Args {
    /// Which halves of the service to run
    #[arg(long, value_enum, default_value_t = RunMode::All)]
    mode: RunMode,

    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Perform health check and exit
    #[arg(long, help = "Check store connectivity and exit with status code")]
    health_check: bool,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Redis URL override
    #[arg(long, value_name = "URL", help = "Override Redis connection URL")]
    redis_url: Option<String>,

    /// Store backend override
    #[arg(long, value_name = "BACKEND", help = "Store backend (redis, memory)")]
    store: Option<StoreBackend>,

    #[arg(long, value_name = "PORT", help = "Override game HTTP port")]
    http_port: Option<u16>,

    #[arg(long, value_name = "PORT", help = "Override metrics server port")]
    metrics_port: Option<u16>,

    /// Consumer identity inside the matchmaking group
    #[arg(long, value_name = "NAME", help = "Override matchmaking consumer name")]
    instance: Option<String>,

    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    /// Dry run mode (validate config and exit)
    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging; `RUST_LOG` wins over the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Ping the store and exit 0 when healthy, 1 otherwise
async fn perform_health_check(config: AppConfig) -> Result<()> {
    info!("Performing health check...");

    let store = AppState::connect_store(&config).await?;
    let probe = HealthProbe::new(
        config.service.name.clone(),
        Arc::new(RwLock::new(true)),
        store,
        None,
    );

    match HealthCheck::check(&probe).await {
        Ok(health) => {
            println!("Health Check: {}", health.status);
            for check in &health.checks {
                println!(
                    "  {}: {} ({} ms){}",
                    check.name,
                    check.status,
                    check.duration_ms,
                    check
                        .message
                        .as_deref()
                        .map(|m| format!(" - {}", m))
                        .unwrap_or_default()
                );
            }

            let code = if health.status == HealthStatus::Healthy { 0 } else { 1 };
            std::process::exit(code);
        }
        Err(e) => {
            error!("Health check failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

fn display_startup_banner(config: &AppConfig, mode: RunMode) {
    info!("Sudoku Engine");
    info!("   Service: {} (mode: {})", config.service.name, mode);
    info!("   Log level: {}", config.service.log_level);
    info!(
        "   Ports: http={} metrics={}",
        config.service.http_port, config.service.metrics_port
    );
    match config.store.backend {
        StoreBackend::Redis => info!("   Store: redis at {}", config.store.url),
        StoreBackend::Memory => info!("   Store: in-memory"),
    }
    info!(
        "   Namespace: {} ({} slots)",
        config.engine.key_namespace, config.engine.slots
    );
    if mode.consumes_matchmaking() && config.matchmaking.enabled {
        info!(
            "   Matchmaking: {} x{} as {} in group {}",
            config.matchmaking.stream_prefix,
            config.matchmaking.partitions,
            config.matchmaking.consumer_name,
            config.matchmaking.group_name
        );
    }
}

/// Load configuration from file or environment, then apply CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if let Some(redis_url) = &args.redis_url {
        config.store.url = redis_url.clone();
    }

    if let Some(backend) = args.store {
        config.store.backend = backend;
    }

    if let Some(http_port) = args.http_port {
        config.service.http_port = http_port;
    }

    if let Some(metrics_port) = args.metrics_port {
        config.service.metrics_port = metrics_port;
    }

    if let Some(instance) = &args.instance {
        config.matchmaking.consumer_name = instance.clone();
    }

    validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {:#}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if args.health_check {
        return perform_health_check(config).await;
    }

    display_startup_banner(&config, args.mode);

    if args.dry_run {
        info!("Configuration validation successful");
        info!("Dry run completed - exiting without starting service");
        return Ok(());
    }

    let mut app_state = match AppState::new(config.clone(), args.mode).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    info!("Sudoku Engine is running; press Ctrl+C to shut down");
    wait_for_shutdown_signal().await;
    info!("Shutdown signal received, beginning graceful shutdown...");

    match tokio::time::timeout(config.shutdown_timeout(), app_state.shutdown()).await {
        Ok(Ok(())) => info!("Graceful shutdown completed"),
        Ok(Err(e)) => error!("Shutdown failed: {}", e),
        Err(_) => warn!("Shutdown timeout exceeded, forcing exit"),
    }

    Ok(())
}
