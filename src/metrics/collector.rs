//! Metrics collection using Prometheus
//!
//! Every counter the engine, the matchmaking workers and the fan-out loop
//! touch lives in one registry owned by `MetricsCollector`.

use crate::types::MoveOutcome;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the engine
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
    service_metrics: ServiceMetrics,
    move_metrics: MoveMetrics,
    matchmaking_metrics: MatchmakingMetrics,
    fanout_metrics: FanoutMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,

    /// Supervised worker restarts
    pub worker_restarts_total: IntCounterVec,
}

/// Match lifecycle and move metrics
#[derive(Clone)]
pub struct MoveMetrics {
    /// Moves by outcome
    pub moves_total: IntCounterVec,

    /// Optimistic transaction retries after a conflict
    pub move_retries_total: IntCounter,

    /// End-to-end move latency
    pub move_duration_seconds: Histogram,

    /// Matches written by EnsureMatch
    pub matches_created_total: IntCounter,

    /// Readiness and ended announcements
    pub announcements_total: IntCounterVec,
}

/// Matchmaking stream consumption metrics
#[derive(Clone)]
pub struct MatchmakingMetrics {
    /// Stream entries by outcome
    pub entries_total: IntCounterVec,

    /// Entries acknowledged to the consumer group
    pub acked_total: IntCounter,
}

/// Update propagation metrics
#[derive(Clone)]
pub struct FanoutMetrics {
    pub updates_published_total: IntCounter,
    pub updates_delivered_total: IntCounter,

    /// Updates not delivered to an observer, by reason
    pub updates_dropped_total: IntCounterVec,

    /// Registered observers
    pub observers: IntGauge,

    /// Matches with at least one observer
    pub observed_matches: IntGauge,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let move_metrics = MoveMetrics::new(&registry)?;
        let matchmaking_metrics = MatchmakingMetrics::new(&registry)?;
        let fanout_metrics = FanoutMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            move_metrics,
            matchmaking_metrics,
            fanout_metrics,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn moves(&self) -> &MoveMetrics {
        &self.move_metrics
    }

    pub fn matchmaking(&self) -> &MatchmakingMetrics {
        &self.matchmaking_metrics
    }

    pub fn fanout(&self) -> &FanoutMetrics {
        &self.fanout_metrics
    }

    /// Record a finished move
    pub fn record_move(&self, outcome: MoveOutcome, duration: Duration) {
        self.move_metrics
            .moves_total
            .with_label_values(&[outcome.as_label()])
            .inc();

        self.move_metrics
            .move_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Record a move that failed with an error
    pub fn record_move_failure(&self, reason: &str, duration: Duration) {
        self.move_metrics
            .moves_total
            .with_label_values(&[reason])
            .inc();

        self.move_metrics
            .move_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn record_move_retry(&self) {
        self.move_metrics.move_retries_total.inc();
    }

    pub fn record_match_created(&self) {
        self.move_metrics.matches_created_total.inc();
    }

    /// Record an announcement written to a games stream
    pub fn record_announcement(&self, state: &str) {
        self.move_metrics
            .announcements_total
            .with_label_values(&[state])
            .inc();
    }

    /// Record a matchmaking entry (`processed`, `skipped` or `failed`)
    pub fn record_matchmaking_entry(&self, outcome: &str) {
        self.matchmaking_metrics
            .entries_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_acked(&self, count: u64) {
        self.matchmaking_metrics.acked_total.inc_by(count);
    }

    pub fn record_update_published(&self) {
        self.fanout_metrics.updates_published_total.inc();
    }

    pub fn record_update_delivered(&self) {
        self.fanout_metrics.updates_delivered_total.inc();
    }

    /// Record an update an observer did not receive (`full` or `closed`)
    pub fn record_update_dropped(&self, reason: &str) {
        self.fanout_metrics
            .updates_dropped_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Mirror the dispatcher registry size
    pub fn set_registry_size(&self, matches: usize, observers: usize) {
        self.fanout_metrics.observed_matches.set(matches as i64);
        self.fanout_metrics.observers.set(observers as i64);
    }

    pub fn record_worker_restart(&self, worker: &str) {
        self.service_metrics
            .worker_restarts_total
            .with_label_values(&[worker])
            .inc();
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("sudoku_engine_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "sudoku_engine_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("sudoku_engine_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        let worker_restarts_total = IntCounterVec::new(
            Opts::new(
                "sudoku_engine_worker_restarts_total",
                "Supervised worker restarts",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(worker_restarts_total.clone()))?;

        Ok(Self {
            uptime_seconds,
            health_status,
            component_health,
            worker_restarts_total,
        })
    }
}

impl MoveMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let moves_total = IntCounterVec::new(
            Opts::new("sudoku_engine_moves_total", "Moves by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(moves_total.clone()))?;

        let move_retries_total = IntCounter::new(
            "sudoku_engine_move_retries_total",
            "Move transactions retried after a conflict",
        )?;
        registry.register(Box::new(move_retries_total.clone()))?;

        let move_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sudoku_engine_move_duration_seconds",
                "Move processing time",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(move_duration_seconds.clone()))?;

        let matches_created_total = IntCounter::new(
            "sudoku_engine_matches_created_total",
            "Matches created",
        )?;
        registry.register(Box::new(matches_created_total.clone()))?;

        let announcements_total = IntCounterVec::new(
            Opts::new(
                "sudoku_engine_announcements_total",
                "Match announcements written",
            ),
            &["state"],
        )?;
        registry.register(Box::new(announcements_total.clone()))?;

        Ok(Self {
            moves_total,
            move_retries_total,
            move_duration_seconds,
            matches_created_total,
            announcements_total,
        })
    }
}

impl MatchmakingMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let entries_total = IntCounterVec::new(
            Opts::new(
                "sudoku_engine_matchmaking_entries_total",
                "Matchmaking stream entries by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(entries_total.clone()))?;

        let acked_total = IntCounter::new(
            "sudoku_engine_matchmaking_acked_total",
            "Matchmaking entries acknowledged",
        )?;
        registry.register(Box::new(acked_total.clone()))?;

        Ok(Self {
            entries_total,
            acked_total,
        })
    }
}

impl FanoutMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let updates_published_total = IntCounter::new(
            "sudoku_engine_updates_published_total",
            "Update events published",
        )?;
        registry.register(Box::new(updates_published_total.clone()))?;

        let updates_delivered_total = IntCounter::new(
            "sudoku_engine_updates_delivered_total",
            "Update events delivered to observers",
        )?;
        registry.register(Box::new(updates_delivered_total.clone()))?;

        let updates_dropped_total = IntCounterVec::new(
            Opts::new(
                "sudoku_engine_updates_dropped_total",
                "Update events an observer did not receive",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(updates_dropped_total.clone()))?;

        let observers = IntGauge::new("sudoku_engine_observers", "Registered observers")?;
        registry.register(Box::new(observers.clone()))?;

        let observed_matches = IntGauge::new(
            "sudoku_engine_observed_matches",
            "Matches with at least one observer",
        )?;
        registry.register(Box::new(observed_matches.clone()))?;

        Ok(Self {
            updates_published_total,
            updates_delivered_total,
            updates_dropped_total,
            observers,
            observed_matches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        let _service = collector.service();
        let _moves = collector.moves();
        let _matchmaking = collector.matchmaking();
        let _fanout = collector.fanout();
    }

    #[test]
    fn test_move_recording() {
        let collector = MetricsCollector::new().unwrap();

        collector.record_move(MoveOutcome::Applied, Duration::from_millis(2));
        collector.record_move(MoveOutcome::Applied, Duration::from_millis(3));
        collector.record_move(MoveOutcome::Ignored, Duration::from_millis(1));
        collector.record_move_failure("conflict", Duration::from_millis(5));
        collector.record_move_retry();

        let moves = &collector.moves().moves_total;
        assert_eq!(moves.with_label_values(&["applied"]).get(), 2);
        assert_eq!(moves.with_label_values(&["ignored"]).get(), 1);
        assert_eq!(moves.with_label_values(&["conflict"]).get(), 1);
        assert_eq!(collector.moves().move_retries_total.get(), 1);
        assert_eq!(collector.moves().move_duration_seconds.get_sample_count(), 4);
    }

    #[test]
    fn test_registry_size_gauges() {
        let collector = MetricsCollector::new().unwrap();
        collector.set_registry_size(2, 5);
        assert_eq!(collector.fanout().observed_matches.get(), 2);
        assert_eq!(collector.fanout().observers.get(), 5);
    }

    #[test]
    fn test_registered_metrics_are_gathered() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_worker_restart("update-subscriber");
        collector.record_matchmaking_entry("processed");

        let names: Vec<String> = collector
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"sudoku_engine_worker_restarts_total".to_string()));
        assert!(names.contains(&"sudoku_engine_matchmaking_entries_total".to_string()));
    }

    #[test]
    fn test_metrics_timer() {
        let collector = MetricsCollector::new().unwrap();
        let timer = collector.start_timer();

        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed() >= Duration::from_millis(10));
        assert!(timer.stop() >= Duration::from_millis(10));
    }
}
