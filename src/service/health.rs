//! Health check endpoints and monitoring
//!
//! Readiness and liveness probes plus the detailed component report served
//! on `/stats`.

use crate::fanout::{DispatcherHandle, RegistryStats};
use crate::store::MatchStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error};

const STORE_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value (0=unhealthy, 1=degraded, 2=healthy)
    pub fn as_gauge(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    /// The worse of two statuses
    fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.as_gauge() < self.as_gauge() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// What the probes look at. Cheap to clone.
#[derive(Clone)]
pub struct HealthProbe {
    service_name: String,
    is_running: Arc<RwLock<bool>>,
    store: Arc<dyn MatchStore>,
    /// Absent when this process serves no observers
    dispatcher: Option<DispatcherHandle>,
    started_at: DateTime<Utc>,
}

impl HealthProbe {
    pub fn new(
        service_name: impl Into<String>,
        is_running: Arc<RwLock<bool>>,
        store: Arc<dyn MatchStore>,
        dispatcher: Option<DispatcherHandle>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            is_running,
            store,
            dispatcher,
            started_at: Utc::now(),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Error message if not healthy
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Matches with at least one live observer
    pub observed_matches: usize,
    pub observers: usize,
    pub uptime_seconds: i64,
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub async fn check(probe: &HealthProbe) -> Result<Self> {
        let mut checks = vec![
            Self::check_service_running(probe).await,
            Self::check_store(probe).await,
        ];
        let mut registry = None;
        if probe.dispatcher.is_some() {
            let (check, stats) = Self::check_dispatcher(probe).await;
            checks.push(check);
            registry = stats;
        }

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));
        let registry = registry.unwrap_or_default();

        Ok(HealthCheck {
            status,
            service: probe.service_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            checks,
            stats: ServiceStats {
                observed_matches: registry.matches,
                observers: registry.observers,
                uptime_seconds: (Utc::now() - probe.started_at).num_seconds(),
            },
        })
    }

    /// Simple liveness check - just verify service is running
    pub async fn liveness_check(probe: &HealthProbe) -> Result<HealthStatus> {
        if probe.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness check - running and able to reach the store
    pub async fn readiness_check(probe: &HealthProbe) -> Result<HealthStatus> {
        if !probe.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }
        Ok(Self::check_store(probe).await.status)
    }

    async fn check_service_running(probe: &HealthProbe) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = if probe.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn check_store(probe: &HealthProbe) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) =
            match tokio::time::timeout(STORE_PING_TIMEOUT, probe.store.ping()).await {
                Ok(Ok(())) => (HealthStatus::Healthy, None),
                Ok(Err(e)) => {
                    error!("Store ping failed: {}", e);
                    (HealthStatus::Unhealthy, Some(e.to_string()))
                }
                Err(_) => (
                    HealthStatus::Degraded,
                    Some(format!("Store ping exceeded {:?}", STORE_PING_TIMEOUT)),
                ),
            };

        ComponentCheck {
            name: "store".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn check_dispatcher(probe: &HealthProbe) -> (ComponentCheck, Option<RegistryStats>) {
        let start = std::time::Instant::now();

        let result = match &probe.dispatcher {
            Some(dispatcher) => dispatcher.stats().await,
            None => Err(anyhow::anyhow!("no dispatcher")),
        };
        let (status, message, stats) = match result {
            Ok(stats) => (HealthStatus::Healthy, None, Some(stats)),
            Err(e) => {
                debug!("Dispatcher stats unavailable: {}", e);
                (HealthStatus::Degraded, Some(e.to_string()), None)
            }
        };

        let check = ComponentCheck {
            name: "fanout_dispatcher".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        (check, stats)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::FanoutDispatcher;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    fn probe(store: &MemoryStore, running: bool, dispatcher: Option<DispatcherHandle>) -> HealthProbe {
        HealthProbe::new(
            "sudoku-engine",
            Arc::new(RwLock::new(running)),
            Arc::new(store.clone()),
            dispatcher,
        )
    }

    #[tokio::test]
    async fn test_healthy_service() {
        let store = MemoryStore::new();
        let (_updates, updates_rx) = mpsc::channel(4);
        let (mut dispatcher, handle) = FanoutDispatcher::new(updates_rx, 4);
        tokio::spawn(async move { dispatcher.run().await });
        let (_, _observer) = handle.register("m1").await.unwrap();

        let health = HealthCheck::check(&probe(&store, true, Some(handle)))
            .await
            .unwrap();

        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.checks.len(), 3);
        assert_eq!(health.stats.observers, 1);
        assert!(health.to_json().unwrap().contains("fanout_dispatcher"));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unhealthy() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let probe = probe(&store, true, None);

        let health = HealthCheck::check(&probe).await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(
            HealthCheck::readiness_check(&probe).await.unwrap(),
            HealthStatus::Unhealthy
        );
        // Liveness does not depend on the store
        assert_eq!(
            HealthCheck::liveness_check(&probe).await.unwrap(),
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_stopped_service() {
        let store = MemoryStore::new();
        let probe = probe(&store, false, None);
        assert_eq!(
            HealthCheck::liveness_check(&probe).await.unwrap(),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_worst_status() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Unhealthy.worst(HealthStatus::Degraded),
            HealthStatus::Unhealthy
        );
    }
}
