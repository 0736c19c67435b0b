//! Restart policy for long-running workers
//!
//! A worker is an async closure returning `Result<()>`. When it fails it is
//! torn down and started again after an exponential backoff; a clean `Ok`
//! return ends supervision. The backoff resets once a run outlives the
//! maximum delay, so a worker that fails rarely always restarts quickly.

use crate::error::{EngineError, Result};
use crate::metrics::MetricsCollector;
use crate::utils::next_backoff;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Spawns workers under a shared run flag
#[derive(Clone)]
pub struct Supervisor {
    is_running: Arc<RwLock<bool>>,
    initial_backoff: Duration,
    max_backoff: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Supervisor {
    pub fn new(is_running: Arc<RwLock<bool>>, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            is_running,
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run `worker` on its own task until it returns `Ok` or the run flag clears
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, worker: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let supervisor = self.clone();
        let name = name.into();
        tokio::spawn(async move { supervisor.supervise(name, worker).await })
    }

    /// Supervise `worker` on the current task
    pub async fn supervise<F, Fut>(&self, name: String, mut worker: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut backoff = self.initial_backoff;
        info!("Worker '{}' started", name);

        while *self.is_running.read().await {
            let started = Instant::now();
            let result = worker().await;

            if !*self.is_running.read().await {
                break;
            }

            match result {
                Ok(()) => {
                    info!("Worker '{}' finished", name);
                    return;
                }
                Err(e) => {
                    if started.elapsed() > self.max_backoff {
                        backoff = self.initial_backoff;
                    }
                    let poisoned = e
                        .downcast_ref::<EngineError>()
                        .is_some_and(EngineError::is_fatal_for_worker);
                    if poisoned {
                        error!("Worker '{}' halted on undecodable input: {:#}", name, e);
                    } else {
                        error!("Worker '{}' failed: {:#}", name, e);
                    }
                    warn!("Restarting worker '{}' in {:?}", name, backoff);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_worker_restart(&name);
                    }

                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff, self.max_backoff);
                }
            }
        }

        info!("Worker '{}' stopped", name);
    }
}
