//! Fan-out dispatcher
//!
//! The registry of observers is owned by a single loop. Registrations,
//! unregistrations and updates all arrive as messages, so the registry needs
//! no lock and every observer sees updates in the order they were published.
//! Commands are drained before updates: a registration that was sent before
//! an update is queued is always in place when that update is delivered.

use crate::error::{EngineError, Result};
use crate::metrics::MetricsCollector;
use crate::types::{MatchId, UpdateEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Identity of one registered observer
pub type ObserverId = u64;

const COMMAND_CAPACITY: usize = 256;

/// Registry size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RegistryStats {
    /// Matches with at least one observer
    pub matches: usize,
    pub observers: usize,
}

enum Command {
    Register {
        mid: MatchId,
        id: ObserverId,
        sender: mpsc::Sender<UpdateEvent>,
    },
    Unregister {
        mid: MatchId,
        id: ObserverId,
    },
    Stats(oneshot::Sender<RegistryStats>),
}

/// Cloneable front end used by transports to attach observers
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: mpsc::Sender<Command>,
    next_id: Arc<AtomicU64>,
    observer_buffer: usize,
}

impl DispatcherHandle {
    /// Attach a new observer to `mid`. Updates arrive on the returned receiver.
    pub async fn register(
        &self,
        mid: &str,
    ) -> Result<(ObserverId, mpsc::Receiver<UpdateEvent>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.observer_buffer);

        self.send(Command::Register {
            mid: mid.to_string(),
            id,
            sender,
        })
        .await?;

        Ok((id, receiver))
    }

    /// Detach an observer; unknown ids are ignored
    pub async fn unregister(&self, mid: &str, id: ObserverId) -> Result<()> {
        self.send(Command::Unregister {
            mid: mid.to_string(),
            id,
        })
        .await
    }

    pub async fn stats(&self) -> Result<RegistryStats> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        response.await.map_err(|_| stopped().into())
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| stopped().into())
    }
}

fn stopped() -> EngineError {
    EngineError::InternalError {
        message: "fan-out dispatcher is not running".to_string(),
    }
}

/// The dispatch loop and the registry it owns
pub struct FanoutDispatcher {
    commands: mpsc::Receiver<Command>,
    updates: mpsc::Receiver<UpdateEvent>,
    registry: HashMap<MatchId, Vec<(ObserverId, mpsc::Sender<UpdateEvent>)>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl FanoutDispatcher {
    /// Dispatcher reading updates from `updates`; each observer gets a
    /// buffer of `observer_buffer` events.
    pub fn new(
        updates: mpsc::Receiver<UpdateEvent>,
        observer_buffer: usize,
    ) -> (Self, DispatcherHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);

        let dispatcher = Self {
            commands,
            updates,
            registry: HashMap::new(),
            metrics: None,
        };
        let handle = DispatcherHandle {
            commands: commands_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            observer_buffer: observer_buffer.max(1),
        };
        (dispatcher, handle)
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Serve commands and updates until either inbound channel closes
    pub async fn run(&mut self) -> Result<()> {
        info!("Fan-out dispatcher started");

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                update = self.updates.recv() => match update {
                    Some(update) => self.deliver(update),
                    None => break,
                },
            }
        }

        info!("Fan-out dispatcher stopped");
        Ok(())
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            matches: self.registry.len(),
            observers: self.registry.values().map(Vec::len).sum(),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { mid, id, sender } => {
                debug!("Observer {} registered for match {}", id, mid);
                self.registry.entry(mid).or_default().push((id, sender));
                self.publish_size();
            }
            Command::Unregister { mid, id } => {
                if let Some(observers) = self.registry.get_mut(&mid) {
                    observers.retain(|(observer, _)| *observer != id);
                    if observers.is_empty() {
                        self.registry.remove(&mid);
                    }
                    debug!("Observer {} unregistered from match {}", id, mid);
                }
                self.publish_size();
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Hand `update` to every observer of its match, in registration order.
    /// Closed observers are pruned; full ones miss this update only.
    fn deliver(&mut self, update: UpdateEvent) {
        let Some(observers) = self.registry.get_mut(&update.mid) else {
            return;
        };

        let metrics = self.metrics.as_deref();
        observers.retain(|(id, sender)| match sender.try_send(update.clone()) {
            Ok(()) => {
                if let Some(metrics) = metrics {
                    metrics.record_update_delivered();
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!("Observer {} is lagging; update for {} dropped", id, update.mid);
                if let Some(metrics) = metrics {
                    metrics.record_update_dropped("full");
                }
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Observer {} of match {} is gone", id, update.mid);
                if let Some(metrics) = metrics {
                    metrics.record_update_dropped("closed");
                }
                false
            }
        });

        if observers.is_empty() {
            self.registry.remove(&update.mid);
            self.publish_size();
        }
    }

    fn publish_size(&self) {
        if let Some(metrics) = &self.metrics {
            let stats = self.stats();
            metrics.set_registry_size(stats.matches, stats.observers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn update(mid: &str, puzzle: &str) -> UpdateEvent {
        UpdateEvent::new(
            mid,
            BTreeMap::from([("puzzle".to_string(), puzzle.to_string())]),
        )
    }

    fn start(buffer: usize) -> (mpsc::Sender<UpdateEvent>, DispatcherHandle, JoinHandle<()>) {
        let (updates_tx, updates_rx) = mpsc::channel(64);
        let (mut dispatcher, handle) = FanoutDispatcher::new(updates_rx, buffer);
        let task = tokio::spawn(async move {
            dispatcher.run().await.unwrap();
        });
        (updates_tx, handle, task)
    }

    #[tokio::test]
    async fn test_all_observers_receive_in_order() {
        let (updates, handle, _task) = start(8);
        let (_, mut first) = handle.register("m1").await.unwrap();
        let (_, mut second) = handle.register("m1").await.unwrap();
        let (_, mut other) = handle.register("m2").await.unwrap();

        updates.send(update("m1", "a")).await.unwrap();
        updates.send(update("m1", "b")).await.unwrap();

        for observer in [&mut first, &mut second] {
            assert_eq!(observer.recv().await.unwrap().game["puzzle"], "a");
            assert_eq!(observer.recv().await.unwrap().game["puzzle"], "b");
        }
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_observer_only_sees_later_updates() {
        let (updates, handle, _task) = start(8);
        let (_, mut early) = handle.register("m1").await.unwrap();

        updates.send(update("m1", "before")).await.unwrap();
        assert_eq!(early.recv().await.unwrap().game["puzzle"], "before");

        let (_, mut late) = handle.register("m1").await.unwrap();
        updates.send(update("m1", "after")).await.unwrap();

        assert_eq!(early.recv().await.unwrap().game["puzzle"], "after");
        assert_eq!(late.recv().await.unwrap().game["puzzle"], "after");
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_observer_is_pruned() {
        let (updates, handle, _task) = start(8);
        let (_, gone) = handle.register("m1").await.unwrap();
        let (_, mut alive) = handle.register("m1").await.unwrap();
        drop(gone);

        updates.send(update("m1", "x")).await.unwrap();
        assert_eq!(alive.recv().await.unwrap().game["puzzle"], "x");

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats, RegistryStats { matches: 1, observers: 1 });
    }

    #[tokio::test]
    async fn test_full_observer_stays_registered() {
        let (updates, handle, _task) = start(1);
        let (_, mut slow) = handle.register("m1").await.unwrap();

        updates.send(update("m1", "1")).await.unwrap();
        updates.send(update("m1", "2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.observers, 1);

        assert_eq!(slow.recv().await.unwrap().game["puzzle"], "1");
        assert!(slow.try_recv().is_err());

        updates.send(update("m1", "3")).await.unwrap();
        assert_eq!(slow.recv().await.unwrap().game["puzzle"], "3");
    }

    #[tokio::test]
    async fn test_unregister_removes_observer() {
        let (updates, handle, _task) = start(8);
        let (id, mut observer) = handle.register("m1").await.unwrap();
        handle.unregister("m1", id).await.unwrap();

        assert_eq!(handle.stats().await.unwrap(), RegistryStats::default());

        updates.send(update("m1", "x")).await.unwrap();
        // Sender side was dropped with the registry entry
        assert!(observer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_loop_ends_when_updates_close() {
        let (updates, handle, task) = start(8);
        drop(updates);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.register("m1").await.is_err());
    }

    #[tokio::test]
    async fn test_metrics_follow_registry() {
        let (updates_tx, updates_rx) = mpsc::channel(8);
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let (dispatcher, handle) = FanoutDispatcher::new(updates_rx, 4);
        let mut dispatcher = dispatcher.with_metrics(metrics.clone());
        tokio::spawn(async move { dispatcher.run().await });

        let (_, mut observer) = handle.register("m1").await.unwrap();
        updates_tx.send(update("m1", "x")).await.unwrap();
        observer.recv().await.unwrap();

        assert_eq!(metrics.fanout().observers.get(), 1);
        assert_eq!(metrics.fanout().updates_delivered_total.get(), 1);
    }
}
