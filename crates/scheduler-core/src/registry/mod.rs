//! C3: Worker Registry. Tracks the live worker set with heartbeats and
//! fans membership changes out over a `watch` channel, the same primitive
//! this codebase's `WorkerPool` uses for its shutdown signal (here used for
//! the opposite direction: broadcasting state rather than receiving a stop
//! signal).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::persistence::model::WorkerAddress;
use crate::persistence::{SchedulerStore, StoreError};

/// §6 configuration: `heartbeat-interval` (default 10s) and
/// `liveness-window-multiplier` (default 3).
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub heartbeat_interval: StdDuration,
    pub liveness_window_multiplier: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: StdDuration::from_secs(10),
            liveness_window_multiplier: 3,
        }
    }
}

impl RegistryConfig {
    pub fn liveness_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.heartbeat_interval * self.liveness_window_multiplier)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Tracks the live worker set and exposes a `subscribe`-style watch channel
/// (§4.2) that C4's `BucketManager` reacts to.
pub struct WorkerRegistry {
    store: Arc<dyn SchedulerStore>,
    config: RegistryConfig,
    alive_tx: watch::Sender<Vec<WorkerAddress>>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn SchedulerStore>, config: RegistryConfig) -> Self {
        let (alive_tx, _rx) = watch::channel(Vec::new());
        Self {
            store,
            config,
            alive_tx,
        }
    }

    /// `heartbeat(address, maxConcurrency, running)` (§4.2).
    pub async fn heartbeat(
        &self,
        address: &str,
        max_concurrency: u32,
        running: u32,
    ) -> Result<(), RegistryError> {
        self.store
            .heartbeat_worker(address, max_concurrency, running)
            .await?;
        Ok(())
    }

    /// `listAlive(now)` (§4.2): members whose last heartbeat is within the
    /// liveness window.
    pub async fn list_alive(&self) -> Result<Vec<WorkerAddress>, RegistryError> {
        let now = Utc::now();
        let rows = self
            .store
            .list_alive_workers(now, self.config.liveness_window())
            .await?;
        Ok(rows.into_iter().map(|r| r.address).collect())
    }

    /// `subscribe(listener)`: a new receiver observes every alive-set change
    /// from the point of subscription onward.
    pub fn subscribe(&self) -> watch::Receiver<Vec<WorkerAddress>> {
        self.alive_tx.subscribe()
    }

    /// Background poll loop: scans the store every `heartbeat_interval` and
    /// publishes the alive set whenever it changes, so C4 reacts to
    /// membership events instead of polling the store itself (§9
    /// "polling-dominated data flow" note — event-driven at the consumer
    /// edge, poll-driven only where the source of truth requires it).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.list_alive().await {
                        Ok(mut alive) => {
                            alive.sort();
                            if *self.alive_tx.borrow() != alive {
                                debug!(count = alive.len(), "worker registry membership changed");
                                let _ = self.alive_tx.send(alive);
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to refresh worker registry"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryStore;

    #[tokio::test]
    async fn heartbeat_then_list_alive_reflects_the_worker() {
        let store = Arc::new(InMemoryStore::new());
        let registry = WorkerRegistry::new(store, RegistryConfig::default());

        registry.heartbeat("worker-a", 4, 0).await.unwrap();
        let alive = registry.list_alive().await.unwrap();
        assert_eq!(alive, vec!["worker-a".to_string()]);
    }

    #[test]
    fn liveness_window_is_heartbeat_interval_times_multiplier() {
        let config = RegistryConfig {
            heartbeat_interval: StdDuration::from_secs(10),
            liveness_window_multiplier: 3,
        };
        assert_eq!(config.liveness_window(), chrono::Duration::seconds(30));
    }
}
