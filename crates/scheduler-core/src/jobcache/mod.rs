//! C5: Job-Info Cache. Hot, read-through mirror of `JobDefinition` rows
//! keyed by job id, backed by `dashmap` the same way this codebase reaches
//! for concurrent maps in per-worker hot paths.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::persistence::model::{JobDefinition, JobId, WorkflowId};
use crate::persistence::{SchedulerStore, StoreError};

/// Default full-refresh cadence (§4.4: "every 5 minutes").
pub const DEFAULT_REFRESH_INTERVAL: StdDuration = StdDuration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum JobCacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub struct JobInfoCache {
    store: Arc<dyn SchedulerStore>,
    entries: DashMap<JobId, JobDefinition>,
    refresh_interval: StdDuration,
}

impl JobInfoCache {
    pub fn new(store: Arc<dyn SchedulerStore>) -> Self {
        Self::with_refresh_interval(store, DEFAULT_REFRESH_INTERVAL)
    }

    pub fn with_refresh_interval(store: Arc<dyn SchedulerStore>, refresh_interval: StdDuration) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            refresh_interval,
        }
    }

    /// Read-through lookup. A miss that is also absent from C1 means the
    /// definition was withdrawn; callers (C7) treat `None` as
    /// "definition_missing" and cancel the JobRun (§7).
    pub async fn get(&self, job_id: JobId) -> Result<Option<JobDefinition>, JobCacheError> {
        if let Some(def) = self.entries.get(&job_id) {
            return Ok(Some(def.clone()));
        }
        let fetched = self.store.get_job_definition(job_id).await?;
        if let Some(def) = &fetched {
            self.entries.insert(job_id, def.clone());
        }
        Ok(fetched)
    }

    /// Synchronous, cache-only lookup: no store fallthrough on a miss. Used
    /// by collaborators that cannot await mid-closure, such as the timeout
    /// monitor's `resolve_timeout` callback.
    pub fn get_cached(&self, job_id: JobId) -> Option<JobDefinition> {
        self.entries.get(&job_id).map(|d| d.clone())
    }

    /// Full refresh of every definition belonging to `workflow_id` (used
    /// both by the periodic refresh task and directly by C9 when a
    /// workflow is generated).
    pub async fn refresh_workflow(&self, workflow_id: WorkflowId) -> Result<(), JobCacheError> {
        let defs = self.store.list_job_definitions(workflow_id).await?;
        for def in defs {
            self.entries.insert(def.id, def);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Periodic full-refresh task, run once per `refresh_interval` against
    /// every workflow currently owned by C9's schedule (passed in since the
    /// cache itself does not know which workflows matter).
    pub async fn run_refresh_loop(
        &self,
        workflow_ids: impl Fn() -> Vec<WorkflowId> + Send + Sync,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.refresh_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for workflow_id in workflow_ids() {
                        if let Err(e) = self.refresh_workflow(workflow_id).await {
                            warn!(%workflow_id, error = %e, "job-info cache refresh failed");
                        }
                    }
                    debug!(entries = self.entries.len(), "job-info cache refreshed");
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
    use crate::persistence::model::BlockOnFullPolicy;

    fn sample_def(workflow_id: WorkflowId) -> JobDefinition {
        JobDefinition {
            id: uuid::Uuid::now_v7(),
            workflow_id,
            job_type: "noop".into(),
            params: serde_json::json!({}),
            timeout: chrono::Duration::seconds(60),
            retry_budget: 0,
            retry_interval: chrono::Duration::seconds(30),
            priority: 0,
            routing_policy: None,
            block_on_full: BlockOnFullPolicy::Block,
            own_trigger: None,
        }
    }

    #[tokio::test]
    async fn miss_falls_through_to_the_store_and_populates_the_cache() {
        let store = Arc::new(InMemoryStore::new());
        let workflow_id = uuid::Uuid::now_v7();
        let def = sample_def(workflow_id);
        store.seed_job_definition(def.clone());

        let cache = JobInfoCache::new(store);
        assert_eq!(cache.len(), 0);

        let found = cache.get(def.id).await.unwrap();
        assert!(found.is_some());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn missing_definition_is_reported_as_none_not_an_error() {
        let store = Arc::new(InMemoryStore::new());
        let cache = JobInfoCache::new(store);
        let found = cache.get(uuid::Uuid::now_v7()).await.unwrap();
        assert!(found.is_none());
    }
}
