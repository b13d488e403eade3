//! C10: Recovery Engine. Runs once at scheduler start, before the other
//! loops, generalizing this crate's `reclaim_stale_tasks` idiom
//! (`durable/worker/pool.rs`'s stale-reclaim loop) from task reclaim to
//! JobRun reclaim, and reusing `RunGenerator`'s §4.7 procedure for
//! re-materialization (§4.9 step 3 literally says to run that procedure).

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::generator::RunGenerator;
use crate::persistence::model::{RunStatus, Workflow, WorkflowId};
use crate::persistence::{SchedulerStore, StoreError};
use crate::propagator::{CascadePolicy, PropagationError, Propagator, RunEnqueuer};
use crate::registry::RegistryConfig;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("propagation error: {0}")]
    Propagation(#[from] PropagationError),
}

/// Outcome of one `run_once` pass, surfaced for logging/testing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub workflow_runs_materialized: usize,
    pub job_runs_reclaimed: usize,
}

pub struct RecoveryEngine {
    store: Arc<dyn SchedulerStore>,
    generator: RunGenerator,
    propagator: Arc<Propagator>,
    enqueuer: Arc<dyn RunEnqueuer>,
    cascade: CascadePolicy,
    liveness_window: chrono::Duration,
}

impl RecoveryEngine {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        bucket_count: u32,
        registry_config: RegistryConfig,
        propagator: Arc<Propagator>,
        enqueuer: Arc<dyn RunEnqueuer>,
    ) -> Self {
        Self {
            generator: RunGenerator::new(store.clone(), bucket_count),
            liveness_window: registry_config.liveness_window(),
            store,
            propagator,
            enqueuer,
            cascade: CascadePolicy::default(),
        }
    }

    pub fn with_cascade_policy(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    /// §4.9 steps 1-3: for every `WorkflowRun` left RUNNING with a pending
    /// `next_trigger_time`, materialize that one missed occurrence if it
    /// does not already exist. Per §9's Open Question resolution, this emits
    /// only the *most recent* missed run per workflow, not a full catch-up
    /// backlog — avoiding a catch-up storm on a scheduler that was offline
    /// for a long time (recorded in DESIGN.md).
    async fn recover_missed_runs(&self) -> Result<usize, RecoveryError> {
        let pending = self.store.list_running_workflow_runs_with_next_trigger().await?;
        let mut materialized = 0;

        for run in pending {
            let Some(next_trigger_time) = run.next_trigger_time else {
                continue;
            };

            let existing = self
                .store
                .get_workflow_run_by_trigger_time(run.workflow_id, next_trigger_time)
                .await?;
            if existing.is_some() {
                continue;
            }

            let Some(workflow) = self.resolve_workflow(run.workflow_id).await? else {
                warn!(workflow_id = %run.workflow_id, "recovery: workflow definition missing, skipping");
                continue;
            };

            match self.generator.generate_for_workflow(&workflow, next_trigger_time).await {
                Ok(Some(_)) => {
                    materialized += 1;
                    info!(workflow_id = %run.workflow_id, %next_trigger_time, "recovery materialized missed workflow run");
                }
                Ok(None) => {}
                Err(e) => warn!(workflow_id = %run.workflow_id, error = %e, "recovery generation failed"),
            }
        }

        Ok(materialized)
    }

    async fn resolve_workflow(&self, workflow_id: WorkflowId) -> Result<Option<Workflow>, RecoveryError> {
        Ok(self
            .store
            .list_published_workflows()
            .await?
            .into_iter()
            .find(|w| w.id == workflow_id))
    }

    /// §4.9 step 4: JobRuns left RUNNING whose owning worker's heartbeat has
    /// gone stale are forced to FAIL with reason `worker_lost` through the
    /// same propagator path every other completion uses, so the §4.8
    /// dependency cascade unblocks (or cancels) downstream tasks instead of
    /// leaving them stuck waiting on a parent that will never complete.
    async fn reclaim_orphaned_job_runs(&self) -> Result<usize, RecoveryError> {
        let stale_before = Utc::now() - self.liveness_window;
        let orphaned = self.store.list_stale_running_job_runs(stale_before).await?;
        let mut reclaimed = 0;

        for run in orphaned {
            let forced = self
                .propagator
                .on_completed(
                    run.id,
                    RunStatus::Fail,
                    Some("worker_lost".into()),
                    self.cascade,
                    self.enqueuer.as_ref(),
                )
                .await?;
            if forced {
                reclaimed += 1;
                warn!(job_run_id = %run.id, "recovery: reclaimed orphaned job run as worker_lost");
            }
        }

        Ok(reclaimed)
    }

    /// Runs both recovery passes once, in the order §4.9 lists them:
    /// missed-run materialization first, then orphan reclaim.
    pub async fn run_once(&self) -> Result<RecoveryReport, RecoveryError> {
        let workflow_runs_materialized = self.recover_missed_runs().await?;
        let job_runs_reclaimed = self.reclaim_orphaned_job_runs().await?;

        info!(
            workflow_runs_materialized,
            job_runs_reclaimed, "recovery pass complete"
        );

        Ok(RecoveryReport {
            workflow_runs_materialized,
            job_runs_reclaimed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryStore;
    use crate::persistence::model::{BlockOnFullPolicy, JobDefinition, JobRun, JobRunId, TriggerKind, WorkflowLifecycle};

    struct NoopEnqueuer;

    #[async_trait::async_trait]
    impl RunEnqueuer for NoopEnqueuer {
        async fn enqueue(&self, _run: &JobRun) {}
    }

    fn sample_workflow(id: WorkflowId) -> Workflow {
        Workflow {
            id,
            tenant_id: uuid::Uuid::now_v7(),
            trigger_kind: TriggerKind::Cron,
            trigger_value: "0 * * * * * *".into(),
            default_timeout: chrono::Duration::seconds(60),
            retry_budget: 0,
            priority: 0,
            lifecycle: WorkflowLifecycle::Published,
        }
    }

    /// Scenario D / property 7: a `WorkflowRun` left RUNNING with a pending
    /// `next_trigger_time` gets that one occurrence materialized on restart,
    /// and doing it twice is still exactly-once (idempotent generation).
    #[tokio::test]
    async fn recovery_materializes_the_missed_run_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let workflow_id = uuid::Uuid::now_v7();
        let workflow = sample_workflow(workflow_id);
        store.seed_workflow(workflow.clone());
        store.seed_job_definition(JobDefinition {
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
        });

        let earlier = Utc::now() - chrono::Duration::seconds(120);
        let missed = Utc::now() - chrono::Duration::seconds(60);
        let generated = store.generate_run(&workflow, earlier, vec![], Some(missed)).await.unwrap().unwrap();
        store
            .set_workflow_run_status(generated.workflow_run.id, RunStatus::Running)
            .await
            .unwrap();

        let propagator = Arc::new(Propagator::new(store.clone()));
        let enqueuer = Arc::new(NoopEnqueuer);
        let engine = RecoveryEngine::new(store.clone(), 16, RegistryConfig::default(), propagator, enqueuer);
        let report = engine.run_once().await.unwrap();
        assert_eq!(report.workflow_runs_materialized, 1);

        // Running it again is a no-op: the missed run now exists.
        let report2 = engine.run_once().await.unwrap();
        assert_eq!(report2.workflow_runs_materialized, 0);

        let materialized = store.get_workflow_run_by_trigger_time(workflow_id, missed).await.unwrap();
        assert!(materialized.is_some());
    }

    /// Scenario D: a RUNNING JobRun whose owning worker never heartbeats is
    /// forced to FAIL(`worker_lost`).
    #[tokio::test]
    async fn recovery_reclaims_job_runs_with_no_live_worker() {
        let store = Arc::new(InMemoryStore::new());
        let workflow_id = uuid::Uuid::now_v7();
        let workflow = sample_workflow(workflow_id);
        store.seed_workflow(workflow.clone());

        let seeded = JobRun {
            id: JobRunId(0),
            workflow_run_id: uuid::Uuid::nil(),
            job_id: uuid::Uuid::now_v7(),
            bucket_id: crate::persistence::model::BucketId(0),
            status: RunStatus::Waiting,
            trigger_time: Utc::now(),
            start_time: None,
            end_time: None,
            worker_id: Some("worker-gone".into()),
            retry_count: 0,
            message: None,
            parent_run_ids: vec![],
            completed_parents: vec![],
        };
        let generated = store.generate_run(&workflow, Utc::now(), vec![seeded], None).await.unwrap().unwrap();
        let id = generated.job_runs[0].id;
        store.cas_job_run_status(id, RunStatus::Waiting, RunStatus::Running, Some("worker-gone")).await.unwrap();

        let propagator = Arc::new(Propagator::new(store.clone()).with_retry_policy(crate::reliability::retry::RetryPolicy::no_retry()));
        let enqueuer = Arc::new(NoopEnqueuer);
        let engine = RecoveryEngine::new(store.clone(), 16, RegistryConfig::default(), propagator, enqueuer);
        let report = engine.run_once().await.unwrap();
        assert_eq!(report.job_runs_reclaimed, 1);

        let run = store.get_job_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Fail);
        assert_eq!(run.message.as_deref(), Some("worker_lost"));
    }
}
