//! `SchedulerStore`: the durable store contract (§6 "Durable store contract").
//!
//! Generalizes this crate's event-sourced `WorkflowEventStore` to the
//! spec's row-based CAS model: workflow/job-definition/edge reads, run
//! conditional insert, JobRun CAS transitions, completed-parent
//! append-unique, batch insert/update, and the `(bucket_id, status,
//! trigger_time)` range query the preload cache depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::model::{
    BucketId, DependencyEdge, JobDefinition, JobId, JobRun, JobRunId, RunStatus,
    Workflow, WorkflowId, WorkflowRun, WorkflowRunId,
};
use super::WorkerRow;

/// Errors surfaced by a `SchedulerStore` implementation.
///
/// A CAS miss is *not* an error (§7 "stale-state CAS miss"): callers observe
/// it as `Ok(false)`, never as a `StoreError` variant.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow run not found: {0}")]
    WorkflowRunNotFound(WorkflowRunId),

    #[error("job run not found: {0}")]
    JobRunNotFound(JobRunId),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A row newly inserted by the §4.7 generation procedure, handed back so
/// callers (C9, C10) can publish "max seen id" signals to the preload cache
/// without a second round trip.
#[derive(Debug, Clone)]
pub struct GeneratedRun {
    pub workflow_run: WorkflowRun,
    pub job_runs: Vec<JobRun>,
}

#[async_trait]
pub trait SchedulerStore: Send + Sync + 'static {
    // ---- Definition reads (authored externally, read-only to the core) ----

    async fn list_published_workflows(&self) -> Result<Vec<Workflow>, StoreError>;
    async fn get_job_definition(&self, job_id: JobId) -> Result<Option<JobDefinition>, StoreError>;
    async fn list_job_definitions(&self, workflow_id: WorkflowId)
        -> Result<Vec<JobDefinition>, StoreError>;
    async fn list_dependency_edges(&self, workflow_id: WorkflowId)
        -> Result<Vec<DependencyEdge>, StoreError>;

    // ---- Workflow run generation (C9 / C10) ----

    /// Conditionally insert a `WorkflowRun` plus its `JobRun` rows and
    /// run-time dependency edges in a single transaction (§4.7 steps 1-6).
    /// Returns `None` when the `(workflow_id, trigger_time)` uniqueness key
    /// already exists — "duplicate inserts are silently accepted as
    /// success" (§4.7), i.e. idempotent, not an error.
    async fn generate_run(
        &self,
        workflow: &Workflow,
        trigger_time: DateTime<Utc>,
        job_runs: Vec<JobRun>,
        next_trigger_time: Option<DateTime<Utc>>,
    ) -> Result<Option<GeneratedRun>, StoreError>;

    async fn get_workflow_run_by_trigger_time(
        &self,
        workflow_id: WorkflowId,
        trigger_time: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, StoreError>;

    async fn list_running_workflow_runs_with_next_trigger(
        &self,
    ) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Most recent `WorkflowRun` for `workflow_id` by `trigger_time`,
    /// regardless of status. Unlike
    /// `list_running_workflow_runs_with_next_trigger` (scoped to RUNNING for
    /// C10's recovery pass), this is what C9's due-check reads: a workflow's
    /// latest run is almost always already terminal by the time its next
    /// occurrence is due, so a RUNNING-scoped query would never find it.
    async fn get_latest_workflow_run(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Option<WorkflowRun>, StoreError>;

    async fn set_workflow_run_status(
        &self,
        id: WorkflowRunId,
        status: RunStatus,
    ) -> Result<(), StoreError>;

    // ---- Dispatch (C7) ----

    /// Range query on `(bucket_id, status, trigger_time)` (§6): all WAITING
    /// JobRuns for `bucket_id` due before `horizon`, oldest first, capped at
    /// `limit`.
    async fn list_due_job_runs(
        &self,
        bucket_id: BucketId,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRun>, StoreError>;

    async fn get_job_run(&self, id: JobRunId) -> Result<Option<JobRun>, StoreError>;

    /// CAS state transition (§4.6.c, §4.8.1/2a): succeeds only if the row's
    /// current status equals `from`. Returns whether the CAS won. Stamps
    /// `start_time` when `to` is RUNNING and `end_time` when `to` is
    /// terminal, the same way `finish_job_run` does for its own transitions.
    async fn cas_job_run_status(
        &self,
        id: JobRunId,
        from: RunStatus,
        to: RunStatus,
        worker_id: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn finish_job_run(
        &self,
        id: JobRunId,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<bool, StoreError>;

    /// Re-write a FAILed JobRun back to WAITING for retry (§4.8 retry
    /// transition), bumping `retry_count` and setting a future trigger time.
    async fn requeue_for_retry(
        &self,
        id: JobRunId,
        retry_count: u32,
        trigger_time: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // ---- Dependency propagation (C8) ----

    /// Child-run ids whose parent-run-id is `parent_id`.
    async fn list_dependent_job_runs(&self, parent_id: JobRunId) -> Result<Vec<JobRunId>, StoreError>;

    /// Atomically add `parent_id` to `child_id`'s completed-parent set.
    /// Implemented either as a JSON-array append or the side-table form
    /// (§9 "JSON columns as mutable sets"); must be race-free under
    /// concurrent completions of distinct parents of the same child.
    async fn mark_parent_completed(
        &self,
        child_id: JobRunId,
        parent_id: JobRunId,
    ) -> Result<(), StoreError>;

    /// Mark every non-terminal descendant of `root` CANCELLED (fail-fast
    /// cascade, §4.8 "Failure policy").
    async fn cancel_descendants(&self, root: JobRunId) -> Result<(), StoreError>;

    // ---- Worker registry (C3) ----

    async fn heartbeat_worker(
        &self,
        address: &str,
        max_concurrency: u32,
        running: u32,
    ) -> Result<(), StoreError>;

    async fn list_alive_workers(&self, now: DateTime<Utc>, liveness_window: chrono::Duration)
        -> Result<Vec<WorkerRow>, StoreError>;

    // ---- Recovery (C10) ----

    /// JobRuns with `status = RUNNING` whose owning worker's last heartbeat
    /// predates `stale_before` (§4.9 step 4, "orphaned runs").
    async fn list_stale_running_job_runs(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, StoreError>;
}
