//! In-memory `SchedulerStore`, used by every other component's test suite
//! and by the property tests in `hashing`/`propagator`/`generator`.
//!
//! Mirrors `InMemoryWorkflowEventStore`: `parking_lot::RwLock<HashMap<..>>`
//! rather than anything fancier, since this exists for test determinism, not
//! production throughput.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::model::{
    BucketId, DependencyEdge, JobDefinition, JobId, JobRun, JobRunId, RunStatus,
    Workflow, WorkflowId, WorkflowRun, WorkflowRunId,
};
use super::store::{GeneratedRun, SchedulerStore, StoreError};
use super::WorkerRow;

#[derive(Default)]
pub struct InMemoryStore {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    job_defs: RwLock<HashMap<JobId, JobDefinition>>,
    edges: RwLock<HashMap<WorkflowId, Vec<DependencyEdge>>>,
    workflow_runs: RwLock<HashMap<WorkflowRunId, WorkflowRun>>,
    run_index: RwLock<HashMap<(WorkflowId, DateTime<Utc>), WorkflowRunId>>,
    job_runs: RwLock<HashMap<JobRunId, JobRun>>,
    /// parent job-run id -> child job-run ids (run-time dependency edges).
    dependents: RwLock<HashMap<JobRunId, Vec<JobRunId>>>,
    workers: RwLock<HashMap<String, WorkerRow>>,
    next_job_run_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/seeding helper: authoring paths populate definitions externally
    /// in production; here tests do it directly.
    pub fn seed_workflow(&self, workflow: Workflow) {
        self.workflows.write().insert(workflow.id, workflow);
    }

    pub fn seed_job_definition(&self, def: JobDefinition) {
        self.job_defs.write().insert(def.id, def);
    }

    pub fn seed_dependency_edge(&self, edge: DependencyEdge) {
        self.edges.write().entry(edge.workflow_id).or_default().push(edge);
    }

    fn next_id(&self) -> JobRunId {
        JobRunId(self.next_job_run_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl SchedulerStore for InMemoryStore {
    async fn list_published_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        Ok(self
            .workflows
            .read()
            .values()
            .filter(|w| matches!(w.lifecycle, super::model::WorkflowLifecycle::Published))
            .cloned()
            .collect())
    }

    async fn get_job_definition(&self, job_id: JobId) -> Result<Option<JobDefinition>, StoreError> {
        Ok(self.job_defs.read().get(&job_id).cloned())
    }

    async fn list_job_definitions(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<JobDefinition>, StoreError> {
        Ok(self
            .job_defs
            .read()
            .values()
            .filter(|d| d.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn list_dependency_edges(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<DependencyEdge>, StoreError> {
        Ok(self.edges.read().get(&workflow_id).cloned().unwrap_or_default())
    }

    async fn generate_run(
        &self,
        workflow: &Workflow,
        trigger_time: DateTime<Utc>,
        job_runs: Vec<JobRun>,
        next_trigger_time: Option<DateTime<Utc>>,
    ) -> Result<Option<GeneratedRun>, StoreError> {
        let key = (workflow.id, trigger_time);
        // Conditional insert on (workflow_id, trigger_time): a pre-existing
        // key means another scheduler (or a duplicate recovery pass)
        // already produced this run. Silently accept as success (§4.7).
        {
            let mut index = self.run_index.write();
            if index.contains_key(&key) {
                return Ok(None);
            }
            let run_id = uuid::Uuid::now_v7();
            index.insert(key, run_id);

            let run = WorkflowRun {
                id: run_id,
                workflow_id: workflow.id,
                tenant_id: workflow.tenant_id,
                trigger_kind: workflow.trigger_kind,
                trigger_time,
                status: RunStatus::Waiting,
                start_time: None,
                end_time: None,
                next_trigger_time,
            };
            self.workflow_runs.write().insert(run_id, run.clone());

            let mut assigned = Vec::with_capacity(job_runs.len());
            let mut job_runs_guard = self.job_runs.write();
            let mut dependents_guard = self.dependents.write();
            for mut jr in job_runs {
                jr.id = self.next_id();
                jr.workflow_run_id = run_id;
                for parent in &jr.parent_run_ids {
                    dependents_guard.entry(*parent).or_default().push(jr.id);
                }
                job_runs_guard.insert(jr.id, jr.clone());
                assigned.push(jr);
            }

            Ok(Some(GeneratedRun {
                workflow_run: run,
                job_runs: assigned,
            }))
        }
    }

    async fn get_workflow_run_by_trigger_time(
        &self,
        workflow_id: WorkflowId,
        trigger_time: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let id = self.run_index.read().get(&(workflow_id, trigger_time)).copied();
        Ok(id.and_then(|id| self.workflow_runs.read().get(&id).cloned()))
    }

    async fn list_running_workflow_runs_with_next_trigger(
        &self,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        Ok(self
            .workflow_runs
            .read()
            .values()
            .filter(|r| r.status == RunStatus::Running && r.next_trigger_time.is_some())
            .cloned()
            .collect())
    }

    async fn get_latest_workflow_run(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self
            .workflow_runs
            .read()
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .max_by_key(|r| r.trigger_time)
            .cloned())
    }

    async fn set_workflow_run_status(
        &self,
        id: WorkflowRunId,
        status: RunStatus,
    ) -> Result<(), StoreError> {
        let mut runs = self.workflow_runs.write();
        let run = runs.get_mut(&id).ok_or(StoreError::WorkflowRunNotFound(id))?;
        run.status = status;
        if status.is_terminal() {
            run.end_time = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_due_job_runs(
        &self,
        bucket_id: BucketId,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRun>, StoreError> {
        let mut due: Vec<JobRun> = self
            .job_runs
            .read()
            .values()
            .filter(|jr| {
                jr.bucket_id == bucket_id && jr.status == RunStatus::Waiting && jr.trigger_time <= horizon
            })
            .cloned()
            .collect();
        // Ordering within a bucket: trigger time ascending, ties by id (§4.5).
        due.sort_by(|a, b| a.trigger_time.cmp(&b.trigger_time).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn get_job_run(&self, id: JobRunId) -> Result<Option<JobRun>, StoreError> {
        Ok(self.job_runs.read().get(&id).cloned())
    }

    async fn cas_job_run_status(
        &self,
        id: JobRunId,
        from: RunStatus,
        to: RunStatus,
        worker_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut runs = self.job_runs.write();
        let Some(run) = runs.get_mut(&id) else {
            return Ok(false);
        };
        if run.status != from {
            return Ok(false);
        }
        run.status = to;
        if to == RunStatus::Running {
            run.start_time = Some(Utc::now());
            run.worker_id = worker_id.map(str::to_owned);
        } else if to.is_terminal() {
            run.end_time = Some(Utc::now());
        }
        Ok(true)
    }

    async fn finish_job_run(
        &self,
        id: JobRunId,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut runs = self.job_runs.write();
        let Some(run) = runs.get_mut(&id) else {
            return Ok(false);
        };
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.status = status;
        run.end_time = Some(Utc::now());
        run.message = message;
        Ok(true)
    }

    async fn requeue_for_retry(
        &self,
        id: JobRunId,
        retry_count: u32,
        trigger_time: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut runs = self.job_runs.write();
        let Some(run) = runs.get_mut(&id) else {
            return Ok(false);
        };
        if run.status == RunStatus::Cancelled {
            return Ok(false);
        }
        run.status = RunStatus::Waiting;
        run.retry_count = retry_count;
        run.trigger_time = trigger_time;
        run.start_time = None;
        run.end_time = None;
        Ok(true)
    }

    async fn list_dependent_job_runs(&self, parent_id: JobRunId) -> Result<Vec<JobRunId>, StoreError> {
        Ok(self.dependents.read().get(&parent_id).cloned().unwrap_or_default())
    }

    async fn mark_parent_completed(
        &self,
        child_id: JobRunId,
        parent_id: JobRunId,
    ) -> Result<(), StoreError> {
        let mut runs = self.job_runs.write();
        let run = runs.get_mut(&child_id).ok_or(StoreError::JobRunNotFound(child_id))?;
        // Append-unique: concurrent completions of distinct parents must
        // never clobber each other. A single write-lock acquisition over
        // the whole map serializes this in the in-memory store; the
        // Postgres store achieves the same property via a unique
        // `(job_run_id, parent_run_id)` side-table key.
        if !run.completed_parents.contains(&parent_id) {
            run.completed_parents.push(parent_id);
        }
        Ok(())
    }

    async fn cancel_descendants(&self, root: JobRunId) -> Result<(), StoreError> {
        let mut frontier = self.dependents.read().get(&root).cloned().unwrap_or_default();
        let mut runs = self.job_runs.write();
        let dependents = self.dependents.read();
        while let Some(id) = frontier.pop() {
            if let Some(run) = runs.get_mut(&id) {
                if !run.status.is_terminal() {
                    run.status = RunStatus::Cancelled;
                    run.end_time = Some(Utc::now());
                    if let Some(children) = dependents.get(&id) {
                        frontier.extend(children.iter().copied());
                    }
                }
            }
        }
        Ok(())
    }

    async fn heartbeat_worker(
        &self,
        address: &str,
        max_concurrency: u32,
        running: u32,
    ) -> Result<(), StoreError> {
        self.workers.write().insert(
            address.to_string(),
            WorkerRow {
                address: address.to_string(),
                last_heartbeat: Utc::now(),
                max_concurrency,
                running,
            },
        );
        Ok(())
    }

    async fn list_alive_workers(
        &self,
        now: DateTime<Utc>,
        liveness_window: chrono::Duration,
    ) -> Result<Vec<WorkerRow>, StoreError> {
        Ok(self
            .workers
            .read()
            .values()
            .filter(|w| now.signed_duration_since(w.last_heartbeat) <= liveness_window)
            .cloned()
            .collect())
    }

    async fn list_stale_running_job_runs(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, StoreError> {
        let workers = self.workers.read();
        Ok(self
            .job_runs
            .read()
            .values()
            .filter(|jr| {
                jr.status == RunStatus::Running
                    && match jr.worker_id.as_deref().and_then(|w| workers.get(w)) {
                        Some(w) => w.last_heartbeat < stale_before,
                        None => true,
                    }
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::model::{BlockOnFullPolicy, TriggerKind, WorkflowLifecycle};

    fn sample_workflow() -> Workflow {
        Workflow {
            id: uuid::Uuid::now_v7(),
            tenant_id: uuid::Uuid::now_v7(),
            trigger_kind: TriggerKind::Cron,
            trigger_value: "*/5 * * * *".into(),
            default_timeout: chrono::Duration::seconds(300),
            retry_budget: 0,
            priority: 0,
            lifecycle: WorkflowLifecycle::Published,
        }
    }

    fn sample_job_run(workflow_run_id: WorkflowRunId, parents: Vec<JobRunId>) -> JobRun {
        JobRun {
            id: JobRunId(0),
            workflow_run_id,
            job_id: uuid::Uuid::now_v7(),
            bucket_id: BucketId(1),
            status: RunStatus::Waiting,
            trigger_time: Utc::now(),
            start_time: None,
            end_time: None,
            worker_id: None,
            retry_count: 0,
            message: None,
            parent_run_ids: parents,
            completed_parents: vec![],
        }
    }

    #[tokio::test]
    async fn generate_run_is_idempotent_on_duplicate_trigger_time() {
        let store = InMemoryStore::new();
        let workflow = sample_workflow();
        store.seed_workflow(workflow.clone());
        let t = Utc::now();

        let first = store.generate_run(&workflow, t, vec![], None).await.unwrap();
        assert!(first.is_some());

        let second = store.generate_run(&workflow, t, vec![], None).await.unwrap();
        assert!(second.is_none(), "duplicate generation must be silently idempotent");
    }

    #[tokio::test]
    async fn get_latest_workflow_run_picks_the_most_recent_trigger_time_regardless_of_status() {
        let store = InMemoryStore::new();
        let workflow = sample_workflow();
        store.seed_workflow(workflow.clone());

        let earlier = Utc::now() - chrono::Duration::minutes(10);
        let later = Utc::now();

        let first = store
            .generate_run(&workflow, earlier, vec![], Some(later))
            .await
            .unwrap()
            .unwrap();
        store.set_workflow_run_status(first.workflow_run.id, RunStatus::Success).await.unwrap();

        let next_trigger = Utc::now() + chrono::Duration::minutes(10);
        store.generate_run(&workflow, later, vec![], Some(next_trigger)).await.unwrap();

        let latest = store.get_latest_workflow_run(workflow.id).await.unwrap().unwrap();
        assert_eq!(latest.trigger_time, later);
        assert_eq!(latest.next_trigger_time, Some(next_trigger));
    }

    #[tokio::test]
    async fn cas_job_run_status_only_succeeds_once() {
        let store = InMemoryStore::new();
        let workflow = sample_workflow();
        store.seed_workflow(workflow.clone());
        let t = Utc::now();
        let generated = store
            .generate_run(&workflow, t, vec![sample_job_run(uuid::Uuid::nil(), vec![])], None)
            .await
            .unwrap()
            .unwrap();
        let id = generated.job_runs[0].id;

        let first = store
            .cas_job_run_status(id, RunStatus::Waiting, RunStatus::Running, Some("w1"))
            .await
            .unwrap();
        assert!(first);

        let second = store
            .cas_job_run_status(id, RunStatus::Waiting, RunStatus::Running, Some("w2"))
            .await
            .unwrap();
        assert!(!second, "no duplicate trigger: only one CAS may win");
    }

    #[tokio::test]
    async fn mark_parent_completed_is_append_unique() {
        let store = InMemoryStore::new();
        let workflow = sample_workflow();
        store.seed_workflow(workflow.clone());
        let parent = JobRunId(1);
        let generated = store
            .generate_run(&workflow, Utc::now(), vec![sample_job_run(uuid::Uuid::nil(), vec![parent])], None)
            .await
            .unwrap()
            .unwrap();
        let child = generated.job_runs[0].id;

        store.mark_parent_completed(child, parent).await.unwrap();
        store.mark_parent_completed(child, parent).await.unwrap();

        let run = store.get_job_run(child).await.unwrap().unwrap();
        assert_eq!(run.completed_parents, vec![parent]);
    }

    #[tokio::test]
    async fn cancel_descendants_cascades_transitively() {
        let store = InMemoryStore::new();
        let workflow = sample_workflow();
        store.seed_workflow(workflow.clone());

        // root -> mid -> leaf, wired through dependents directly since
        // generate_run only wires parent->child at insert time.
        let root = JobRunId(100);
        let generated = store
            .generate_run(
                &workflow,
                Utc::now(),
                vec![
                    sample_job_run(uuid::Uuid::nil(), vec![root]),
                ],
                None,
            )
            .await
            .unwrap()
            .unwrap();
        let mid = generated.job_runs[0].id;

        let generated2 = store
            .generate_run(
                &workflow,
                Utc::now() + chrono::Duration::seconds(1),
                vec![sample_job_run(uuid::Uuid::nil(), vec![mid])],
                None,
            )
            .await
            .unwrap()
            .unwrap();
        let leaf = generated2.job_runs[0].id;

        store.cancel_descendants(root).await.unwrap();

        assert_eq!(
            store.get_job_run(mid).await.unwrap().unwrap().status,
            RunStatus::Cancelled
        );
        assert_eq!(
            store.get_job_run(leaf).await.unwrap().unwrap().status,
            RunStatus::Cancelled
        );
    }
}
