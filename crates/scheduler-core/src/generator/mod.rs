//! C9: Workflow Run Generator. Once per second, materializes the next
//! occurrence of every PUBLISHED workflow whose next-trigger-time has
//! arrived, per §4.7's six-step procedure.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::hashing::bucket_of;
use crate::persistence::model::{
    DependencyEdge, JobDefinition, JobId, JobRun, JobRunId, RunStatus, Workflow, WorkflowId,
};
use crate::persistence::store::GeneratedRun;
use crate::persistence::{SchedulerStore, StoreError};

/// §9: a periodic scan cadence of once per second, as the spec prescribes.
pub const DEFAULT_TICK_INTERVAL: StdDuration = StdDuration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid trigger expression {expr:?} for workflow {workflow_id}: {reason}")]
    InvalidTrigger {
        workflow_id: uuid::Uuid,
        expr: String,
        reason: String,
    },
}

/// Computes the next fire time strictly after `after`, for the workflow's
/// trigger kind. `FixedRate`/`FixedDelay` values are parsed as a number of
/// seconds; `Cron` values are parsed as a standard five/six-field cron
/// expression via the `cron` crate.
pub fn next_trigger_time(workflow: &Workflow, after: DateTime<Utc>) -> Result<DateTime<Utc>, GeneratorError> {
    use crate::persistence::model::TriggerKind;
    match workflow.trigger_kind {
        TriggerKind::Cron => {
            let schedule = Schedule::from_str(&workflow.trigger_value).map_err(|e| GeneratorError::InvalidTrigger {
                workflow_id: workflow.id,
                expr: workflow.trigger_value.clone(),
                reason: e.to_string(),
            })?;
            schedule
                .after(&after)
                .next()
                .ok_or_else(|| GeneratorError::InvalidTrigger {
                    workflow_id: workflow.id,
                    expr: workflow.trigger_value.clone(),
                    reason: "cron schedule produced no further occurrences".into(),
                })
        }
        TriggerKind::FixedRate | TriggerKind::FixedDelay => {
            let seconds: i64 = workflow.trigger_value.parse().map_err(|_| GeneratorError::InvalidTrigger {
                workflow_id: workflow.id,
                expr: workflow.trigger_value.clone(),
                reason: "expected an integer number of seconds".into(),
            })?;
            Ok(after + chrono::Duration::seconds(seconds.max(1)))
        }
        TriggerKind::Manual | TriggerKind::Api => Err(GeneratorError::InvalidTrigger {
            workflow_id: workflow.id,
            expr: workflow.trigger_value.clone(),
            reason: "manual/API-triggered workflows are not scanned by the periodic generator".into(),
        }),
    }
}

pub struct RunGenerator {
    store: Arc<dyn SchedulerStore>,
    bucket_count: u32,
}

impl RunGenerator {
    pub fn new(store: Arc<dyn SchedulerStore>, bucket_count: u32) -> Self {
        Self { store, bucket_count }
    }

    /// §4.7 steps 2-6: given a workflow whose trigger has arrived at
    /// `trigger_time`, builds the WAITING JobRun rows (with computed bucket
    /// ids and per-job trigger times) and the next next-trigger-time, then
    /// commits the whole thing through one `generate_run` call.
    pub async fn generate_for_workflow(
        &self,
        workflow: &Workflow,
        trigger_time: DateTime<Utc>,
    ) -> Result<Option<GeneratedRun>, GeneratorError> {
        let definitions = self.store.list_job_definitions(workflow.id).await?;
        let edges = self.store.list_dependency_edges(workflow.id).await?;

        let job_runs = self.build_job_runs(&definitions, &edges, trigger_time);

        let next = match next_trigger_time(workflow, trigger_time) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(workflow_id = %workflow.id, error = %e, "could not compute next trigger time");
                None
            }
        };

        let generated = self.store.generate_run(workflow, trigger_time, job_runs, next).await?;
        if generated.is_none() {
            debug!(workflow_id = %workflow.id, %trigger_time, "workflow run already materialized, skipped");
        }
        Ok(generated)
    }

    /// §4.7 step 3: own-trigger override > inherit workflow trigger time (no
    /// parents) > `0` (has parents, gated entirely by readiness in §4.8).
    /// `parent_run_ids` are left empty here; the store assigns real
    /// `JobRunId`s and wires run-time dependency edges from the static
    /// `DependencyEdge` rows as part of the same transaction.
    fn build_job_runs(
        &self,
        definitions: &[JobDefinition],
        edges: &[DependencyEdge],
        workflow_trigger_time: DateTime<Utc>,
    ) -> Vec<JobRun> {
        let mut has_parent: HashMap<JobId, bool> = HashMap::new();
        for edge in edges {
            has_parent.insert(edge.job_id, true);
        }

        definitions
            .iter()
            .map(|def| {
                let trigger_time = if let Some(own) = &def.own_trigger {
                    parse_own_trigger(own, workflow_trigger_time)
                } else if *has_parent.get(&def.id).unwrap_or(&false) {
                    DateTime::<Utc>::from_timestamp(0, 0).unwrap_or(workflow_trigger_time)
                } else {
                    workflow_trigger_time
                };

                JobRun {
                    id: JobRunId(0),
                    workflow_run_id: uuid::Uuid::nil(),
                    job_id: def.id,
                    bucket_id: bucket_of(def.id, self.bucket_count),
                    status: RunStatus::Waiting,
                    trigger_time,
                    start_time: None,
                    end_time: None,
                    worker_id: None,
                    retry_count: 0,
                    message: None,
                    parent_run_ids: Vec::new(),
                    completed_parents: Vec::new(),
                }
            })
            .collect()
    }

    /// One scan: every PUBLISHED workflow whose next-trigger-time has
    /// arrived gets generated.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, GeneratorError> {
        let workflows = self.store.list_published_workflows().await?;
        let mut generated = 0;

        for workflow in workflows {
            // §4.7: "for each workflow whose next-trigger-time has arrived".
            // The workflow's own latest run (any status) carries that
            // next-trigger-time, stored by the previous generation pass
            // (§4.7 step 6); a workflow with no prior run yet is due
            // immediately. This is distinct from C10's RUNNING-scoped
            // recovery query, which answers a different question (which
            // *in-flight* runs need a missed-occurrence catch-up at
            // startup), not "what's due right now".
            let latest = self.store.get_latest_workflow_run(workflow.id).await?;
            let due = match &latest {
                Some(run) => run.next_trigger_time.map(|t| t <= now).unwrap_or(false),
                None => true,
            };
            if !due {
                continue;
            }

            let trigger_time = latest.and_then(|r| r.next_trigger_time).unwrap_or(now);

            match self.generate_for_workflow(&workflow, trigger_time).await {
                Ok(Some(_)) => generated += 1,
                Ok(None) => {}
                Err(e) => warn!(workflow_id = %workflow.id, error = %e, "workflow run generation failed"),
            }
        }

        Ok(generated)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(DEFAULT_TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(n) if n > 0 => info!(generated = n, "workflow run generation tick"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "generation tick failed"),
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

/// An own-trigger override is stored as an integer offset in seconds from
/// the workflow's trigger time (e.g. "stagger this job by 30s").
fn parse_own_trigger(value: &str, workflow_trigger_time: DateTime<Utc>) -> DateTime<Utc> {
    match value.parse::<i64>() {
        Ok(offset) => workflow_trigger_time + chrono::Duration::seconds(offset),
        Err(_) => workflow_trigger_time,
    }
}
