//! Entities shared by every component: workflows, job definitions, dependency
//! edges, and the run-time rows (`WorkflowRun`, `JobRun`) they generate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque tenant identifier. Never interpreted by the core.
pub type TenantId = Uuid;
pub type WorkflowId = Uuid;
pub type JobId = Uuid;
pub type WorkflowRunId = Uuid;

/// JobRun ids are monotonic, not time-ordered UUIDs: the preload cache's
/// incremental fetch (§4.5) keys its "max seen id" cursor on this ordering,
/// which a UUIDv7's millisecond resolution cannot guarantee under bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobRunId(pub i64);

impl std::fmt::Display for JobRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bucket identifier in `[0, B)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(pub u32);

/// How a Workflow or JobDefinition is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    Cron,
    FixedRate,
    FixedDelay,
    Manual,
    Api,
}

/// Workflow lifecycle status. Only `Published` workflows generate runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowLifecycle {
    Draft,
    Published,
    Paused,
}

/// Immutable schedule definition within a tenant (§3 "Workflow").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub tenant_id: TenantId,
    pub trigger_kind: TriggerKind,
    pub trigger_value: String,
    pub default_timeout: chrono::Duration,
    pub retry_budget: u32,
    pub priority: i32,
    pub lifecycle: WorkflowLifecycle,
}

/// What happens to a job when its worker's dispatch queue is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockOnFullPolicy {
    Block,
    Drop,
}

/// A node inside a workflow (§3 "JobDefinition").
///
/// Invariant: `workflow_id` never changes once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobId,
    pub workflow_id: WorkflowId,
    pub job_type: String,
    pub params: serde_json::Value,
    pub timeout: chrono::Duration,
    pub retry_budget: u32,
    pub retry_interval: chrono::Duration,
    pub priority: i32,
    pub routing_policy: Option<String>,
    pub block_on_full: BlockOnFullPolicy,
    pub own_trigger: Option<String>,
}

/// Static parent -> child edge within a workflow (§3 "DependencyEdge").
///
/// Invariant: edges form a DAG; cycle detection on save is an external
/// concern, the engine assumes acyclicity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub workflow_id: WorkflowId,
    pub job_id: JobId,
    pub parent_job_id: JobId,
}

/// Wire-stable status codes (§6): `WAITING=0 RUNNING=1 SUCCESS=2 FAIL=3
/// TIMEOUT=4 CANCELLED=5`. `WorkflowRun` never reaches `Timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum RunStatus {
    Waiting = 0,
    Running = 1,
    Success = 2,
    Fail = 3,
    Timeout = 4,
    Cancelled = 5,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Fail | RunStatus::Timeout | RunStatus::Cancelled
        )
    }
}

impl From<RunStatus> for i32 {
    fn from(s: RunStatus) -> i32 {
        s as i32
    }
}

impl TryFrom<i32> for RunStatus {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(RunStatus::Waiting),
            1 => Ok(RunStatus::Running),
            2 => Ok(RunStatus::Success),
            3 => Ok(RunStatus::Fail),
            4 => Ok(RunStatus::Timeout),
            5 => Ok(RunStatus::Cancelled),
            other => Err(format!("unrecognized status code {other}")),
        }
    }
}

/// One scheduled occurrence of a workflow (§3 "WorkflowRun").
///
/// Invariant: at most one `WorkflowRun` per `(workflow_id, trigger_time)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: WorkflowRunId,
    pub workflow_id: WorkflowId,
    pub tenant_id: TenantId,
    pub trigger_kind: TriggerKind,
    pub trigger_time: DateTime<Utc>,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Time of the *next* WorkflowRun to be created for this workflow.
    pub next_trigger_time: Option<DateTime<Utc>>,
}

/// One execution instance of a `JobDefinition` inside a `WorkflowRun`
/// (§3 "JobRun").
///
/// Invariants: (a) `bucket_id` is derived and immutable; (b) status
/// transitions are monotonic except `Waiting -> Waiting` for retry;
/// (c) `completed_parents` is a subset of `parent_run_ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobRunId,
    pub workflow_run_id: WorkflowRunId,
    pub job_id: JobId,
    pub bucket_id: BucketId,
    pub status: RunStatus,
    pub trigger_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub retry_count: u32,
    pub message: Option<String>,
    pub parent_run_ids: Vec<JobRunId>,
    pub completed_parents: Vec<JobRunId>,
}

impl JobRun {
    /// §4.8 readiness predicate: ready iff parent ids are a subset of the
    /// completed-parent set. An empty parent list is trivially ready.
    pub fn is_ready(&self) -> bool {
        self.parent_run_ids
            .iter()
            .all(|p| self.completed_parents.contains(p))
    }
}

/// A live worker's advertised address (§3 "WorkerMembership").
pub type WorkerAddress = String;

/// `(address, last-heartbeat, max concurrency, current running count)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMembership {
    pub address: WorkerAddress,
    pub last_heartbeat: DateTime<Utc>,
    pub max_concurrency: u32,
    pub running: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_run_ready_with_no_parents() {
        let run = sample_job_run(vec![], vec![]);
        assert!(run.is_ready());
    }

    #[test]
    fn job_run_not_ready_until_all_parents_complete() {
        let p1 = JobRunId(1);
        let p2 = JobRunId(2);
        let run = sample_job_run(vec![p1, p2], vec![p1]);
        assert!(!run.is_ready());

        let run = sample_job_run(vec![p1, p2], vec![p1, p2]);
        assert!(run.is_ready());
    }

    #[test]
    fn run_status_round_trips_through_wire_codes() {
        for (code, status) in [
            (0, RunStatus::Waiting),
            (1, RunStatus::Running),
            (2, RunStatus::Success),
            (3, RunStatus::Fail),
            (4, RunStatus::Timeout),
            (5, RunStatus::Cancelled),
        ] {
            assert_eq!(RunStatus::try_from(code).unwrap(), status);
            assert_eq!(i32::from(status), code);
        }
        assert!(RunStatus::try_from(99).is_err());
    }

    fn sample_job_run(parents: Vec<JobRunId>, completed: Vec<JobRunId>) -> JobRun {
        JobRun {
            id: JobRunId(1),
            workflow_run_id: Uuid::now_v7(),
            job_id: Uuid::now_v7(),
            bucket_id: BucketId(0),
            status: RunStatus::Waiting,
            trigger_time: Utc::now(),
            start_time: None,
            end_time: None,
            worker_id: None,
            retry_count: 0,
            message: None,
            parent_run_ids: parents,
            completed_parents: completed,
        }
    }
}
