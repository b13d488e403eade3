//! Postgres-backed `SchedulerStore`.
//!
//! The CAS and append-unique patterns below are adapted from this crate's
//! `claim_task`/`append_events` idiom: conditional `UPDATE ... WHERE status
//! = $expected` for lock-free transitions, and `FOR UPDATE` row locks only
//! where an atomic single-statement form isn't available.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::model::*;
use super::store::{GeneratedRun, SchedulerStore, StoreError};
use super::WorkerRow;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn status_code(s: RunStatus) -> i32 {
    i32::from(s)
}

fn parse_status(code: i32) -> Result<RunStatus, StoreError> {
    RunStatus::try_from(code).map_err(StoreError::Serialization)
}

#[async_trait]
impl SchedulerStore for PostgresStore {
    async fn list_published_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, trigger_kind, trigger_value, default_timeout_secs, \
             retry_budget, priority FROM workflow WHERE status = 'PUBLISHED' AND NOT deleted",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Workflow {
                    id: row.try_get("id")?,
                    tenant_id: row.try_get("tenant_id")?,
                    trigger_kind: parse_trigger_kind(row.try_get::<String, _>("trigger_kind")?)?,
                    trigger_value: row.try_get("trigger_value")?,
                    default_timeout: chrono::Duration::seconds(row.try_get::<i64, _>("default_timeout_secs")?),
                    retry_budget: row.try_get::<i32, _>("retry_budget")? as u32,
                    priority: row.try_get("priority")?,
                    lifecycle: WorkflowLifecycle::Published,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn get_job_definition(&self, job_id: JobId) -> Result<Option<JobDefinition>, StoreError> {
        let row = sqlx::query(
            "SELECT id, workflow_id, job_type, params, timeout_secs, retry_budget, \
             retry_interval_secs, priority, routing_policy, block_on_full, own_trigger \
             FROM job_info WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_job_definition).transpose()
    }

    async fn list_job_definitions(&self, workflow_id: WorkflowId) -> Result<Vec<JobDefinition>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, job_type, params, timeout_secs, retry_budget, \
             retry_interval_secs, priority, routing_policy, block_on_full, own_trigger \
             FROM job_info WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_job_definition).collect()
    }

    async fn list_dependency_edges(&self, workflow_id: WorkflowId) -> Result<Vec<DependencyEdge>, StoreError> {
        let rows = sqlx::query(
            "SELECT workflow_id, job_id, parent_job_id FROM job_dependency WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DependencyEdge {
                workflow_id: row.get("workflow_id"),
                job_id: row.get("job_id"),
                parent_job_id: row.get("parent_job_id"),
            })
            .collect())
    }

    async fn generate_run(
        &self,
        workflow: &Workflow,
        trigger_time: DateTime<Utc>,
        job_runs: Vec<JobRun>,
        next_trigger_time: Option<DateTime<Utc>>,
    ) -> Result<Option<GeneratedRun>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Conditional insert on the (workflow_id, trigger_time) unique
        // constraint. ON CONFLICT DO NOTHING makes a duplicate generation
        // attempt a clean, side-effect-free no-op (§4.7).
        let run_id = uuid::Uuid::now_v7();
        let inserted = sqlx::query(
            "INSERT INTO workflow_run (id, workflow_id, tenant_id, status, trigger_kind, \
             trigger_time, next_trigger_time) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (workflow_id, trigger_time) DO NOTHING",
        )
        .bind(run_id)
        .bind(workflow.id)
        .bind(workflow.tenant_id)
        .bind(status_code(RunStatus::Waiting))
        .bind(trigger_kind_str(workflow.trigger_kind))
        .bind(trigger_time)
        .bind(next_trigger_time)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let mut assigned = Vec::with_capacity(job_runs.len());
        for jr in job_runs {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO job_run (workflow_run_id, job_id, bucket_id, status, trigger_time, \
                 retry_count, parent_run_ids) VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
            )
            .bind(run_id)
            .bind(jr.job_id)
            .bind(jr.bucket_id.0 as i32)
            .bind(status_code(RunStatus::Waiting))
            .bind(jr.trigger_time)
            .bind(jr.retry_count as i32)
            .bind(&jr.parent_run_ids.iter().map(|p| p.0).collect::<Vec<_>>())
            .fetch_one(&mut *tx)
            .await?;

            for parent in &jr.parent_run_ids {
                sqlx::query(
                    "INSERT INTO job_run_dependency (workflow_run_id, job_run_id, parent_run_id) \
                     VALUES ($1, $2, $3)",
                )
                .bind(run_id)
                .bind(id)
                .bind(parent.0)
                .execute(&mut *tx)
                .await?;
            }

            assigned.push(JobRun {
                id: JobRunId(id),
                workflow_run_id: run_id,
                ..jr
            });
        }

        tx.commit().await?;

        Ok(Some(GeneratedRun {
            workflow_run: WorkflowRun {
                id: run_id,
                workflow_id: workflow.id,
                tenant_id: workflow.tenant_id,
                trigger_kind: workflow.trigger_kind,
                trigger_time,
                status: RunStatus::Waiting,
                start_time: None,
                end_time: None,
                next_trigger_time,
            },
            job_runs: assigned,
        }))
    }

    async fn get_workflow_run_by_trigger_time(
        &self,
        workflow_id: WorkflowId,
        trigger_time: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let row = sqlx::query(
            "SELECT id, workflow_id, tenant_id, status, trigger_kind, trigger_time, \
             next_trigger_time, start_time, end_time FROM workflow_run \
             WHERE workflow_id = $1 AND trigger_time = $2",
        )
        .bind(workflow_id)
        .bind(trigger_time)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_workflow_run).transpose()
    }

    async fn list_running_workflow_runs_with_next_trigger(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, tenant_id, status, trigger_kind, trigger_time, \
             next_trigger_time, start_time, end_time FROM workflow_run \
             WHERE status = $1 AND next_trigger_time IS NOT NULL",
        )
        .bind(status_code(RunStatus::Running))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_workflow_run).collect()
    }

    async fn get_latest_workflow_run(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowRun>, StoreError> {
        let row = sqlx::query(
            "SELECT id, workflow_id, tenant_id, status, trigger_kind, trigger_time, \
             next_trigger_time, start_time, end_time FROM workflow_run \
             WHERE workflow_id = $1 ORDER BY trigger_time DESC LIMIT 1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_workflow_run).transpose()
    }

    async fn set_workflow_run_status(&self, id: WorkflowRunId, status: RunStatus) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_run SET status = $1, \
             end_time = CASE WHEN $2 THEN NOW() ELSE end_time END WHERE id = $3",
        )
        .bind(status_code(status))
        .bind(status.is_terminal())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_due_job_runs(
        &self,
        bucket_id: BucketId,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRun>, StoreError> {
        // Exercises the (bucket_id, status, trigger_time) index named in §6.
        let rows = sqlx::query(
            "SELECT jr.id, jr.workflow_run_id, jr.job_id, jr.bucket_id, jr.status, \
             jr.trigger_time, jr.start_time, jr.end_time, jr.worker_id, jr.retry_count, \
             jr.message, jr.parent_run_ids, \
             COALESCE((SELECT array_agg(parent_run_id) FROM completed_parent \
                       WHERE job_run_id = jr.id), ARRAY[]::bigint[]) AS completed_parents \
             FROM job_run jr WHERE jr.bucket_id = $1 AND jr.status = $2 AND jr.trigger_time <= $3 \
             ORDER BY jr.trigger_time ASC, jr.id ASC LIMIT $4",
        )
        .bind(bucket_id.0 as i32)
        .bind(status_code(RunStatus::Waiting))
        .bind(horizon)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_job_run).collect()
    }

    async fn get_job_run(&self, id: JobRunId) -> Result<Option<JobRun>, StoreError> {
        let row = sqlx::query(
            "SELECT jr.id, jr.workflow_run_id, jr.job_id, jr.bucket_id, jr.status, \
             jr.trigger_time, jr.start_time, jr.end_time, jr.worker_id, jr.retry_count, \
             jr.message, jr.parent_run_ids, \
             COALESCE((SELECT array_agg(parent_run_id) FROM completed_parent \
                       WHERE job_run_id = jr.id), ARRAY[]::bigint[]) AS completed_parents \
             FROM job_run jr WHERE jr.id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_job_run).transpose()
    }

    async fn cas_job_run_status(
        &self,
        id: JobRunId,
        from: RunStatus,
        to: RunStatus,
        worker_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE job_run SET status = $1, worker_id = COALESCE($2, worker_id), \
             start_time = CASE WHEN $3 THEN NOW() ELSE start_time END, \
             end_time = CASE WHEN $6 THEN NOW() ELSE end_time END \
             WHERE id = $4 AND status = $5",
        )
        .bind(status_code(to))
        .bind(worker_id)
        .bind(to == RunStatus::Running)
        .bind(id.0)
        .bind(status_code(from))
        .bind(to.is_terminal())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_job_run(
        &self,
        id: JobRunId,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE job_run SET status = $1, end_time = NOW(), message = $2 \
             WHERE id = $3 AND status = $4",
        )
        .bind(status_code(status))
        .bind(message)
        .bind(id.0)
        .bind(status_code(RunStatus::Running))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn requeue_for_retry(
        &self,
        id: JobRunId,
        retry_count: u32,
        trigger_time: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE job_run SET status = $1, retry_count = $2, trigger_time = $3, \
             start_time = NULL, end_time = NULL WHERE id = $4 AND status != $5",
        )
        .bind(status_code(RunStatus::Waiting))
        .bind(retry_count as i32)
        .bind(trigger_time)
        .bind(id.0)
        .bind(status_code(RunStatus::Cancelled))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_dependent_job_runs(&self, parent_id: JobRunId) -> Result<Vec<JobRunId>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT job_run_id FROM job_run_dependency WHERE parent_run_id = $1",
        )
        .bind(parent_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(JobRunId).collect())
    }

    async fn mark_parent_completed(&self, child_id: JobRunId, parent_id: JobRunId) -> Result<(), StoreError> {
        // Side-table append-unique form (§9): a unique (job_run_id,
        // parent_run_id) key makes concurrent completions of distinct
        // parents of the same child race-free without a row lock.
        sqlx::query(
            "INSERT INTO completed_parent (job_run_id, parent_run_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(child_id.0)
        .bind(parent_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_descendants(&self, root: JobRunId) -> Result<(), StoreError> {
        // Recursive CTE over job_run_dependency, batch status update of
        // every non-terminal descendant (§5 "Cancellation" batch update).
        sqlx::query(
            "WITH RECURSIVE descendants(id) AS ( \
                SELECT job_run_id FROM job_run_dependency WHERE parent_run_id = $1 \
                UNION \
                SELECT d.job_run_id FROM job_run_dependency d \
                JOIN descendants ON d.parent_run_id = descendants.id \
             ) \
             UPDATE job_run SET status = $2, end_time = NOW() \
             WHERE id IN (SELECT id FROM descendants) AND status NOT IN ($3, $4, $5, $6)",
        )
        .bind(root.0)
        .bind(status_code(RunStatus::Cancelled))
        .bind(status_code(RunStatus::Success))
        .bind(status_code(RunStatus::Fail))
        .bind(status_code(RunStatus::Timeout))
        .bind(status_code(RunStatus::Cancelled))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat_worker(&self, address: &str, max_concurrency: u32, running: u32) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO worker_registry (address, max_concurrency, running, heartbeat_at) \
             VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (address) DO UPDATE SET \
                max_concurrency = EXCLUDED.max_concurrency, \
                running = EXCLUDED.running, \
                heartbeat_at = EXCLUDED.heartbeat_at",
        )
        .bind(address)
        .bind(max_concurrency as i32)
        .bind(running as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_alive_workers(
        &self,
        now: DateTime<Utc>,
        liveness_window: chrono::Duration,
    ) -> Result<Vec<WorkerRow>, StoreError> {
        let since = now - liveness_window;
        let rows = sqlx::query(
            "SELECT address, max_concurrency, running, heartbeat_at FROM worker_registry \
             WHERE heartbeat_at >= $1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| WorkerRow {
                address: row.get("address"),
                last_heartbeat: row.get("heartbeat_at"),
                max_concurrency: row.get::<i32, _>("max_concurrency") as u32,
                running: row.get::<i32, _>("running") as u32,
            })
            .collect())
    }

    async fn list_stale_running_job_runs(&self, stale_before: DateTime<Utc>) -> Result<Vec<JobRun>, StoreError> {
        let rows = sqlx::query(
            "SELECT jr.id, jr.workflow_run_id, jr.job_id, jr.bucket_id, jr.status, \
             jr.trigger_time, jr.start_time, jr.end_time, jr.worker_id, jr.retry_count, \
             jr.message, jr.parent_run_ids, \
             COALESCE((SELECT array_agg(parent_run_id) FROM completed_parent \
                       WHERE job_run_id = jr.id), ARRAY[]::bigint[]) AS completed_parents \
             FROM job_run jr \
             LEFT JOIN worker_registry w ON w.address = jr.worker_id \
             WHERE jr.status = $1 AND (w.heartbeat_at IS NULL OR w.heartbeat_at < $2)",
        )
        .bind(status_code(RunStatus::Running))
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_job_run).collect()
    }
}

fn trigger_kind_str(k: TriggerKind) -> &'static str {
    match k {
        TriggerKind::Cron => "CRON",
        TriggerKind::FixedRate => "FIXED_RATE",
        TriggerKind::FixedDelay => "FIXED_DELAY",
        TriggerKind::Manual => "MANUAL",
        TriggerKind::Api => "API",
    }
}

fn parse_trigger_kind(s: String) -> Result<TriggerKind, sqlx::Error> {
    match s.as_str() {
        "CRON" => Ok(TriggerKind::Cron),
        "FIXED_RATE" => Ok(TriggerKind::FixedRate),
        "FIXED_DELAY" => Ok(TriggerKind::FixedDelay),
        "MANUAL" => Ok(TriggerKind::Manual),
        "API" => Ok(TriggerKind::Api),
        other => Err(sqlx::Error::Decode(format!("unknown trigger_kind {other}").into())),
    }
}

fn row_to_job_definition(row: sqlx::postgres::PgRow) -> Result<JobDefinition, StoreError> {
    Ok(JobDefinition {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        job_type: row.try_get("job_type")?,
        params: row.try_get("params")?,
        timeout: chrono::Duration::seconds(row.try_get::<i64, _>("timeout_secs")?),
        retry_budget: row.try_get::<i32, _>("retry_budget")? as u32,
        retry_interval: chrono::Duration::seconds(row.try_get::<i64, _>("retry_interval_secs")?),
        priority: row.try_get("priority")?,
        routing_policy: row.try_get("routing_policy")?,
        block_on_full: if row.try_get::<String, _>("block_on_full")? == "DROP" {
            BlockOnFullPolicy::Drop
        } else {
            BlockOnFullPolicy::Block
        },
        own_trigger: row.try_get("own_trigger")?,
    })
}

fn row_to_workflow_run(row: sqlx::postgres::PgRow) -> Result<WorkflowRun, StoreError> {
    Ok(WorkflowRun {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        tenant_id: row.try_get("tenant_id")?,
        trigger_kind: parse_trigger_kind(row.try_get::<String, _>("trigger_kind")?)?,
        trigger_time: row.try_get("trigger_time")?,
        status: parse_status(row.try_get("status")?)?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        next_trigger_time: row.try_get("next_trigger_time")?,
    })
}

fn row_to_job_run(row: sqlx::postgres::PgRow) -> Result<JobRun, StoreError> {
    let parent_ids: Vec<i64> = row.try_get("parent_run_ids")?;
    let completed_parents: Vec<JobRunId> = row
        .try_get::<Vec<i64>, _>("completed_parents")?
        .into_iter()
        .map(JobRunId)
        .collect();

    Ok(JobRun {
        id: JobRunId(row.try_get("id")?),
        workflow_run_id: row.try_get("workflow_run_id")?,
        job_id: row.try_get("job_id")?,
        bucket_id: BucketId(row.try_get::<i32, _>("bucket_id")? as u32),
        status: parse_status(row.try_get("status")?)?,
        trigger_time: row.try_get("trigger_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        worker_id: row.try_get("worker_id")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        message: row.try_get("message")?,
        parent_run_ids: parent_ids.into_iter().map(JobRunId).collect(),
        completed_parents,
    })
}
