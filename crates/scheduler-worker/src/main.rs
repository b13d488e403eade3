//! Worker entry point: wires `scheduler_core::Scheduler` to a Postgres-backed
//! `SchedulerStore` and a process-local `Executor`, the same shape as
//! `crates/worker/src/main.rs`'s telemetry-init / config-load / run-or-
//! ctrl-c pattern.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scheduler_core::config::SchedulerConfig;
use scheduler_core::dispatch::Executor;
use scheduler_core::persistence::model::JobRun;
use scheduler_core::persistence::postgres::PostgresStore;
use scheduler_core::persistence::SchedulerStore;
use scheduler_core::telemetry::{init_telemetry, TelemetryConfig};
use scheduler_core::Scheduler;

/// §1/§4.6.d: execution is an opaque external collaborator this crate does
/// not own. This stand-in logs the hand-off and reports success
/// immediately; a real deployment replaces it with whatever runs the
/// job-type's actual work (a task queue, a gRPC call to a runner fleet,
/// etc.) and reports completion back through the same `Executor::execute`
/// contract.
struct LoggingExecutor;

#[async_trait]
impl Executor for LoggingExecutor {
    async fn execute(&self, run: &JobRun) -> Result<(), String> {
        tracing::info!(job_run_id = %run.id, job_id = %run.job_id, bucket_id = run.bucket_id.0, "executing job run");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        telemetry_config.log_filter = Some(format!("scheduler_core={log_level},scheduler_worker={log_level}"));
    }
    let _telemetry_guard = init_telemetry(telemetry_config);

    tracing::info!("scheduler-worker starting...");

    let config = SchedulerConfig::from_env();
    tracing::info!(
        worker_address = %config.worker_address,
        bucket_count = config.bucket_count,
        max_concurrency = config.max_concurrency,
        "loaded scheduler configuration"
    );

    let store = PostgresStore::connect(&config.database_url)
        .await
        .context("failed to connect to durable store")?;
    store.migrate().await.context("failed to run scheduler migrations")?;
    let store: Arc<dyn SchedulerStore> = Arc::new(store);

    let executor = Arc::new(LoggingExecutor);
    let scheduler = Scheduler::new(config, store, executor);

    tokio::select! {
        result = scheduler.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "scheduler exited with error");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            scheduler.shutdown();
        }
    }

    tracing::info!("scheduler-worker shutdown complete");
    Ok(())
}
