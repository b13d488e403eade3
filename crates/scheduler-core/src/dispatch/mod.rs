//! C7: Dispatch Loop. A single logical task per worker: polls due entries
//! from C6, checks dependency readiness against C1, triggers execution,
//! updates state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::jobcache::JobInfoCache;
use crate::persistence::model::{BucketId, JobRun, JobRunId, RunStatus};
use crate::persistence::{SchedulerStore, StoreError};
use crate::preload::PreloadCache;
use crate::propagator::{CascadePolicy, Propagator, RunEnqueuer};

/// §6 `dispatch-tick-interval` (default 1s).
pub const DEFAULT_TICK_INTERVAL: StdDuration = StdDuration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Hands a ready, claimed `JobRun` off to the execution subsystem, an
/// opaque external collaborator per §4.6.d. Implementations report
/// synchronous failure by returning `Err`, at which point the dispatch loop
/// transitions the run to FAIL and runs propagation itself.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, run: &JobRun) -> Result<(), String>;
}

pub struct DispatchLoopConfig {
    pub tick_interval: StdDuration,
    pub max_concurrency: usize,
    pub worker_id: String,
}

/// Runs the four numbered steps of §4.6 against whatever buckets
/// `bucket_manager` currently owns.
pub struct DispatchLoop {
    store: Arc<dyn SchedulerStore>,
    preload: Arc<PreloadCache>,
    job_cache: Arc<JobInfoCache>,
    executor: Arc<dyn Executor>,
    propagator: Arc<Propagator>,
    enqueuer: Arc<dyn RunEnqueuer>,
    concurrency: Arc<Semaphore>,
    config: DispatchLoopConfig,
    /// Runs claimed by this worker and still executing, keyed by id, paired
    /// with their deadline (§5 "Timeouts"). A synchronous snapshot source
    /// for the timeout monitor, which cannot await mid-scan.
    running: Arc<DashMap<JobRunId, (JobRun, chrono::Duration)>>,
}

impl DispatchLoop {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        preload: Arc<PreloadCache>,
        job_cache: Arc<JobInfoCache>,
        executor: Arc<dyn Executor>,
        propagator: Arc<Propagator>,
        enqueuer: Arc<dyn RunEnqueuer>,
        config: DispatchLoopConfig,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            store,
            preload,
            job_cache,
            executor,
            propagator,
            enqueuer,
            concurrency,
            config,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn current_load(&self) -> usize {
        self.config.max_concurrency - self.concurrency.available_permits()
    }

    /// Runs currently claimed and executing, paired with their deadline.
    /// Read by the timeout monitor's synchronous `candidates`/`resolve_timeout`
    /// closures (§5 "Timeouts").
    pub fn running_snapshot(&self) -> Vec<(JobRun, chrono::Duration)> {
        self.running.iter().map(|e| e.value().clone()).collect()
    }

    /// Drops a run from the in-flight set once it reaches a terminal state
    /// through any path (normal completion, forced timeout, or cascade
    /// cancellation), so the timeout monitor stops scanning it.
    pub fn forget(&self, id: JobRunId) {
        self.running.remove(&id);
    }

    /// One dispatch tick over every bucket currently owned (a snapshot
    /// taken by the caller, typically via `BucketManager::owned_handle`).
    /// Returns the number of runs successfully claimed and handed off.
    pub async fn tick(&self, owned_buckets: &HashSet<BucketId>) -> Result<usize, DispatchError> {
        // Step 1: snapshot owned buckets.
        let now = Utc::now();
        let mut dispatched = 0;

        for bucket in owned_buckets.iter().copied() {
            // The loop pauses (skips further claims) once current-running
            // reaches max-concurrency (§4.6 "Concurrency").
            if self.concurrency.available_permits() == 0 {
                break;
            }

            // Step 2: poll due entries for this bucket.
            for candidate in self.preload.poll_due(bucket, now) {
                if self.concurrency.available_permits() == 0 {
                    break;
                }
                if self.try_dispatch(candidate).await? {
                    dispatched += 1;
                }
            }
        }

        Ok(dispatched)
    }

    async fn try_dispatch(&self, candidate: JobRun) -> Result<bool, DispatchError> {
        // Step (a): re-read canonical status to guard against stale reads.
        let Some(current) = self.store.get_job_run(candidate.id).await? else {
            return Ok(false);
        };
        if current.status != RunStatus::Waiting {
            return Ok(false);
        }

        // Step (b): dependency readiness (§4.8). Not ready -> discard;
        // the propagator will re-enqueue once parents complete.
        if !current.is_ready() {
            return Ok(false);
        }

        // §7 "Missing definition": a definition withdrawn between
        // generation and dispatch cancels the run rather than dispatching
        // into the void. The run is still WAITING here, not RUNNING, so
        // this goes through `cas_job_run_status` (WAITING -> CANCELLED)
        // rather than `finish_job_run`, which only ever completes a
        // RUNNING row (§4.8 step 1). No retry is attempted — a missing
        // definition would fail the same way on every future attempt — so
        // descendants are cascade-cancelled and the workflow run failed
        // directly, the same terminal cascade `handle_non_success` applies
        // once a FAIL's retry budget is exhausted.
        let Some(definition) = self.job_cache.get(current.job_id).await.ok().flatten() else {
            let cancelled = self
                .store
                .cas_job_run_status(current.id, RunStatus::Waiting, RunStatus::Cancelled, None)
                .await?;
            if cancelled {
                warn!(job_run_id = %current.id, job_id = %current.job_id, "cancelled job run: definition missing at dispatch");
                self.store.cancel_descendants(current.id).await?;
                self.store.set_workflow_run_status(current.workflow_run_id, RunStatus::Fail).await?;
            }
            return Ok(false);
        };

        // Step (c): CAS WAITING -> RUNNING.
        let won = self
            .store
            .cas_job_run_status(current.id, RunStatus::Waiting, RunStatus::Running, Some(&self.config.worker_id))
            .await?;
        if !won {
            debug!(job_run_id = %current.id, "lost dispatch CAS race, skipping");
            return Ok(false);
        }

        let permit = self
            .concurrency
            .clone()
            .try_acquire_owned()
            .map_err(|_| StoreError::Database("dispatch concurrency exhausted".into()))?;

        self.running.insert(current.id, (current.clone(), definition.timeout));

        // Step (d): hand off to execution. Either outcome is reported to the
        // propagator so the §4.8 cascade runs: success unblocks dependents,
        // synchronous failure transitions to FAIL and cascades per policy.
        // Neither arm leaves the run stuck at RUNNING.
        let executor = self.executor.clone();
        let propagator = self.propagator.clone();
        let enqueuer = self.enqueuer.clone();
        let run_for_exec = current.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match executor.execute(&run_for_exec).await {
                Ok(()) => {
                    if let Err(e) = propagator
                        .on_completed(run_for_exec.id, RunStatus::Success, None, CascadePolicy::FailFast, enqueuer.as_ref())
                        .await
                    {
                        warn!(job_run_id = %run_for_exec.id, error = %e, "propagation after successful completion failed");
                    }
                }
                Err(err) => {
                    warn!(job_run_id = %run_for_exec.id, error = %err, "job run execution failed synchronously");
                    if let Err(e) = propagator
                        .on_completed(run_for_exec.id, RunStatus::Fail, Some(err), CascadePolicy::FailFast, enqueuer.as_ref())
                        .await
                    {
                        warn!(job_run_id = %run_for_exec.id, error = %e, "propagation after synchronous failure failed");
                    }
                }
            }
            running.remove(&run_for_exec.id);
        });

        Ok(true)
    }

    /// Runs forever at `tick_interval` cadence (§5 "Dispatch loop suspends
    /// on queue-empty").
    pub async fn run(&self, owned_buckets: Arc<RwLock<HashSet<BucketId>>>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = owned_buckets.read().clone();
                    match self.tick(&snapshot).await {
                        Ok(n) if n > 0 => info!(dispatched = n, "dispatch tick"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "dispatch tick failed"),
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
