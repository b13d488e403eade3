//! Bucket-partitioned, dependency-aware distributed job scheduling engine.
//!
//! Each module corresponds to one of the cooperating components: C2 bucket
//! hashing, C3 worker registry, C4 bucket manager, C5 job-info cache, C6
//! preload cache, C7 dispatch loop, C8 dependency propagator, C9 workflow
//! run generator, C10 recovery engine, plus the persistence layer (C1) and
//! the reliability primitives (retry/timeout) shared across them.
//!
//! [`Scheduler`] owns one instance of each live component and exposes
//! `run`/`shutdown`, mirroring this codebase's `WorkerPool`.

pub mod bucket;
pub mod config;
pub mod dispatch;
pub mod generator;
pub mod hashing;
pub mod jobcache;
pub mod persistence;
pub mod preload;
pub mod propagator;
pub mod recovery;
pub mod registry;
pub mod reliability;
pub mod telemetry;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use bucket::{BucketEvent, BucketManager};
use config::SchedulerConfig;
use dispatch::{DispatchLoop, DispatchLoopConfig, Executor};
use generator::RunGenerator;
use jobcache::JobInfoCache;
use persistence::model::{BucketId, JobRun, JobRunId, RunStatus, WorkflowId};
use persistence::SchedulerStore;
use preload::PreloadCache;
use propagator::{CascadePolicy, PropagationError, Propagator, RunEnqueuer};
use recovery::RecoveryEngine;
use registry::WorkerRegistry;
use reliability::TimeoutMonitor;

/// Errors surfaced by [`Scheduler::run`]. Mirrors `WorkerPoolError`: the
/// library never reaches for `anyhow` itself (that's reserved for the
/// binary boundary, `crates/scheduler-worker/src/main.rs`); a background
/// task panicking is the only failure `run` cannot simply log and
/// continue past, since every other per-tick error is already swallowed
/// with a `warn!` inside that task's own loop.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("background task {name} panicked: {source}")]
    TaskPanicked {
        name: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Feeds a run the propagator just marked WAITING (a retry, or a dependent
/// unblocked by its parents completing) straight back into this worker's
/// own preload queue, the same path C9 generation uses (§4.8 step 4).
struct PreloadEnqueuer(Arc<PreloadCache>);

#[async_trait::async_trait]
impl RunEnqueuer for PreloadEnqueuer {
    async fn enqueue(&self, run: &JobRun) {
        self.0.on_new_run(run.clone()).await;
    }
}

/// Owns one instance of every C2-C10 component wired together, and the
/// shutdown channel every background task races against.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn SchedulerStore>,
    registry: Arc<WorkerRegistry>,
    bucket_manager: Arc<BucketManager>,
    job_cache: Arc<JobInfoCache>,
    preload: Arc<PreloadCache>,
    dispatch: Arc<DispatchLoop>,
    propagator: Arc<Propagator>,
    enqueuer: Arc<dyn RunEnqueuer>,
    generator: Arc<RunGenerator>,
    recovery: Arc<RecoveryEngine>,
    timeout_monitor: Arc<TimeoutMonitor>,
    published_workflow_ids: Arc<RwLock<Vec<WorkflowId>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn SchedulerStore>, executor: Arc<dyn Executor>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = Arc::new(WorkerRegistry::new(store.clone(), config.registry_config()));
        let bucket_manager = Arc::new(BucketManager::new(
            config.worker_address.clone(),
            config.bucket_manager_config(),
        ));
        let job_cache = Arc::new(JobInfoCache::new(store.clone()));
        let preload = Arc::new(PreloadCache::new(store.clone(), job_cache.clone()).with_limits(
            config.preload_batch_size,
            config.preload_max_cached_ids,
        ));
        let propagator = Arc::new(Propagator::new(store.clone()));
        let enqueuer: Arc<dyn RunEnqueuer> = Arc::new(PreloadEnqueuer(preload.clone()));
        let dispatch = Arc::new(DispatchLoop::new(
            store.clone(),
            preload.clone(),
            job_cache.clone(),
            executor,
            propagator.clone(),
            enqueuer.clone(),
            DispatchLoopConfig {
                tick_interval: config.dispatch_tick_interval,
                max_concurrency: config.max_concurrency,
                worker_id: config.worker_address.clone(),
            },
        ));
        let generator = Arc::new(RunGenerator::new(store.clone(), config.bucket_count));
        let recovery = Arc::new(RecoveryEngine::new(
            store.clone(),
            config.bucket_count,
            config.registry_config(),
            propagator.clone(),
            enqueuer.clone(),
        ));
        let timeout_monitor = Arc::new(TimeoutMonitor::new(propagator.clone(), enqueuer.clone()));

        Self {
            config,
            store,
            registry,
            bucket_manager,
            job_cache,
            preload,
            dispatch,
            propagator,
            enqueuer,
            generator,
            recovery,
            timeout_monitor,
            published_workflow_ids: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// §4.9: runs the recovery pass once, then spawns every other component
    /// as a named background task racing the shared shutdown signal, and
    /// blocks until all of them return (i.e. until `shutdown()` is called).
    pub async fn run(&self) -> Result<(), SchedulerError> {
        match self.recovery.run_once().await {
            Ok(report) => info!(
                workflow_runs_materialized = report.workflow_runs_materialized,
                job_runs_reclaimed = report.job_runs_reclaimed,
                "startup recovery complete"
            ),
            Err(e) => warn!(error = %e, "startup recovery failed, continuing anyway"),
        }

        self.registry
            .heartbeat(&self.config.worker_address, self.config.max_concurrency as u32, 0)
            .await
            .ok();

        let (bucket_events_tx, bucket_events_rx) = mpsc::channel::<BucketEvent>(1024);

        let handles: Vec<(&'static str, JoinHandle<()>)> = vec![
            ("registry", self.spawn_registry_loop()),
            ("heartbeat", self.spawn_heartbeat_loop()),
            ("bucket_manager", self.spawn_bucket_manager_loop(bucket_events_tx)),
            ("preload", self.spawn_preload_loop(bucket_events_rx)),
            ("dispatch", self.spawn_dispatch_loop()),
            ("generator", self.spawn_generator_loop()),
            ("timeout_monitor", self.spawn_timeout_monitor_loop()),
            ("job_cache_refresh", self.spawn_job_cache_refresh_loop()),
            ("published_workflow_refresh", self.spawn_published_workflow_refresh_loop()),
        ];

        let mut first_panic = None;
        for (name, handle) in handles {
            if let Err(source) = handle.await {
                warn!(task = name, error = %source, "scheduler background task panicked");
                first_panic.get_or_insert(SchedulerError::TaskPanicked { name, source });
            }
        }

        match first_panic {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Signals every spawned task to stop and return after its current
    /// iteration, the same one-shot `watch::channel(false)` idiom this
    /// codebase's `WorkerPool::shutdown` uses.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn owned_buckets(&self) -> HashSet<BucketId> {
        self.bucket_manager.owned_buckets().into_iter().collect()
    }

    fn spawn_registry_loop(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move { registry.run(shutdown).await })
    }

    /// Re-heartbeats this worker at `heartbeat_interval` cadence so the
    /// registry's poll loop (running on the same cadence) always observes a
    /// fresh row; this is the "self-reports" half of C3, distinct from
    /// `WorkerRegistry::run`'s "observes everyone" half.
    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let address = self.config.worker_address.clone();
        let max_concurrency = self.config.max_concurrency as u32;
        let dispatch = self.dispatch.clone();
        let interval = self.config.heartbeat_interval;
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let running = dispatch.current_load() as u32;
                        if let Err(e) = store.heartbeat_worker(&address, max_concurrency, running).await {
                            warn!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_bucket_manager_loop(&self, events: mpsc::Sender<BucketEvent>) -> JoinHandle<()> {
        let bucket_manager = self.bucket_manager.clone();
        let alive_rx = self.registry.subscribe();
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move { bucket_manager.run(alive_rx, events, shutdown).await })
    }

    fn spawn_preload_loop(&self, events: mpsc::Receiver<BucketEvent>) -> JoinHandle<()> {
        let preload = self.preload.clone();
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move { preload.run(events, shutdown).await })
    }

    fn spawn_dispatch_loop(&self) -> JoinHandle<()> {
        let dispatch = self.dispatch.clone();
        let owned = self.bucket_manager.owned_handle();
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move { dispatch.run(owned, shutdown).await })
    }

    fn spawn_generator_loop(&self) -> JoinHandle<()> {
        let generator = self.generator.clone();
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move { generator.run(shutdown).await })
    }

    /// Wires `TimeoutMonitor::run`'s three synchronous closures to the
    /// dispatch loop's in-flight snapshot (`candidates`/`resolve_timeout`,
    /// since the monitor cannot await mid-scan). `force_timeout` itself
    /// routes through the propagator, so the cascade to dependents already
    /// happened by the time `on_timed_out` fires; that callback only needs
    /// to drop the run from dispatch's in-flight set.
    fn spawn_timeout_monitor_loop(&self) -> JoinHandle<()> {
        let monitor = self.timeout_monitor.clone();
        let dispatch = self.dispatch.clone();
        let job_cache = self.job_cache.clone();
        let shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let dispatch_for_candidates = dispatch.clone();
            let candidates_fn = move || {
                dispatch_for_candidates
                    .running_snapshot()
                    .into_iter()
                    .map(|(run, _timeout)| run)
                    .collect::<Vec<_>>()
            };

            let dispatch_for_timeouts = dispatch.clone();
            let job_cache_for_resolve = job_cache.clone();
            let resolve_timeout_fn = move |run: &persistence::model::JobRun| {
                dispatch_for_timeouts
                    .running_snapshot()
                    .into_iter()
                    .find(|(r, _)| r.id == run.id)
                    .map(|(_, timeout)| timeout)
                    .or_else(|| job_cache_for_resolve.get_cached(run.job_id).map(|d| d.timeout))
                    .unwrap_or_else(|| chrono::Duration::seconds(0))
            };

            let dispatch_for_forget = dispatch.clone();
            let on_timed_out_fn = move |run: &persistence::model::JobRun| {
                dispatch_for_forget.forget(run.id);
                info!(job_run_id = %run.id, "job run timed out, forgotten from in-flight set");
            };

            monitor.run(resolve_timeout_fn, on_timed_out_fn, candidates_fn, shutdown).await
        })
    }

    fn spawn_job_cache_refresh_loop(&self) -> JoinHandle<()> {
        let job_cache = self.job_cache.clone();
        let published = self.published_workflow_ids.clone();
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let workflow_ids_fn = move || published.read().clone();
            job_cache.run_refresh_loop(workflow_ids_fn, shutdown).await
        })
    }

    /// Keeps `published_workflow_ids` current so the job-cache refresh loop
    /// (which needs a synchronous workflow-id source) has something to read
    /// without reaching back into the store itself.
    fn spawn_published_workflow_refresh_loop(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let published = self.published_workflow_ids.clone();
        let interval = self.config.heartbeat_interval;
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.list_published_workflows().await {
                            Ok(workflows) => {
                                *published.write() = workflows.into_iter().map(|w| w.id).collect();
                            }
                            Err(e) => warn!(error = %e, "failed to refresh published workflow list"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
