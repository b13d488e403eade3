//! C6: Preload Cache. Per-bucket, per-worker queues of pending run
//! instances fetched from C1 on `acquired`, drained by the dispatch loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::bucket::BucketEvent;
use crate::jobcache::JobInfoCache;
use crate::persistence::model::{BucketId, JobRun, JobRunId};
use crate::persistence::{SchedulerStore, StoreError};

/// §6 `preload-batch-size` (default 1000).
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// §6 `preload-max-cached-ids` (default 50 000).
pub const DEFAULT_MAX_CACHED_IDS: usize = 50_000;
/// How far ahead of "now" to preload (§4.5 "trigger_time < now + horizon").
pub const DEFAULT_HORIZON: ChronoDuration = ChronoDuration::seconds(60);
/// Janitor reconciliation cadence (§4.5 "a 30s janitor").
pub const JANITOR_INTERVAL: StdDuration = StdDuration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum PreloadError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Ordered by `(trigger_time, id)` per §4.5's tie-break rule.
type BucketQueue = BTreeMap<(DateTime<Utc>, JobRunId), JobRun>;

pub struct PreloadCache {
    store: Arc<dyn SchedulerStore>,
    job_cache: Arc<JobInfoCache>,
    queues: DashMap<BucketId, parking_lot::Mutex<BucketQueue>>,
    dedup: DashMap<JobRunId, ()>,
    max_cached_ids: usize,
    batch_size: usize,
    max_seen_id: AtomicI64,
}

impl PreloadCache {
    pub fn new(store: Arc<dyn SchedulerStore>, job_cache: Arc<JobInfoCache>) -> Self {
        Self {
            store,
            job_cache,
            queues: DashMap::new(),
            dedup: DashMap::new(),
            max_cached_ids: DEFAULT_MAX_CACHED_IDS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_seen_id: AtomicI64::new(0),
        }
    }

    pub fn with_limits(mut self, batch_size: usize, max_cached_ids: usize) -> Self {
        self.batch_size = batch_size;
        self.max_cached_ids = max_cached_ids;
        self
    }

    fn insert_unchecked(&self, queue: &mut BucketQueue, run: JobRun) {
        if self.dedup.len() >= self.max_cached_ids && !self.dedup.contains_key(&run.id) {
            warn!(job_run_id = %run.id, "preload dedup set at capacity, refusing insert");
            return;
        }
        self.dedup.insert(run.id, ());
        queue.insert((run.trigger_time, run.id), run);
        self.advance_max_seen(run.id);
    }

    fn advance_max_seen(&self, id: JobRunId) {
        self.max_seen_id.fetch_max(id.0, Ordering::SeqCst);
    }

    /// `bucketAcquired(b)` (§4.5): bulk-load WAITING rows due within the
    /// horizon, enrich from C5 (a present-but-unused step here since
    /// `JobRun` already carries `job_id` and the dispatch loop resolves the
    /// definition at dispatch time), and record ids in the dedup set.
    pub async fn on_bucket_acquired(&self, bucket: BucketId) -> Result<usize, PreloadError> {
        let horizon = Utc::now() + DEFAULT_HORIZON;
        let rows = self.store.list_due_job_runs(bucket, horizon, self.batch_size).await?;
        let mut queue = BucketQueue::new();
        let count = rows.len();
        for run in rows {
            self.insert_unchecked(&mut queue, run);
        }
        self.queues.insert(bucket, parking_lot::Mutex::new(queue));
        info!(bucket = bucket.0, loaded = count, "preload cache loaded bucket");
        Ok(count)
    }

    /// `bucketLost(b)` (§4.5): drop the bucket's queue and its ids from the
    /// dedup set.
    pub fn on_bucket_lost(&self, bucket: BucketId) {
        if let Some((_, queue)) = self.queues.remove(&bucket) {
            for run in queue.into_inner().values() {
                self.dedup.remove(&run.id);
            }
        }
    }

    /// Incremental fetch triggered by a "new id" signal from C9/C8: pulls
    /// any WAITING rows newer than the cursor into owned buckets' queues.
    pub async fn on_new_run(&self, run: JobRun) {
        if let Some(queue) = self.queues.get(&run.bucket_id) {
            self.insert_unchecked(&mut queue.lock(), run);
        }
    }

    /// `pollDue(bucket, now)` (§4.5): returns and removes entries with
    /// `trigger_time <= now`.
    pub fn poll_due(&self, bucket: BucketId, now: DateTime<Utc>) -> Vec<JobRun> {
        let Some(queue) = self.queues.get(&bucket) else {
            return Vec::new();
        };
        let mut queue = queue.lock();
        let due_keys: Vec<(DateTime<Utc>, JobRunId)> = queue
            .range(..=(now, JobRunId(i64::MAX)))
            .map(|(k, _)| *k)
            .collect();
        due_keys
            .into_iter()
            .filter_map(|k| queue.remove(&k))
            .collect()
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    pub fn queued_len(&self, bucket: BucketId) -> usize {
        self.queues.get(&bucket).map(|q| q.lock().len()).unwrap_or(0)
    }

    /// 30s janitor reconciling the dedup set against the queues, preventing
    /// drift (§4.5).
    pub fn reconcile_dedup(&self) {
        let live: std::collections::HashSet<JobRunId> = self
            .queues
            .iter()
            .flat_map(|q| q.value().lock().values().map(|r| r.id).collect::<Vec<_>>())
            .collect();
        self.dedup.retain(|id, _| live.contains(id));
    }

    /// Reacts to `BucketEvent`s from C4 and runs the periodic janitor pass.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<BucketEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut janitor = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    match event {
                        BucketEvent::Acquired(b) => {
                            if let Err(e) = self.on_bucket_acquired(b).await {
                                warn!(bucket = b.0, error = %e, "failed to preload bucket");
                            }
                        }
                        BucketEvent::Lost(b) => self.on_bucket_lost(b),
                    }
                }
                _ = janitor.tick() => {
                    self.reconcile_dedup();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                else => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryStore;
    use crate::persistence::model::RunStatus;

    fn run(id: i64, bucket: u32, trigger_time: DateTime<Utc>) -> JobRun {
        JobRun {
            id: JobRunId(id),
            workflow_run_id: uuid::Uuid::now_v7(),
            job_id: uuid::Uuid::now_v7(),
            bucket_id: BucketId(bucket),
            status: RunStatus::Waiting,
            trigger_time,
            start_time: None,
            end_time: None,
            worker_id: None,
            retry_count: 0,
            message: None,
            parent_run_ids: vec![],
            completed_parents: vec![],
        }
    }

    fn cache() -> PreloadCache {
        let store = Arc::new(InMemoryStore::new());
        let job_cache = Arc::new(JobInfoCache::new(store.clone()));
        PreloadCache::new(store, job_cache)
    }

    #[test]
    fn poll_due_returns_entries_in_trigger_time_order() {
        let cache = cache();
        let bucket = BucketId(0);
        cache.queues.insert(bucket, parking_lot::Mutex::new(BucketQueue::new()));
        let t0 = Utc::now() - ChronoDuration::seconds(10);
        let t1 = Utc::now() - ChronoDuration::seconds(5);

        {
            let q = cache.queues.get(&bucket).unwrap();
            let mut q = q.lock();
            cache.insert_unchecked(&mut q, run(2, 0, t1));
            cache.insert_unchecked(&mut q, run(1, 0, t0));
        }

        let due = cache.poll_due(bucket, Utc::now());
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, JobRunId(1));
        assert_eq!(due[1].id, JobRunId(2));
        assert_eq!(cache.queued_len(bucket), 0, "poll_due removes returned entries");
    }

    #[test]
    fn poll_due_leaves_not_yet_due_entries_queued() {
        let cache = cache();
        let bucket = BucketId(0);
        cache.queues.insert(bucket, parking_lot::Mutex::new(BucketQueue::new()));
        let future = Utc::now() + ChronoDuration::seconds(30);

        {
            let q = cache.queues.get(&bucket).unwrap();
            cache.insert_unchecked(&mut q.lock(), run(1, 0, future));
        }

        assert!(cache.poll_due(bucket, Utc::now()).is_empty());
        assert_eq!(cache.queued_len(bucket), 1);
    }

    #[test]
    fn on_bucket_lost_drops_the_queue_and_dedup_entries() {
        let cache = cache();
        let bucket = BucketId(0);
        cache.queues.insert(bucket, parking_lot::Mutex::new(BucketQueue::new()));
        {
            let q = cache.queues.get(&bucket).unwrap();
            cache.insert_unchecked(&mut q.lock(), run(1, 0, Utc::now()));
        }
        assert_eq!(cache.dedup_len(), 1);

        cache.on_bucket_lost(bucket);
        assert_eq!(cache.dedup_len(), 0);
        assert_eq!(cache.queued_len(bucket), 0);
    }

    #[test]
    fn dedup_cap_refuses_further_insertions() {
        let cache = cache().with_limits(DEFAULT_BATCH_SIZE, 1);
        let bucket = BucketId(0);
        cache.queues.insert(bucket, parking_lot::Mutex::new(BucketQueue::new()));
        {
            let q = cache.queues.get(&bucket).unwrap();
            let mut q = q.lock();
            cache.insert_unchecked(&mut q, run(1, 0, Utc::now()));
            cache.insert_unchecked(&mut q, run(2, 0, Utc::now()));
        }
        assert_eq!(cache.dedup_len(), 1, "second insert must be refused once at capacity");
    }

    #[tokio::test]
    async fn bucket_acquired_loads_due_rows_from_the_store() {
        let store = Arc::new(InMemoryStore::new());
        let job_cache = Arc::new(JobInfoCache::new(store.clone()));
        use crate::persistence::model::{TriggerKind, WorkflowLifecycle};
        let workflow = crate::persistence::model::Workflow {
            id: uuid::Uuid::now_v7(),
            tenant_id: uuid::Uuid::now_v7(),
            trigger_kind: TriggerKind::Cron,
            trigger_value: "* * * * *".into(),
            default_timeout: chrono::Duration::seconds(60),
            retry_budget: 0,
            priority: 0,
            lifecycle: WorkflowLifecycle::Published,
        };
        store.seed_workflow(workflow.clone());
        let seeded = run(0, 7, Utc::now());
        store
            .generate_run(&workflow, Utc::now(), vec![seeded], None)
            .await
            .unwrap();

        let cache = PreloadCache::new(store, job_cache);
        let loaded = cache.on_bucket_acquired(BucketId(7)).await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(cache.queued_len(BucketId(7)), 1);
    }
}
