//! C4: Bucket Manager. Per-worker: owns a subset of buckets, emits
//! `acquired`/`lost` events sequentially per bucket, and damps flapping by
//! evaluating rebalance at most once every `rebalance-check-interval`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::hashing::owned_buckets;
use crate::persistence::model::{BucketId, WorkerAddress};

/// §6 `rebalance-check-interval` (default 30s).
#[derive(Debug, Clone, Copy)]
pub struct BucketManagerConfig {
    pub rebalance_check_interval: StdDuration,
    pub bucket_count: u32,
}

impl Default for BucketManagerConfig {
    fn default() -> Self {
        Self {
            rebalance_check_interval: StdDuration::from_secs(30),
            bucket_count: crate::hashing::DEFAULT_BUCKET_COUNT,
        }
    }
}

/// Emitted when ownership of a bucket changes (§4.3 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketEvent {
    Acquired(BucketId),
    Lost(BucketId),
}

/// Maintains the local owned-bucket set and emits `BucketEvent`s to `events`
/// as membership changes arrive over `alive_rx`. The owned set lives behind
/// a shared handle so the dispatch loop (C7) can read a snapshot of it
/// without taking ownership of the manager's run loop itself.
pub struct BucketManager {
    self_address: WorkerAddress,
    config: BucketManagerConfig,
    owned: Arc<RwLock<HashSet<BucketId>>>,
}

impl BucketManager {
    pub fn new(self_address: WorkerAddress, config: BucketManagerConfig) -> Self {
        Self {
            self_address,
            config,
            owned: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn owned_buckets(&self) -> Vec<BucketId> {
        self.owned.read().iter().copied().collect()
    }

    /// A cloneable handle onto the live owned-bucket set, for readers that
    /// outlive a single `&BucketManager` borrow (e.g. the dispatch loop,
    /// which runs on its own tick cadence).
    pub fn owned_handle(&self) -> Arc<RwLock<HashSet<BucketId>>> {
        self.owned.clone()
    }

    /// Recompute owned set against the live worker set and emit the diff
    /// (§4.3 steps 1-3). If `self_address` is transiently absent from
    /// `live_workers`, ownership recomputes to nothing owned for it and the
    /// caller would see every bucket emitted as `Lost` — callers that want
    /// the "continue serving until explicitly lost" behavior described in
    /// §4.3 should only call `reconcile` with a `live_workers` set that
    /// still includes themselves; the registry/heartbeat loop guarantees a
    /// worker always heartbeats itself before computing membership, so
    /// self-absence only happens under genuine network partition, at which
    /// point losing owned buckets is the correct, conservative outcome.
    pub fn reconcile(&self, live_workers: &[WorkerAddress], events: &mpsc::Sender<BucketEvent>) {
        let new_owned: HashSet<BucketId> = owned_buckets(&self.self_address, live_workers, self.config.bucket_count)
            .into_iter()
            .collect();

        let mut owned = self.owned.write();
        let acquired: Vec<BucketId> = new_owned.difference(&owned).copied().collect();
        let lost: Vec<BucketId> = owned.difference(&new_owned).copied().collect();

        for b in &lost {
            let _ = events.try_send(BucketEvent::Lost(*b));
        }
        for b in &acquired {
            let _ = events.try_send(BucketEvent::Acquired(*b));
        }

        if !acquired.is_empty() || !lost.is_empty() {
            info!(
                acquired = acquired.len(),
                lost = lost.len(),
                total_owned = new_owned.len(),
                "bucket ownership rebalanced"
            );
        }

        *owned = new_owned;
    }

    /// Runs forever, reconciling at most once per `rebalance_check_interval`
    /// whenever `alive_rx` reports a membership change (§4.3 "damp
    /// flapping").
    pub async fn run(
        &self,
        mut alive_rx: watch::Receiver<Vec<WorkerAddress>>,
        events: mpsc::Sender<BucketEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut debounce = tokio::time::interval(self.config.rebalance_check_interval);
        let mut dirty = true;
        loop {
            tokio::select! {
                changed = alive_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    dirty = true;
                }
                _ = debounce.tick() => {
                    if dirty {
                        let live = alive_rx.borrow().clone();
                        self.reconcile(&live, &events);
                        dirty = false;
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
