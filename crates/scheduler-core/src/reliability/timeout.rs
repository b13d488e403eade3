//! Deadline monitor for RUNNING JobRuns (§5 "Timeouts"): each RUNNING
//! JobRun has a deadline of `start_time + timeout`; a per-worker monitor
//! task scans periodically and forces TIMEOUT when the deadline passes,
//! through the same propagator path SUCCESS/FAIL completions use so the
//! §4.8 cascade runs for timeouts too.
//!
//! Narrowed from this crate's `TimeoutManager`, which tracks three timeout
//! kinds (schedule-to-start, start-to-close, heartbeat) for activities that
//! sit in an external queue before being claimed. A JobRun has no
//! schedule-to-start or heartbeat concept in this spec — only the
//! start-to-close deadline applies, so this monitor checks exactly that.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::persistence::model::{JobRun, RunStatus};
use crate::persistence::StoreError;
use crate::propagator::{CascadePolicy, PropagationError, Propagator, RunEnqueuer};

#[derive(Debug, thiserror::Error)]
pub enum TimeoutMonitorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("propagation error: {0}")]
    Propagation(#[from] PropagationError),
}

/// How often the monitor scans for expired deadlines.
pub const DEFAULT_SCAN_INTERVAL: StdDuration = StdDuration::from_secs(5);

pub struct TimeoutMonitor {
    propagator: Arc<Propagator>,
    enqueuer: Arc<dyn RunEnqueuer>,
    cascade: CascadePolicy,
    scan_interval: StdDuration,
}

impl TimeoutMonitor {
    pub fn new(propagator: Arc<Propagator>, enqueuer: Arc<dyn RunEnqueuer>) -> Self {
        Self {
            propagator,
            enqueuer,
            cascade: CascadePolicy::default(),
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }

    pub fn with_scan_interval(mut self, interval: StdDuration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_cascade_policy(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    /// A JobRun's deadline has passed if `start_time + timeout < now`.
    /// `timeout` comes from the owning `JobDefinition` (resolved by the
    /// caller, since the monitor itself only sees run rows).
    pub fn has_expired(run: &JobRun, timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        match run.start_time {
            Some(started) => now > started + timeout,
            None => false,
        }
    }

    /// Forces a single JobRun to TIMEOUT through the same propagator path
    /// every other completion uses (§4.8 step 1): losing the CAS means the
    /// run already completed through another path, which is not an error.
    /// Going through the propagator (rather than calling
    /// `store.finish_job_run` directly) means a forced TIMEOUT is retried
    /// or cascaded to dependents exactly like a FAIL would be.
    pub async fn force_timeout(&self, run: &JobRun) -> Result<bool, TimeoutMonitorError> {
        let forced = self
            .propagator
            .on_completed(
                run.id,
                RunStatus::Timeout,
                Some("deadline exceeded".into()),
                self.cascade,
                self.enqueuer.as_ref(),
            )
            .await?;
        if forced {
            warn!(job_run_id = %run.id, "job run forced to TIMEOUT");
        }
        Ok(forced)
    }

    /// Runs forever, forcing every RUNNING JobRun whose deadline has
    /// passed. `resolve_timeout` looks up the owning JobDefinition's
    /// timeout (or the workflow's default) for a given run; it is supplied
    /// by the caller rather than baked in here because the monitor has no
    /// direct dependency on C5.
    pub async fn run(
        &self,
        resolve_timeout: impl Fn(&JobRun) -> chrono::Duration + Send + Sync,
        on_timed_out: impl Fn(&JobRun) + Send + Sync,
        candidates: impl Fn() -> Vec<JobRun> + Send + Sync,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.scan_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    for run in candidates() {
                        let timeout = resolve_timeout(&run);
                        if Self::has_expired(&run, timeout, now) {
                            match self.force_timeout(&run).await {
                                Ok(true) => on_timed_out(&run),
                                Ok(false) => {}
                                Err(e) => warn!(job_run_id = %run.id, error = %e, "timeout enforcement failed"),
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("timeout monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}
