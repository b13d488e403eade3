//! C1: the durable store adapter. `SchedulerStore` is the contract every
//! other component depends on; `memory` and `postgres` are its two
//! implementations, mirroring this workspace's established split between an
//! in-memory test double and a real Postgres-backed store.

pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use model::*;
pub use store::{GeneratedRun, SchedulerStore, StoreError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row shape returned by `SchedulerStore::list_alive_workers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRow {
    pub address: String,
    pub last_heartbeat: DateTime<Utc>,
    pub max_concurrency: u32,
    pub running: u32,
}
