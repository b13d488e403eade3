//! `SchedulerConfig`: the §6 configuration table as a plain struct with a
//! `from_env()` constructor, mirroring `DurableWorkerConfig::from_env()`'s
//! established shape (env vars read once at process start, everything else
//! a typed default).

use std::time::Duration;

/// §6 configuration keys, one field each, `SCHED_`-prefixed environment
/// variables. Anything not set falls back to the spec's stated default.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// `bucket-count` (default 1024).
    pub bucket_count: u32,
    /// `preload-batch-size` (default 1000).
    pub preload_batch_size: usize,
    /// `preload-max-cached-ids` (default 50 000).
    pub preload_max_cached_ids: usize,
    /// `heartbeat-interval` (default 10s).
    pub heartbeat_interval: Duration,
    /// `liveness-window-multiplier` (default 3).
    pub liveness_window_multiplier: u32,
    /// `rebalance-check-interval` (default 30s).
    pub rebalance_check_interval: Duration,
    /// `dispatch-tick-interval` (default 1s).
    pub dispatch_tick_interval: Duration,
    /// `default-retry-interval` (seconds), used when a `JobDefinition` omits
    /// its own `retry_interval`.
    pub default_retry_interval: Duration,
    /// This process's advertised worker address, used as the rendezvous-hash
    /// key and the `worker_id` stamped onto claimed `JobRun`s.
    pub worker_address: String,
    /// §5 "bounded pool of concurrent execution tasks".
    pub max_concurrency: usize,
    /// Postgres connection string for `PostgresStore`.
    pub database_url: String,
}

impl SchedulerConfig {
    /// Reads every key from the environment, falling back to the spec's
    /// stated defaults. Does not call `dotenvy::dotenv()` itself; the binary
    /// entry point does that once before constructing this, exactly as
    /// `crates/worker/src/main.rs` loads `.env` before reading its own
    /// config struct.
    pub fn from_env() -> Self {
        Self {
            bucket_count: env_u32("SCHED_BUCKET_COUNT", crate::hashing::DEFAULT_BUCKET_COUNT),
            preload_batch_size: env_usize("SCHED_PRELOAD_BATCH_SIZE", crate::preload::DEFAULT_BATCH_SIZE),
            preload_max_cached_ids: env_usize(
                "SCHED_PRELOAD_MAX_CACHED_IDS",
                crate::preload::DEFAULT_MAX_CACHED_IDS,
            ),
            heartbeat_interval: env_duration_secs("SCHED_HEARTBEAT_INTERVAL_SECS", 10),
            liveness_window_multiplier: env_u32("SCHED_LIVENESS_WINDOW_MULTIPLIER", 3),
            rebalance_check_interval: env_duration_secs("SCHED_REBALANCE_CHECK_INTERVAL_SECS", 30),
            dispatch_tick_interval: env_duration_secs("SCHED_DISPATCH_TICK_INTERVAL_SECS", 1),
            default_retry_interval: env_duration_secs("SCHED_DEFAULT_RETRY_INTERVAL_SECS", 30),
            worker_address: std::env::var("SCHED_WORKER_ADDRESS")
                .unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::now_v7())),
            max_concurrency: env_usize("SCHED_MAX_CONCURRENCY", 10),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/scheduler".to_string()),
        }
    }

    pub fn registry_config(&self) -> crate::registry::RegistryConfig {
        crate::registry::RegistryConfig {
            heartbeat_interval: self.heartbeat_interval,
            liveness_window_multiplier: self.liveness_window_multiplier,
        }
    }

    pub fn bucket_manager_config(&self) -> crate::bucket::BucketManagerConfig {
        crate::bucket::BucketManagerConfig {
            rebalance_check_interval: self.rebalance_check_interval,
            bucket_count: self.bucket_count,
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_secs),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_spec_table() {
        // Clear any ambient env vars so this test is order-independent.
        for key in [
            "SCHED_BUCKET_COUNT",
            "SCHED_PRELOAD_BATCH_SIZE",
            "SCHED_PRELOAD_MAX_CACHED_IDS",
            "SCHED_HEARTBEAT_INTERVAL_SECS",
            "SCHED_LIVENESS_WINDOW_MULTIPLIER",
            "SCHED_REBALANCE_CHECK_INTERVAL_SECS",
            "SCHED_DISPATCH_TICK_INTERVAL_SECS",
            "SCHED_DEFAULT_RETRY_INTERVAL_SECS",
        ] {
            std::env::remove_var(key);
        }

        let config = SchedulerConfig::from_env();
        assert_eq!(config.bucket_count, 1024);
        assert_eq!(config.preload_batch_size, 1000);
        assert_eq!(config.preload_max_cached_ids, 50_000);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.liveness_window_multiplier, 3);
        assert_eq!(config.rebalance_check_interval, Duration::from_secs(30));
        assert_eq!(config.dispatch_tick_interval, Duration::from_secs(1));
        assert_eq!(config.default_retry_interval, Duration::from_secs(30));
    }
}
