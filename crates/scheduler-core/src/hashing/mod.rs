//! C2: Bucket Hasher. Two pure functions, no I/O: `bucket_of` shards the
//! job-id space, `ownership_of` assigns buckets to live workers via
//! rendezvous (highest-random-weight) hashing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::persistence::model::{BucketId, JobId, WorkerAddress};

/// Default bucket count (§6 `bucket-count`, default 1024).
pub const DEFAULT_BUCKET_COUNT: u32 = 1024;

/// Stable mapping from a job id to `[0, bucket_count)`.
pub fn bucket_of(job_id: JobId, bucket_count: u32) -> BucketId {
    let mut hasher = DefaultHasher::new();
    job_id.hash(&mut hasher);
    BucketId((hasher.finish() % bucket_count as u64) as u32)
}

fn weight(worker: &str, bucket_id: BucketId) -> u64 {
    let mut hasher = DefaultHasher::new();
    worker.hash(&mut hasher);
    bucket_id.hash(&mut hasher);
    hasher.finish()
}

/// Rendezvous hashing: the worker with the highest `hash(worker || bucket)`
/// wins (§4.1). Total over any non-empty `live_workers`, order-independent,
/// and migrates only `1/N` of buckets when one worker joins or leaves.
pub fn ownership_of(bucket_id: BucketId, live_workers: &[WorkerAddress]) -> Option<WorkerAddress> {
    live_workers
        .iter()
        .max_by_key(|w| weight(w, bucket_id))
        .cloned()
}

/// Recomputes the full owned-bucket set for `self_address` given the live
/// worker set (§4.3 step 1).
pub fn owned_buckets(
    self_address: &str,
    live_workers: &[WorkerAddress],
    bucket_count: u32,
) -> Vec<BucketId> {
    (0..bucket_count)
        .map(BucketId)
        .filter(|b| ownership_of(*b, live_workers).as_deref() == Some(self_address))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn workers(n: usize) -> Vec<WorkerAddress> {
        (0..n).map(|i| format!("worker-{i}")).collect()
    }

    /// Property 1 (§8): for any non-empty worker set, owned sets cover
    /// `[0, B)` exactly and are pairwise disjoint.
    #[test]
    fn bucket_coverage_is_total_and_disjoint() {
        let bucket_count = 256;
        for n in [1, 2, 3, 5, 8] {
            let live = workers(n);
            let mut seen: HashSet<u32> = HashSet::new();
            for b in 0..bucket_count {
                let owner = ownership_of(BucketId(b), &live);
                assert!(owner.is_some(), "ownership must be total");
                assert!(seen.insert(b), "bucket {b} owned more than once");
            }
            assert_eq!(seen.len(), bucket_count as usize);
        }
    }

    /// Property 2 (§8): adding or removing one worker reassigns at most
    /// `ceil(B/N)` buckets.
    #[test]
    fn rebalance_is_minimal_on_membership_change() {
        let bucket_count = 1024u32;
        let before = workers(4);
        let mut after = before.clone();
        after.push("worker-4".to_string());

        let owners_before: HashMap<u32, WorkerAddress> = (0..bucket_count)
            .map(|b| (b, ownership_of(BucketId(b), &before).unwrap()))
            .collect();
        let owners_after: HashMap<u32, WorkerAddress> = (0..bucket_count)
            .map(|b| (b, ownership_of(BucketId(b), &after).unwrap()))
            .collect();

        let moved = owners_before
            .iter()
            .filter(|(b, owner)| owners_after[*b] != **owner)
            .count();

        let bound = (bucket_count as f64 / before.len() as f64).ceil() as usize;
        assert!(
            moved <= bound,
            "moved {moved} buckets, expected at most {bound} when adding one worker"
        );
    }

    #[test]
    fn ownership_is_order_independent() {
        let live = workers(6);
        let mut shuffled = live.clone();
        shuffled.reverse();

        for b in 0..64 {
            assert_eq!(
                ownership_of(BucketId(b), &live),
                ownership_of(BucketId(b), &shuffled)
            );
        }
    }

    #[test]
    fn bucket_of_is_stable_for_the_same_job_id() {
        let job = uuid::Uuid::now_v7();
        assert_eq!(
            bucket_of(job, DEFAULT_BUCKET_COUNT),
            bucket_of(job, DEFAULT_BUCKET_COUNT)
        );
    }

    #[test]
    fn owned_buckets_matches_ownership_of_per_bucket() {
        let live = workers(3);
        let owned = owned_buckets("worker-1", &live, 128);
        for b in &owned {
            assert_eq!(ownership_of(*b, &live).as_deref(), Some("worker-1"));
        }
        let total: usize = live
            .iter()
            .map(|w| owned_buckets(w, &live, 128).len())
            .sum();
        assert_eq!(total, 128);
    }
}
