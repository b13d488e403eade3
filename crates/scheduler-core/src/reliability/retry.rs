//! Retry policy for JobRun failures (§4.8 retry transition), adapted from
//! this crate's `RetryPolicy` almost verbatim: exponential backoff with
//! jitter, capped at a maximum interval.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    /// Fraction of the computed delay to randomize by, e.g. 0.1 = +/-10%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// §6 `default-retry-interval`: used as `initial_interval` when a
    /// `JobDefinition` omits its own `retry_interval`.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(600),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            initial_interval: Duration::from_secs(0),
            max_interval: Duration::from_secs(0),
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Computed delay before the given retry attempt (1-indexed), capped at
    /// `max_interval` and perturbed by `jitter`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.backoff_coefficient.powi(attempt as i32 - 1);
        let base = self.initial_interval.as_secs_f64() * exp;
        let base = base.min(self.max_interval.as_secs_f64());

        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let spread = base * self.jitter;
        let delta = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base + delta).max(0.0))
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_up_to_the_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(120));
        // 30 * 2^9 = 15360, capped at 600
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(600));
    }

    #[test]
    fn no_retry_policy_has_zero_attempts_remaining() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.has_attempts_remaining(0));
    }

    #[test]
    fn fixed_policy_does_not_grow() {
        let policy = RetryPolicy::fixed(Duration::from_secs(30), 5);
        assert_eq!(policy.delay_for_attempt(1), policy.delay_for_attempt(4));
    }

    #[test]
    fn jitter_stays_within_configured_spread() {
        let policy = RetryPolicy {
            jitter: 0.1,
            ..RetryPolicy::exponential()
        };
        let base = Duration::from_secs(30).as_secs_f64();
        for _ in 0..50 {
            let d = policy.delay_for_attempt(1).as_secs_f64();
            assert!(d >= base * 0.9 - 0.001 && d <= base * 1.1 + 0.001);
        }
    }
}
