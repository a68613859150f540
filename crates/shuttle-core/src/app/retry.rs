//! Retry policy: decides whether a failed job runs again and after what delay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for failed jobs.
///
/// The default allows a single attempt: a failed job is rejected without
/// requeue and never retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "secs")]
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `attempts` tries, starting at `base_delay`.
    pub fn exponential(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
        }
    }

    /// `attempt` is the 1-based attempt that just failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the retry that follows failed `attempt`.
    ///
    /// `base_delay * multiplier^(attempt - 1)`, rounded up to whole seconds
    /// because brokers schedule delays in seconds.
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - attempt 1: 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs <= 0.0 {
            return self.base_delay;
        }
        Duration::from_secs(secs.min(u64::MAX as f64).ceil() as u64)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_never_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn retries_until_max_attempts() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1), 2.0);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[rstest]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    fn exponential_backoff_increases(#[case] attempt: u32, #[case] secs: u64) {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(2), 2.0);
        assert_eq!(policy.next_delay(attempt), Duration::from_secs(secs));
    }

    #[test]
    fn fractional_delay_rounds_up() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1500), 1.0);
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
    }

    #[test]
    fn deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 4}"#).unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
    }
}
