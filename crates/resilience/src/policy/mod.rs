//! Retry policies for the platform's dependency classes.
//!
//! One [`RetryPolicy`] per dependency class, supplied by the configuration
//! layer (the presets here are the shipped defaults) and passed into
//! [`RetryExecutor::execute`](crate::executor::RetryExecutor::execute).
//! Policies are plain immutable data: cloning is cheap and nothing in the
//! executor mutates them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limiter::RateLimit;

/// Invalid policy configuration.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("backoff_multiplier must be at least 1.0, got {0}")]
    MultiplierTooSmall(f64),

    #[error("jitter_factor must be within [0.0, 1.0], got {0}")]
    JitterOutOfRange(f64),

    #[error("initial_delay {initial:?} exceeds max_delay {max:?}")]
    DelayInverted { initial: Duration, max: Duration },

    #[error("circuit_breaker_threshold must be at least 1")]
    ZeroThreshold,

    #[error("rate limit requests_per_minute must be at least 1")]
    ZeroRateLimit,
}

/// Retry, timeout, and circuit breaker settings for one dependency class.
///
/// Durations (de)serialize as integer milliseconds so the configuration
/// collaborator can express policies in JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,

    /// Delay before the first retry, pre-jitter.
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Ceiling on the pre-jitter backoff delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Multiplicative growth per attempt.
    pub backoff_multiplier: f64,

    /// Jitter amplitude as a fraction of the base delay (e.g. 0.3 = ±30%).
    pub jitter_factor: f64,

    /// Consecutive failures before the circuit opens.
    pub circuit_breaker_threshold: u32,

    /// Cooldown before an open circuit admits a probe.
    #[serde(with = "duration_millis")]
    pub circuit_breaker_timeout: Duration,

    /// Deadline for a single attempt.
    #[serde(with = "duration_millis")]
    pub operation_timeout: Duration,

    /// Optional request budget for this dependency class.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(10),
            rate_limit: None,
        }
    }
}

impl RetryPolicy {
    /// External embedding API: stable, fast, cheap to retry.
    pub fn embedding_api() -> Self {
        Self::default()
    }

    /// External generative API: slower and less stable, so a longer cooldown
    /// and a lower trip threshold.
    pub fn generative_api() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(16),
            circuit_breaker_threshold: 3,
            circuit_breaker_timeout: Duration::from_secs(120),
            operation_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Primary datastore: contention clears quickly, so more attempts with
    /// shorter delays, and a higher threshold before failing fast.
    pub fn datastore() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            circuit_breaker_threshold: 10,
            circuit_breaker_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Validate the policy values.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if self.backoff_multiplier < 1.0 {
            return Err(PolicyError::MultiplierTooSmall(self.backoff_multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(PolicyError::JitterOutOfRange(self.jitter_factor));
        }
        if self.initial_delay > self.max_delay {
            return Err(PolicyError::DelayInverted {
                initial: self.initial_delay,
                max: self.max_delay,
            });
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(PolicyError::ZeroThreshold);
        }
        if let Some(limit) = &self.rate_limit {
            if limit.requests_per_minute == 0 {
                return Err(PolicyError::ZeroRateLimit);
            }
        }
        Ok(())
    }
}

pub(crate) mod duration_millis {
    //! Serde adapter: `Duration` as integer milliseconds.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_api_preset() {
        let policy = RetryPolicy::embedding_api();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(8));
        assert_eq!(policy.circuit_breaker_threshold, 5);
        assert_eq!(policy.circuit_breaker_timeout, Duration::from_secs(30));
        policy.validate().unwrap();
    }

    #[test]
    fn test_generative_api_preset() {
        let policy = RetryPolicy::generative_api();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(16));
        assert_eq!(policy.circuit_breaker_threshold, 3);
        assert_eq!(policy.circuit_breaker_timeout, Duration::from_secs(120));
        policy.validate().unwrap();
    }

    #[test]
    fn test_datastore_preset() {
        let policy = RetryPolicy::datastore();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(4));
        assert_eq!(policy.circuit_breaker_threshold, 10);
        assert_eq!(policy.circuit_breaker_timeout, Duration::from_secs(10));
        policy.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(matches!(policy.validate(), Err(PolicyError::ZeroAttempts)));
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let policy = RetryPolicy {
            backoff_multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::MultiplierTooSmall(_))
        ));
    }

    #[test]
    fn test_validate_rejects_jitter_out_of_range() {
        let policy = RetryPolicy {
            jitter_factor: 1.5,
            ..RetryPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::JitterOutOfRange(_))
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::DelayInverted { .. })
        ));
    }

    #[test]
    fn test_policy_from_configuration_json() {
        // The shape the configuration collaborator supplies.
        let raw = r#"{
            "max_attempts": 4,
            "initial_delay": 250,
            "max_delay": 4000,
            "backoff_multiplier": 2.0,
            "jitter_factor": 0.2,
            "circuit_breaker_threshold": 8,
            "circuit_breaker_timeout": 15000,
            "operation_timeout": 3000,
            "rate_limit": { "requests_per_minute": 120, "burst_capacity": 5.0 }
        }"#;

        let policy: RetryPolicy = serde_json::from_str(raw).unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.circuit_breaker_timeout, Duration::from_secs(15));
        let limit = policy.rate_limit.unwrap();
        assert_eq!(limit.requests_per_minute, 120);
        policy.validate().unwrap();
    }

    #[test]
    fn test_policy_serde_round_trip() {
        let policy = RetryPolicy::generative_api();
        let json = serde_json::to_string(&policy).unwrap();
        let back: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
