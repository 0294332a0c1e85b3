//! Exponential backoff with jitter.
//!
//! Delay for attempt `n` grows as `initial_delay * multiplier^n`, capped at
//! `max_delay`, then perturbed by `±jitter_factor`. Jitter exists to
//! desynchronize concurrent callers retrying the same dependency, so a burst
//! of simultaneous failures does not come back as a synchronized retry storm.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::policy::RetryPolicy;

/// Source of jitter samples.
///
/// Injected so tests can pin the perturbation; implementations must be safe
/// to call from concurrent tasks.
pub trait JitterSource: Send + Sync {
    /// Uniform sample in `[-1.0, 1.0]`.
    fn sample(&self) -> f64;
}

/// Default jitter source backed by the thread-local RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    }
}

/// Fixed jitter sample for deterministic tests.
#[derive(Clone, Copy, Debug)]
pub struct FixedJitter(f64);

impl FixedJitter {
    /// Clamps the sample into `[-1.0, 1.0]`.
    pub fn new(sample: f64) -> Self {
        Self(sample.clamp(-1.0, 1.0))
    }
}

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// Computes retry delays from the attempt number and policy.
#[derive(Clone)]
pub struct BackoffCalculator {
    jitter: Arc<dyn JitterSource>,
}

impl BackoffCalculator {
    pub fn new() -> Self {
        Self::with_jitter_source(Arc::new(ThreadRngJitter))
    }

    /// Create a calculator drawing jitter from the given source.
    pub fn with_jitter_source(jitter: Arc<dyn JitterSource>) -> Self {
        Self { jitter }
    }

    /// Delay before retrying after a failure on `attempt` (0-based).
    ///
    /// `base = min(initial_delay * multiplier^attempt, max_delay)`, then
    /// `base ± base * jitter_factor`, clamped to
    /// `[0, max_delay * (1 + jitter_factor)]`.
    pub fn compute_delay(&self, attempt: u32, policy: &RetryPolicy) -> Duration {
        let base = (policy.initial_delay.as_secs_f64()
            * policy.backoff_multiplier.powi(attempt as i32))
        .min(policy.max_delay.as_secs_f64());

        let jitter = base * policy.jitter_factor * self.jitter.sample();
        let ceiling = policy.max_delay.as_secs_f64() * (1.0 + policy.jitter_factor);
        let delay = (base + jitter).clamp(0.0, ceiling);

        Duration::from_secs_f64(delay)
    }

    /// Like [`compute_delay`](Self::compute_delay), but an explicit
    /// retry-after hint from the failed call wins over the computed delay.
    /// The hint is still clamped to `max_delay`.
    pub fn compute_delay_with_hint(
        &self,
        attempt: u32,
        policy: &RetryPolicy,
        retry_after: Option<Duration>,
    ) -> Duration {
        match retry_after {
            Some(hint) => hint.min(policy.max_delay),
            None => self.compute_delay(attempt, policy),
        }
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new()
    }
}
