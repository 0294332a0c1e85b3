//! Retry orchestration around unreliable dependency calls.
//!
//! [`RetryExecutor`] ties the pieces together: the circuit breaker decides
//! whether a call may run at all, each attempt runs under the policy's
//! per-attempt timeout, failures are classified, transient ones are retried
//! after a jittered backoff, and every outcome feeds the metrics registry.
//!
//! The executor is an explicit object. Construct one per process (or per
//! test) and share it behind an `Arc`; there is no global instance.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::backoff::BackoffCalculator;
use crate::breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::errors::{DependencyError, ErrorCategory};
use crate::limiter::RateLimiter;
use crate::metrics::MetricsRegistry;
use crate::policy::RetryPolicy;

/// Terminal failure of an [`execute`](RetryExecutor::execute) call.
///
/// The three variants are deliberately distinct so callers can choose
/// user-facing behavior: degraded mode for an open circuit, an input error
/// for an abort, an availability error for exhaustion.
#[derive(Error, Debug)]
pub enum RetryFailure {
    /// The circuit for this operation is open; the call never ran.
    /// Synthetic: produced by the executor, never by the wrapped operation.
    #[error("Circuit open for '{operation}', failing fast")]
    CircuitOpen { operation: String },

    /// The first failure was non-retryable; the call ran once and was
    /// aborted, not retried.
    #[error("Aborted, not retried: {source}")]
    Aborted {
        #[source]
        source: DependencyError,
    },

    /// Every attempt failed with a transient error.
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: DependencyError,
    },
}

/// One retry decision, recorded before the backoff sleep.
#[derive(Clone, Debug)]
pub struct RetryEvent {
    /// The failed attempt (1-based) that triggered this retry.
    pub attempt: u32,
    /// Backoff delay slept before the next attempt.
    pub delay: Duration,
    /// Classification of the failure.
    pub category: ErrorCategory,
    /// Display text of the failure, for diagnostics.
    pub error: String,
}

/// Outcome of one `execute` call. Immutable after return.
///
/// Retries are never hidden: `attempts` and `retry_history` are always
/// populated, so a caller can report "succeeded after 2 retries" rather than
/// a flat boolean.
#[derive(Debug)]
pub struct RetryResult<T> {
    pub outcome: Result<T, RetryFailure>,
    /// Times the operation actually ran (0 when the circuit was open).
    pub attempts: u32,
    /// Wall time across all attempts and backoff sleeps.
    pub total_time: Duration,
    pub retry_history: Vec<RetryEvent>,
    /// True only for the circuit-open fail-fast path.
    pub circuit_breaker_triggered: bool,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The value, discarding retry diagnostics.
    pub fn into_value(self) -> Result<T, RetryFailure> {
        self.outcome
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }
}

/// Executes operations against unreliable dependencies with retry, timeout,
/// rate limiting, and circuit breaking.
pub struct RetryExecutor {
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    backoff: BackoffCalculator,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an executor whose breaker, limiter, and metrics all read the
    /// given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            breaker: CircuitBreaker::with_clock(clock.clone()),
            limiter: RateLimiter::with_clock(clock.clone()),
            backoff: BackoffCalculator::new(),
            metrics: Arc::new(MetricsRegistry::with_clock(clock.clone())),
            clock,
        }
    }

    /// Full custom wiring, for tests and bespoke setups.
    pub fn with_components(
        breaker: CircuitBreaker,
        limiter: RateLimiter,
        backoff: BackoffCalculator,
        metrics: Arc<MetricsRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breaker,
            limiter,
            backoff,
            metrics,
            clock,
        }
    }

    /// Run `operation` under `policy`, keyed by `operation_name`.
    ///
    /// The operation must be idempotent or otherwise safe to re-run; the
    /// executor cannot undo side effects of a failed attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        mut operation: F,
        policy: &RetryPolicy,
        operation_name: &str,
    ) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        let started = self.clock.now();

        if !self.breaker.can_attempt(operation_name) {
            debug!(
                "Circuit open for '{}', rejecting without invoking",
                operation_name
            );
            self.metrics.record_circuit_rejection(operation_name);
            return RetryResult {
                outcome: Err(RetryFailure::CircuitOpen {
                    operation: operation_name.to_string(),
                }),
                attempts: 0,
                total_time: self.clock.now().saturating_duration_since(started),
                retry_history: Vec::new(),
                circuit_breaker_triggered: true,
            };
        }

        let mut retry_history = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            if let Some(limit) = &policy.rate_limit {
                self.limiter.acquire(operation_name, limit).await;
            }

            let attempt_started = self.clock.now();
            let result = match tokio::time::timeout(policy.operation_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(DependencyError::Timeout),
            };

            match result {
                Ok(value) => {
                    let change = self.breaker.record_success(operation_name);
                    if change.recovered() {
                        info!("'{}' recovered, circuit closed", operation_name);
                        self.metrics.record_recovery(operation_name);
                    }
                    let latency = self.clock.now().saturating_duration_since(attempt_started);
                    self.metrics
                        .record_success(operation_name, attempt + 1, latency);
                    return RetryResult {
                        outcome: Ok(value),
                        attempts: attempt + 1,
                        total_time: self.clock.now().saturating_duration_since(started),
                        retry_history,
                        circuit_breaker_triggered: false,
                    };
                }
                Err(error) => {
                    let category = error.category();
                    let change = self.breaker.record_failure(operation_name, policy);
                    if change.tripped() {
                        warn!(
                            "Circuit opened for '{}' after repeated failures",
                            operation_name
                        );
                        self.metrics.record_trip(operation_name);
                    }

                    match category {
                        ErrorCategory::Permanent => {
                            info!(
                                "Aborting '{}' on attempt {}: {} (not retryable)",
                                operation_name,
                                attempt + 1,
                                error
                            );
                            self.metrics.record_aborted(operation_name, attempt + 1);
                            return RetryResult {
                                outcome: Err(RetryFailure::Aborted { source: error }),
                                attempts: attempt + 1,
                                total_time: self.clock.now().saturating_duration_since(started),
                                retry_history,
                                circuit_breaker_triggered: false,
                            };
                        }
                        ErrorCategory::Transient => {
                            if attempt + 1 >= policy.max_attempts {
                                warn!(
                                    "Retries exhausted for '{}' after {} attempts: {}",
                                    operation_name,
                                    attempt + 1,
                                    error
                                );
                                self.metrics.record_exhausted(operation_name, attempt + 1);
                                return RetryResult {
                                    outcome: Err(RetryFailure::Exhausted {
                                        attempts: attempt + 1,
                                        source: error,
                                    }),
                                    attempts: attempt + 1,
                                    total_time: self
                                        .clock
                                        .now()
                                        .saturating_duration_since(started),
                                    retry_history,
                                    circuit_breaker_triggered: false,
                                };
                            }

                            let delay = self.backoff.compute_delay_with_hint(
                                attempt,
                                policy,
                                error.retry_after(),
                            );
                            debug!(
                                "Attempt {} for '{}' failed ({}), retrying in {:?}",
                                attempt + 1,
                                operation_name,
                                error,
                                delay
                            );
                            retry_history.push(RetryEvent {
                                attempt: attempt + 1,
                                delay,
                                category,
                                error: error.to_string(),
                            });
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }

    /// Current circuit state for an operation.
    pub fn circuit_state(&self, operation: &str) -> CircuitState {
        self.breaker.state(operation)
    }

    /// Circuit snapshot for an operation, if the key has been seen.
    pub fn circuit_snapshot(&self, operation: &str) -> Option<CircuitSnapshot> {
        self.breaker.snapshot(operation)
    }

    /// Administrative override: clear an operation's circuit to Closed.
    pub fn reset_circuit(&self, operation: &str) {
        self.breaker.reset(operation);
    }

    /// Read-only metrics handle for the observability layer.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}
