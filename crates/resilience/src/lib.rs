//! Atlas Resilience Crate
//!
//! This crate is the resilience layer for the Atlas platform: every call to
//! an unreliable dependency (external embedding/LLM APIs, the primary
//! datastore) is wrapped in a [`RetryExecutor`] that combines error
//! classification, exponential backoff with jitter, per-dependency rate
//! limiting, and a per-operation circuit breaker.
//!
//! # Overview
//!
//! The crate supports:
//! - Transient/permanent failure classification with a safe-default bias
//! - Exponential backoff with jitter and server retry-after hints
//! - Per-operation circuit breaking with single-probe recovery
//! - Per-operation token bucket rate limiting
//! - Read-only metrics snapshots for dashboards
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +------------------+
//! |      Caller      | --> |   RetryPolicy    |  (per dependency class)
//! +------------------+     +------------------+
//!          |
//!          v
//! +------------------+     +------------------+
//! |  RetryExecutor   | --> |  CircuitBreaker  |  (may we call at all?)
//! +------------------+     +------------------+
//!          |                        |
//!          |                        v
//!          |               +------------------+
//!          |               |   RateLimiter    |  (token budget)
//!          |               +------------------+
//!          v
//! +------------------+     +------------------+
//! | ErrorCategory /  | --> |BackoffCalculator |  (how long to wait)
//! | DependencyError  |     +------------------+
//! +------------------+
//!          |
//!          v
//! +------------------+
//! | MetricsRegistry  |  (read-only snapshots)
//! +------------------+
//! ```
//!
//! # Core Types
//!
//! - [`RetryExecutor`] - wraps an unreliable async operation
//! - [`RetryPolicy`] - retry/timeout/breaker settings per dependency class
//! - [`RetryResult`] - outcome plus attempts, timing, and retry history
//! - [`DependencyError`] - the failure taxonomy for wrapped calls
//! - [`CircuitState`] - Closed / Open / HalfOpen
//! - [`OperationMetrics`] - per-operation observability snapshot
//!
//! The executor is an explicit object, never a global: construct one per
//! process and hand it to callers, or one per test for isolation. Time and
//! randomness are injectable ([`Clock`], [`JitterSource`]) so tests simulate
//! cooldowns and pin jitter without sleeping.

pub mod backoff;
pub mod breaker;
pub mod clock;
pub mod errors;
pub mod executor;
pub mod limiter;
pub mod metrics;
pub mod policy;

// Re-export the public surface at the crate root
pub use backoff::{BackoffCalculator, FixedJitter, JitterSource, ThreadRngJitter};
pub use breaker::{CircuitBreaker, CircuitSnapshot, CircuitState, StateChange};
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{classify_message, classify_status, DependencyError, ErrorCategory};
pub use executor::{RetryEvent, RetryExecutor, RetryFailure, RetryResult};
pub use limiter::{RateLimit, RateLimiter};
pub use metrics::{AttemptBucket, MetricsRegistry, OperationMetrics};
pub use policy::{PolicyError, RetryPolicy};
