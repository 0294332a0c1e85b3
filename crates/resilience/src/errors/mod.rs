//! Error types and failure classification for wrapped dependency calls.
//!
//! This module provides:
//! - [`DependencyError`]: the failure taxonomy for all wrapped operations
//! - [`ErrorCategory`]: the transient/permanent classification
//! - [`classify_status`] / [`classify_message`]: helpers for adapting raw
//!   client failures into the taxonomy

mod category;

pub use category::ErrorCategory;

use std::time::Duration;

use thiserror::Error;

/// Failure of a wrapped dependency call.
///
/// Each variant is classified into an [`ErrorCategory`] via the
/// [`category`](Self::category) method, which decides whether the executor
/// retries, aborts, and how the circuit breaker is fed.
#[derive(Error, Debug)]
pub enum DependencyError {
    /// The dependency rate limited the request (HTTP 429 or equivalent).
    /// May carry an explicit retry-after hint from the server.
    #[error("Rate limited by dependency")]
    RateLimited {
        /// Server-provided wait hint, if any.
        retry_after: Option<Duration>,
    },

    /// A single attempt exceeded its deadline. Also produced by the executor
    /// itself when `operation_timeout` elapses.
    #[error("Operation timed out")]
    Timeout,

    /// The dependency answered with a service-side error (502/503/504).
    #[error("Dependency unavailable (status {status})")]
    ServiceUnavailable {
        /// The HTTP status returned.
        status: u16,
    },

    /// The connection failed or was reset before a response arrived.
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Recoverable datastore contention (deadlock, lock wait timeout).
    #[error("Datastore contention: {message}")]
    LockContention { message: String },

    /// Authentication or authorization failure (401/403).
    /// Retrying with the same credentials will not help.
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// The request itself was rejected as invalid (400/404 and other
    /// client errors, excluding 429).
    #[error("Invalid request (status {status}): {message}")]
    InvalidRequest { status: u16, message: String },

    /// Input validation failed before or at the dependency.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// A database integrity constraint was violated.
    #[error("Integrity violation: {constraint}")]
    ConstraintViolation { constraint: String },

    /// Anything the adapters could not place. Classified by message content,
    /// defaulting to transient.
    #[error("Dependency error: {message}")]
    Other { message: String },
}

impl DependencyError {
    /// Returns the retry classification for this error.
    ///
    /// Pure and deterministic. Unknown errors classify as
    /// [`ErrorCategory::Transient`]: an extra retry is preferred over
    /// silently dropping a recoverable failure.
    ///
    /// # Examples
    ///
    /// ```
    /// use atlas_resilience::errors::{DependencyError, ErrorCategory};
    ///
    /// let error = DependencyError::RateLimited { retry_after: None };
    /// assert_eq!(error.category(), ErrorCategory::Transient);
    ///
    /// let error = DependencyError::Unauthorized { message: "bad token".into() };
    /// assert_eq!(error.category(), ErrorCategory::Permanent);
    /// ```
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RateLimited { .. }
            | Self::Timeout
            | Self::ServiceUnavailable { .. }
            | Self::ConnectionFailed { .. }
            | Self::LockContention { .. } => ErrorCategory::Transient,

            Self::Unauthorized { .. }
            | Self::InvalidRequest { .. }
            | Self::Validation { .. }
            | Self::ConstraintViolation { .. } => ErrorCategory::Permanent,

            Self::Other { message } => classify_message(message),
        }
    }

    /// Explicit server wait hint, if this failure carries one.
    ///
    /// The backoff calculator prefers the hint over the computed delay,
    /// clamped to the policy's `max_delay`.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Build an error from an HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            429 => Self::RateLimited { retry_after: None },
            401 | 403 => Self::Unauthorized {
                message: message.into(),
            },
            500..=599 => Self::ServiceUnavailable { status },
            400..=499 => Self::InvalidRequest {
                status,
                message: message.into(),
            },
            _ => Self::Other {
                message: message.into(),
            },
        }
    }
}

impl From<reqwest::Error> for DependencyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        if err.is_connect() {
            return Self::ConnectionFailed {
                message: err.to_string(),
            };
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        Self::Other {
            message: err.to_string(),
        }
    }
}

/// Classify a bare HTTP status code.
///
/// Unknown codes classify as transient.
pub fn classify_status(status: u16) -> ErrorCategory {
    match status {
        429 => ErrorCategory::Transient,
        500..=599 => ErrorCategory::Transient,
        400..=499 => ErrorCategory::Permanent,
        _ => ErrorCategory::Transient,
    }
}

/// Classify an error message by its content.
///
/// Permanent signals are matched first so that e.g. "connection rejected:
/// invalid credentials" aborts instead of retrying forever. Anything without
/// a recognized signal classifies as transient.
pub fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();

    const PERMANENT_SIGNALS: &[&str] = &[
        "unauthorized",
        "invalid credentials",
        "forbidden",
        "validation error",
        "unique constraint",
        "foreign key constraint",
    ];
    if PERMANENT_SIGNALS.iter().any(|s| lower.contains(s)) {
        return ErrorCategory::Permanent;
    }

    const TRANSIENT_SIGNALS: &[&str] = &[
        "rate limit",
        "too many requests",
        "timeout",
        "timed out",
        "connection reset",
        "connection",
        "deadlock",
        "lock timeout",
    ];
    if TRANSIENT_SIGNALS.iter().any(|s| lower.contains(s)) {
        return ErrorCategory::Transient;
    }

    ErrorCategory::Transient
}
