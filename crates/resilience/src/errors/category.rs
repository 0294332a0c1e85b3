/// Classification of a dependency failure for retry policy.
///
/// Determines how the executor responds to an error from a wrapped call.
///
/// # Behavior Summary
///
/// | Category | Retry? | Record Circuit Breaker Failure? |
/// |----------|--------|---------------------------------|
/// | `Transient` | Yes, with backoff | Yes |
/// | `Permanent` | No | Yes |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    /// Expected to resolve itself if the same operation is retried after a
    /// delay: rate limits, timeouts, service-side errors, lock contention.
    ///
    /// Unknown errors also land here. An extra retry against a recoverable
    /// failure costs one delayed attempt; dropping a recoverable failure
    /// loses the operation.
    Transient,

    /// Retrying will not fix it: authentication failures, invalid input,
    /// integrity violations. The request is aborted after the first attempt.
    Permanent,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}
