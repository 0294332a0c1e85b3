//! Token bucket rate limiter for wrapped dependencies.
//!
//! Per-operation token buckets; bucket parameters travel with the
//! [`RetryPolicy`](crate::policy::RetryPolicy) (`rate_limit` field) so each
//! dependency class carries its own budget. Waiting suspends only the calling
//! task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};

/// Rate limit for one dependency class.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Maximum sustained requests per minute.
    pub requests_per_minute: u32,
    /// Maximum burst size (bucket capacity).
    pub burst_capacity: f64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_capacity: 10.0,
        }
    }
}

/// Token bucket for a single operation key.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    rate_per_sec: f64,
    capacity: f64,
}

impl TokenBucket {
    fn new(limit: &RateLimit, now: Instant) -> Self {
        Self {
            tokens: limit.burst_capacity,
            last_refill: now,
            rate_per_sec: f64::from(limit.requests_per_minute) / 60.0,
            capacity: limit.burst_capacity,
        }
    }

    /// Whether this bucket was built from the same limit parameters.
    fn matches(&self, limit: &RateLimit) -> bool {
        (self.rate_per_sec - f64::from(limit.requests_per_minute) / 60.0).abs() < f64::EPSILON
            && (self.capacity - limit.burst_capacity).abs() < f64::EPSILON
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate_per_sec)
        }
    }
}

/// Per-operation token bucket rate limiter.
///
/// Buckets are created on demand from the limit passed at the call site and
/// rebuilt if the limit changes. State is in-memory and resets on restart.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a limiter reading time from the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Lock the buckets mutex, recovering from poison if necessary.
    ///
    /// Worst case after recovery is slightly incorrect rate limiting, which
    /// beats panicking.
    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Acquire a token for `operation`, waiting (asynchronously) as needed.
    pub async fn acquire(&self, operation: &str, limit: &RateLimit) {
        loop {
            let wait = {
                let now = self.clock.now();
                let mut buckets = self.lock_buckets();
                let bucket = Self::bucket_entry(&mut buckets, operation, limit, now);

                if bucket.try_acquire(now) {
                    return;
                }
                bucket.time_until_available(now)
            };

            if wait > Duration::ZERO {
                debug!("Rate limiter: waiting {:?} for '{}'", wait, operation);
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Acquire a token without waiting. Returns false when rate limited.
    pub fn try_acquire(&self, operation: &str, limit: &RateLimit) -> bool {
        let now = self.clock.now();
        let mut buckets = self.lock_buckets();
        Self::bucket_entry(&mut buckets, operation, limit, now).try_acquire(now)
    }

    /// Remaining tokens for an operation, after refill.
    pub fn remaining_tokens(&self, operation: &str, limit: &RateLimit) -> f64 {
        let now = self.clock.now();
        let mut buckets = self.lock_buckets();
        let bucket = Self::bucket_entry(&mut buckets, operation, limit, now);
        bucket.refill(now);
        bucket.tokens
    }

    /// Drop the bucket for an operation, restoring a full burst.
    pub fn reset(&self, operation: &str) {
        let mut buckets = self.lock_buckets();
        buckets.remove(operation);
    }

    fn bucket_entry<'a>(
        buckets: &'a mut HashMap<String, TokenBucket>,
        operation: &str,
        limit: &RateLimit,
        now: Instant,
    ) -> &'a mut TokenBucket {
        let bucket = buckets
            .entry(operation.to_string())
            .or_insert_with(|| TokenBucket::new(limit, now));
        if !bucket.matches(limit) {
            *bucket = TokenBucket::new(limit, now);
        }
        bucket
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limit(requests_per_minute: u32, burst: f64) -> RateLimit {
        RateLimit {
            requests_per_minute,
            burst_capacity: burst,
        }
    }

    #[test]
    fn test_burst_then_rate_limited() {
        let limiter = RateLimiter::new();
        let limit = limit(60, 3.0);

        for _ in 0..3 {
            assert!(limiter.try_acquire("embed", &limit));
        }
        assert!(!limiter.try_acquire("embed", &limit));
    }

    #[test]
    fn test_refill_follows_clock() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(Arc::new(clock.clone()));
        let limit = limit(60, 1.0); // one token per second

        assert!(limiter.try_acquire("db", &limit));
        assert!(!limiter.try_acquire("db", &limit));

        clock.advance(Duration::from_secs(2));
        assert!(limiter.try_acquire("db", &limit));
    }

    #[test]
    fn test_per_operation_isolation() {
        let limiter = RateLimiter::new();
        let limit = limit(60, 1.0);

        assert!(limiter.try_acquire("embed", &limit));
        assert!(!limiter.try_acquire("embed", &limit));

        assert!(limiter.try_acquire("generate", &limit));
    }

    #[test]
    fn test_changed_limit_rebuilds_bucket() {
        let limiter = RateLimiter::new();

        assert!(limiter.try_acquire("embed", &limit(60, 1.0)));
        assert!(!limiter.try_acquire("embed", &limit(60, 1.0)));

        // A new policy with a larger burst takes effect immediately.
        assert!(limiter.try_acquire("embed", &limit(60, 5.0)));
    }

    #[test]
    fn test_reset_restores_burst() {
        let limiter = RateLimiter::new();
        let limit = limit(60, 2.0);

        assert!(limiter.try_acquire("embed", &limit));
        assert!(limiter.try_acquire("embed", &limit));
        assert!(!limiter.try_acquire("embed", &limit));

        limiter.reset("embed");
        assert!(limiter.try_acquire("embed", &limit));
    }

    #[test]
    fn test_remaining_tokens() {
        let limiter = RateLimiter::new();
        let limit = limit(60, 5.0);

        limiter.try_acquire("embed", &limit);
        limiter.try_acquire("embed", &limit);

        let remaining = limiter.remaining_tokens("embed", &limit);
        assert!((remaining - 3.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_async_acquire_waits_for_token() {
        let limiter = RateLimiter::new();
        // 100 requests/second so the wait stays test-sized.
        let limit = limit(6_000, 2.0);

        limiter.acquire("embed", &limit).await;
        limiter.acquire("embed", &limit).await;

        let start = Instant::now();
        limiter.acquire("embed", &limit).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
