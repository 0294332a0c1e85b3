//! Passive per-operation metrics.
//!
//! The registry is fed exclusively by the executor (write methods are
//! crate-private) and read by the observability layer through immutable
//! snapshots. Nothing here is persisted; counters reset on restart.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};

/// Bounded latency sample window per operation.
const LATENCY_WINDOW: usize = 256;

/// Accumulated counters for one operation key.
#[derive(Default)]
struct OperationStats {
    success_count: u64,
    aborted_count: u64,
    exhausted_count: u64,
    circuit_rejections: u64,
    /// Attempts used per completed call (successes and failures that ran).
    attempts_histogram: BTreeMap<u32, u64>,
    trip_count: u64,
    /// Set while the circuit is open.
    opened_at: Option<Instant>,
    total_open: Duration,
    /// Most recent successful-call latencies.
    latencies: VecDeque<Duration>,
}

impl OperationStats {
    fn record_attempts(&mut self, attempts: u32) {
        *self.attempts_histogram.entry(attempts).or_insert(0) += 1;
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn time_in_open(&self, now: Instant) -> Duration {
        match self.opened_at {
            Some(since) => self.total_open + now.saturating_duration_since(since),
            None => self.total_open,
        }
    }
}

/// One bucket of the retry-count distribution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct AttemptBucket {
    /// Attempts used for the call (1 = no retries).
    pub attempts: u32,
    /// Number of calls that used exactly that many attempts.
    pub count: u64,
}

/// Immutable metrics snapshot for one operation.
#[derive(Clone, Debug, Serialize)]
pub struct OperationMetrics {
    pub operation: String,
    pub success_count: u64,
    /// Aborted + exhausted + circuit rejections.
    pub failure_count: u64,
    pub aborted_count: u64,
    pub exhausted_count: u64,
    pub circuit_rejections: u64,
    /// Successes over all surfaced outcomes; 0.0 before any traffic.
    pub success_rate: f64,
    pub retry_distribution: Vec<AttemptBucket>,
    pub circuit_trip_count: u64,
    /// Cumulative milliseconds spent with the circuit open, including the
    /// live interval when currently open.
    pub time_in_open_ms: u64,
    pub latency_p50_ms: Option<u64>,
    pub latency_p90_ms: Option<u64>,
    pub latency_p99_ms: Option<u64>,
    pub captured_at: DateTime<Utc>,
}

/// Keyed metrics registry.
///
/// Thread-safe. The write surface is `pub(crate)`: only the executor feeds
/// the registry, external collaborators read snapshots.
pub struct MetricsRegistry {
    stats: Mutex<HashMap<String, OperationStats>>,
    clock: Arc<dyn Clock>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a registry reading time from the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock_stats(&self) -> MutexGuard<'_, HashMap<String, OperationStats>> {
        self.stats.lock().unwrap_or_else(|poisoned| {
            warn!("Metrics registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub(crate) fn record_success(&self, operation: &str, attempts: u32, latency: Duration) {
        let mut stats = self.lock_stats();
        let entry = stats.entry(operation.to_string()).or_default();
        entry.success_count += 1;
        entry.record_attempts(attempts);
        entry.record_latency(latency);
    }

    pub(crate) fn record_aborted(&self, operation: &str, attempts: u32) {
        let mut stats = self.lock_stats();
        let entry = stats.entry(operation.to_string()).or_default();
        entry.aborted_count += 1;
        entry.record_attempts(attempts);
    }

    pub(crate) fn record_exhausted(&self, operation: &str, attempts: u32) {
        let mut stats = self.lock_stats();
        let entry = stats.entry(operation.to_string()).or_default();
        entry.exhausted_count += 1;
        entry.record_attempts(attempts);
    }

    pub(crate) fn record_circuit_rejection(&self, operation: &str) {
        let mut stats = self.lock_stats();
        let entry = stats.entry(operation.to_string()).or_default();
        entry.circuit_rejections += 1;
    }

    pub(crate) fn record_trip(&self, operation: &str) {
        let now = self.clock.now();
        let mut stats = self.lock_stats();
        let entry = stats.entry(operation.to_string()).or_default();
        entry.trip_count += 1;
        entry.opened_at = Some(now);
    }

    pub(crate) fn record_recovery(&self, operation: &str) {
        let now = self.clock.now();
        let mut stats = self.lock_stats();
        let entry = stats.entry(operation.to_string()).or_default();
        if let Some(since) = entry.opened_at.take() {
            entry.total_open += now.saturating_duration_since(since);
        }
    }

    /// Snapshot for one operation, if it has been seen.
    pub fn snapshot(&self, operation: &str) -> Option<OperationMetrics> {
        let now = self.clock.now();
        let stats = self.lock_stats();
        stats
            .get(operation)
            .map(|entry| build_snapshot(operation, entry, now))
    }

    /// Snapshots for every tracked operation.
    pub fn snapshots(&self) -> Vec<OperationMetrics> {
        let now = self.clock.now();
        let stats = self.lock_stats();
        stats
            .iter()
            .map(|(operation, entry)| build_snapshot(operation, entry, now))
            .collect()
    }

    /// Drop all recorded metrics.
    pub fn reset(&self) {
        let mut stats = self.lock_stats();
        stats.clear();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_snapshot(operation: &str, entry: &OperationStats, now: Instant) -> OperationMetrics {
    let failure_count = entry.aborted_count + entry.exhausted_count + entry.circuit_rejections;
    let total = entry.success_count + failure_count;
    let success_rate = if total == 0 {
        0.0
    } else {
        entry.success_count as f64 / total as f64
    };

    let mut sorted: Vec<Duration> = entry.latencies.iter().copied().collect();
    sorted.sort();

    OperationMetrics {
        operation: operation.to_string(),
        success_count: entry.success_count,
        failure_count,
        aborted_count: entry.aborted_count,
        exhausted_count: entry.exhausted_count,
        circuit_rejections: entry.circuit_rejections,
        success_rate,
        retry_distribution: entry
            .attempts_histogram
            .iter()
            .map(|(&attempts, &count)| AttemptBucket { attempts, count })
            .collect(),
        circuit_trip_count: entry.trip_count,
        time_in_open_ms: entry.time_in_open(now).as_millis() as u64,
        latency_p50_ms: percentile(&sorted, 0.50),
        latency_p90_ms: percentile(&sorted, 0.90),
        latency_p99_ms: percentile(&sorted, 0.99),
        captured_at: Utc::now(),
    }
}

/// Nearest-rank percentile over a sorted sample, in milliseconds.
fn percentile(sorted: &[Duration], q: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    Some(sorted[rank].as_millis() as u64)
}
