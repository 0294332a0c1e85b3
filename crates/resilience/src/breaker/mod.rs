//! Per-operation circuit breaker.
//!
//! Implements the circuit breaker pattern to stop hammering a dependency
//! that is already failing. Each operation key has its own circuit with
//! three states:
//!
//! - **Closed**: normal operation, calls pass through.
//! - **Open**: the dependency is failing, calls fail fast without running.
//! - **HalfOpen**: cooldown elapsed, exactly one probe tests recovery.
//!
//! State is in-memory and resets on application restart. All transitions for
//! a key happen under the circuit map guard, so concurrent failures cannot
//! observe a stale failure count, and the HalfOpen probe slot is claimed
//! atomically. The guard is never held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::policy::RetryPolicy;

/// Circuit state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CircuitState {
    /// Normal operation, calls are allowed.
    Closed,
    /// Dependency is failing, calls are blocked.
    Open,
    /// Testing recovery with a single probe.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// State transition produced by recording an outcome.
#[derive(Clone, Copy, Debug)]
pub struct StateChange {
    pub previous: CircuitState,
    pub current: CircuitState,
}

impl StateChange {
    /// The circuit just opened.
    pub fn tripped(&self) -> bool {
        self.current == CircuitState::Open && self.previous != CircuitState::Open
    }

    /// A probe just closed the circuit.
    pub fn recovered(&self) -> bool {
        self.previous == CircuitState::HalfOpen && self.current == CircuitState::Closed
    }
}

/// Internal circuit for a single operation key.
#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// Consecutive failures while Closed.
    failure_count: u32,
    last_failure_at: Option<Instant>,
    /// When an Open circuit next admits a probe.
    next_attempt_at: Option<Instant>,
    /// The HalfOpen probe slot; at most one holder.
    probe_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            probe_in_flight: false,
        }
    }
}

/// Observability snapshot of one circuit.
#[derive(Clone, Debug)]
pub struct CircuitSnapshot {
    pub operation: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub next_attempt_at: Option<Instant>,
}

/// Keyed circuit breaker.
///
/// Thread-safe; the trip threshold and cooldown travel with the
/// [`RetryPolicy`] of the dependency class, so a key is expected to be used
/// with a single policy.
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, Circuit>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a breaker reading time from the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Lock the circuit map, recovering from poison if necessary.
    ///
    /// Worst case after recovery is slightly incorrect circuit state, which
    /// beats panicking.
    fn lock_circuits(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(|poisoned| {
            warn!("Circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Whether a call for `operation` may proceed.
    ///
    /// Handles the Open → HalfOpen transition: once the cooldown has
    /// elapsed, the first caller claims the probe slot and is admitted;
    /// every other caller is rejected until the probe records an outcome.
    pub fn can_attempt(&self, operation: &str) -> bool {
        let now = self.clock.now();
        let mut circuits = self.lock_circuits();
        let circuit = circuits
            .entry(operation.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                match circuit.next_attempt_at {
                    Some(at) if now >= at => {
                        info!(
                            "Circuit breaker: '{}' cooldown elapsed, admitting probe",
                            operation
                        );
                        circuit.state = CircuitState::HalfOpen;
                        circuit.probe_in_flight = true;
                        true
                    }
                    _ => false,
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    // A probe is already out; treat as Open.
                    false
                } else {
                    // Previous prober vanished without recording an outcome.
                    debug!(
                        "Circuit breaker: reclaiming abandoned probe slot for '{}'",
                        operation
                    );
                    circuit.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call for `operation`.
    ///
    /// Closed: resets the failure count. HalfOpen: the probe succeeded, the
    /// circuit closes.
    pub fn record_success(&self, operation: &str) -> StateChange {
        let mut circuits = self.lock_circuits();
        let circuit = circuits
            .entry(operation.to_string())
            .or_insert_with(Circuit::new);
        let previous = circuit.state;

        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                info!(
                    "Circuit breaker: probe for '{}' succeeded, closing circuit",
                    operation
                );
                circuit.state = CircuitState::Closed;
                circuit.failure_count = 0;
                circuit.probe_in_flight = false;
                circuit.last_failure_at = None;
                circuit.next_attempt_at = None;
            }
            CircuitState::Open => {
                // No probe was admitted for this call; nothing to update.
                debug!(
                    "Circuit breaker: success recorded for '{}' while Open",
                    operation
                );
            }
        }

        StateChange {
            previous,
            current: circuit.state,
        }
    }

    /// Record a failed call for `operation`.
    ///
    /// Closed: increments the failure count and opens the circuit at the
    /// policy threshold. HalfOpen: the probe failed, the circuit reopens for
    /// a fresh cooldown (the cooldown itself does not grow).
    pub fn record_failure(&self, operation: &str, policy: &RetryPolicy) -> StateChange {
        let now = self.clock.now();
        let mut circuits = self.lock_circuits();
        let circuit = circuits
            .entry(operation.to_string())
            .or_insert_with(Circuit::new);
        let previous = circuit.state;

        circuit.last_failure_at = Some(now);

        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count += 1;
                if circuit.failure_count >= policy.circuit_breaker_threshold {
                    info!(
                        "Circuit breaker: opening '{}' after {} consecutive failures",
                        operation, circuit.failure_count
                    );
                    circuit.state = CircuitState::Open;
                    circuit.next_attempt_at = Some(now + policy.circuit_breaker_timeout);
                } else {
                    debug!(
                        "Circuit breaker: failure for '{}' ({}/{})",
                        operation, circuit.failure_count, policy.circuit_breaker_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                info!(
                    "Circuit breaker: probe for '{}' failed, reopening circuit",
                    operation
                );
                circuit.state = CircuitState::Open;
                circuit.probe_in_flight = false;
                circuit.next_attempt_at = Some(now + policy.circuit_breaker_timeout);
            }
            CircuitState::Open => {
                debug!(
                    "Circuit breaker: additional failure for '{}' (already open)",
                    operation
                );
            }
        }

        StateChange {
            previous,
            current: circuit.state,
        }
    }

    /// Current state for an operation. Unknown keys report Closed.
    pub fn state(&self, operation: &str) -> CircuitState {
        let circuits = self.lock_circuits();
        circuits
            .get(operation)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Consecutive-failure count for an operation.
    pub fn failure_count(&self, operation: &str) -> u32 {
        let circuits = self.lock_circuits();
        circuits.get(operation).map(|c| c.failure_count).unwrap_or(0)
    }

    /// Administrative override: clear the circuit back to Closed.
    pub fn reset(&self, operation: &str) {
        let mut circuits = self.lock_circuits();
        if circuits.remove(operation).is_some() {
            info!("Circuit breaker: manually reset circuit for '{}'", operation);
        }
    }

    /// Reset every circuit to its initial state.
    pub fn reset_all(&self) {
        let mut circuits = self.lock_circuits();
        circuits.clear();
        info!("Circuit breaker: all circuits reset");
    }

    /// Snapshot of one circuit, if the key has been seen.
    pub fn snapshot(&self, operation: &str) -> Option<CircuitSnapshot> {
        let circuits = self.lock_circuits();
        circuits.get(operation).map(|circuit| CircuitSnapshot {
            operation: operation.to_string(),
            state: circuit.state,
            failure_count: circuit.failure_count,
            last_failure_at: circuit.last_failure_at,
            next_attempt_at: circuit.next_attempt_at,
        })
    }

    /// Snapshots of every tracked circuit.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let circuits = self.lock_circuits();
        circuits
            .iter()
            .map(|(operation, circuit)| CircuitSnapshot {
                operation: operation.clone(),
                state: circuit.state,
                failure_count: circuit.failure_count,
                last_failure_at: circuit.last_failure_at,
                next_attempt_at: circuit.next_attempt_at,
            })
            .collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn policy(threshold: u32, cooldown_secs: u64) -> RetryPolicy {
        RetryPolicy {
            circuit_breaker_threshold: threshold,
            circuit_breaker_timeout: Duration::from_secs(cooldown_secs),
            ..RetryPolicy::default()
        }
    }

    fn breaker_with_clock() -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_clock(Arc::new(clock.clone()));
        (breaker, clock)
    }

    #[test]
    fn test_circuit_starts_closed() {
        let breaker = CircuitBreaker::new();

        assert!(breaker.can_attempt("embed"));
        assert_eq!(breaker.state("embed"), CircuitState::Closed);
        assert_eq!(breaker.failure_count("embed"), 0);
    }

    #[test]
    fn test_circuit_opens_at_threshold() {
        let breaker = CircuitBreaker::new();
        let policy = policy(3, 60);

        breaker.record_failure("embed", &policy);
        breaker.record_failure("embed", &policy);
        assert_eq!(breaker.state("embed"), CircuitState::Closed);
        assert!(breaker.can_attempt("embed"));

        let change = breaker.record_failure("embed", &policy);
        assert!(change.tripped());
        assert_eq!(breaker.state("embed"), CircuitState::Open);
        assert!(!breaker.can_attempt("embed"));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new();
        let policy = policy(3, 60);

        breaker.record_failure("db", &policy);
        breaker.record_failure("db", &policy);
        assert_eq!(breaker.failure_count("db"), 2);

        breaker.record_success("db");
        assert_eq!(breaker.failure_count("db"), 0);
        assert_eq!(breaker.state("db"), CircuitState::Closed);
    }

    #[test]
    fn test_open_rejects_until_cooldown() {
        let (breaker, clock) = breaker_with_clock();
        let policy = policy(1, 60);

        breaker.record_failure("generate", &policy);
        assert!(!breaker.can_attempt("generate"));

        clock.advance(Duration::from_secs(59));
        assert!(!breaker.can_attempt("generate"));

        clock.advance(Duration::from_secs(2));
        assert!(breaker.can_attempt("generate"));
        assert_eq!(breaker.state("generate"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let (breaker, clock) = breaker_with_clock();
        let policy = policy(1, 30);

        breaker.record_failure("embed", &policy);
        clock.advance(Duration::from_secs(31));

        // First caller claims the probe slot; the rest fail fast.
        assert!(breaker.can_attempt("embed"));
        assert!(!breaker.can_attempt("embed"));
        assert!(!breaker.can_attempt("embed"));
    }

    #[test]
    fn test_probe_success_closes_circuit() {
        let (breaker, clock) = breaker_with_clock();
        let policy = policy(1, 30);

        breaker.record_failure("embed", &policy);
        clock.advance(Duration::from_secs(31));
        assert!(breaker.can_attempt("embed"));

        let change = breaker.record_success("embed");
        assert!(change.recovered());
        assert_eq!(breaker.state("embed"), CircuitState::Closed);
        assert_eq!(breaker.failure_count("embed"), 0);

        // Fully recovered: new callers flow again.
        assert!(breaker.can_attempt("embed"));
    }

    #[test]
    fn test_probe_failure_reopens_with_fresh_cooldown() {
        let (breaker, clock) = breaker_with_clock();
        let policy = policy(1, 30);

        breaker.record_failure("embed", &policy);
        clock.advance(Duration::from_secs(31));
        assert!(breaker.can_attempt("embed"));

        let change = breaker.record_failure("embed", &policy);
        assert!(change.tripped());
        assert_eq!(breaker.state("embed"), CircuitState::Open);

        // The cooldown restarts from the probe failure, without growth.
        clock.advance(Duration::from_secs(29));
        assert!(!breaker.can_attempt("embed"));
        clock.advance(Duration::from_secs(2));
        assert!(breaker.can_attempt("embed"));
    }

    #[test]
    fn test_probe_slot_released_on_outcome() {
        let (breaker, clock) = breaker_with_clock();
        let policy = policy(1, 30);

        breaker.record_failure("embed", &policy);
        clock.advance(Duration::from_secs(31));
        assert!(breaker.can_attempt("embed"));

        // Probe fails; after another cooldown the next probe is admitted.
        breaker.record_failure("embed", &policy);
        clock.advance(Duration::from_secs(31));
        assert!(breaker.can_attempt("embed"));
        assert!(!breaker.can_attempt("embed"));
    }

    #[test]
    fn test_manual_reset() {
        let breaker = CircuitBreaker::new();
        let policy = policy(1, 60);

        breaker.record_failure("embed", &policy);
        assert_eq!(breaker.state("embed"), CircuitState::Open);

        breaker.reset("embed");
        assert_eq!(breaker.state("embed"), CircuitState::Closed);
        assert_eq!(breaker.failure_count("embed"), 0);
        assert!(breaker.can_attempt("embed"));
    }

    #[test]
    fn test_operation_isolation() {
        let breaker = CircuitBreaker::new();
        let policy = policy(1, 60);

        breaker.record_failure("embed", &policy);
        assert!(!breaker.can_attempt("embed"));

        assert!(breaker.can_attempt("generate"));
        assert_eq!(breaker.state("generate"), CircuitState::Closed);
    }

    #[test]
    fn test_snapshot_exposes_circuit_internals() {
        let (breaker, clock) = breaker_with_clock();
        let policy = policy(2, 60);

        assert!(breaker.snapshot("embed").is_none());

        breaker.record_failure("embed", &policy);
        let snap = breaker.snapshot("embed").unwrap();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 1);
        assert!(snap.last_failure_at.is_some());
        assert!(snap.next_attempt_at.is_none());

        breaker.record_failure("embed", &policy);
        let snap = breaker.snapshot("embed").unwrap();
        assert_eq!(snap.state, CircuitState::Open);
        let reopen_at = snap.next_attempt_at.unwrap();
        assert_eq!(
            reopen_at.duration_since(clock.now()),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_snapshots_cover_all_keys() {
        let breaker = CircuitBreaker::new();
        let policy = policy(5, 60);

        breaker.record_failure("embed", &policy);
        breaker.record_failure("generate", &policy);
        breaker.record_success("db");

        let mut operations: Vec<String> = breaker
            .snapshots()
            .into_iter()
            .map(|s| s.operation)
            .collect();
        operations.sort();
        assert_eq!(operations, vec!["db", "embed", "generate"]);
    }

    #[test]
    fn test_concurrent_failures_trip_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let breaker = Arc::new(CircuitBreaker::new());
        let policy = Arc::new(policy(10, 60));
        let trips = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let breaker = breaker.clone();
                let policy = policy.clone();
                let trips = trips.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        if breaker.record_failure("embed", &policy).tripped() {
                            trips.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Twenty concurrent failures against threshold 10: the breaker must
        // trip exactly once, not zero times and not redundantly.
        assert_eq!(trips.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state("embed"), CircuitState::Open);
    }
}
