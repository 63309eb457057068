//! Per-operation circuit breakers.
//!
//! Each operation name gets an independent breaker. The registry is meant to
//! be shared behind an `Arc` when several runs should react together to a
//! failing downstream; every mutation happens under the registry's lock.
//!
//! # Example
//!
//! ```
//! use flowguard::error::StageError;
//! use flowguard::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
//! use std::time::Duration;
//!
//! # tokio_test_block(async {
//! let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
//!     failure_threshold: 1,
//!     recovery_timeout: Duration::from_secs(60),
//! });
//!
//! let failed = registry
//!     .execute("draft", || async { Err::<(), _>(StageError::failed("boom")) })
//!     .await
//!     .unwrap_err();
//! assert!(failed.circuit_now_open());
//! assert_eq!(registry.state("draft"), CircuitState::Open);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use crate::error::StageError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Tripped; calls are rejected without being invoked.
    Open,
    /// Recovery probe; exactly one trial call is let through.
    HalfOpen,
}

/// Breaker thresholds, shared by every operation in a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Error returned by [`CircuitBreakerRegistry::execute`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakerError {
    /// The call was rejected; the wrapped operation was never invoked.
    #[error("circuit open for '{operation}'")]
    Open { operation: String },

    /// The wrapped operation failed. `circuit_now_open` is the breaker's
    /// verdict after recording the failure.
    #[error("{source} (circuit now open: {circuit_now_open})")]
    Failed {
        source: StageError,
        circuit_now_open: bool,
    },
}

impl BreakerError {
    /// Check if the breaker is open after this error.
    #[must_use]
    pub fn circuit_now_open(&self) -> bool {
        match self {
            Self::Open { .. } => true,
            Self::Failed {
                circuit_now_open, ..
            } => *circuit_now_open,
        }
    }

    /// The underlying stage error, if the operation actually ran.
    #[must_use]
    pub fn stage_error(&self) -> Option<&StageError> {
        match self {
            Self::Open { .. } => None,
            Self::Failed { source, .. } => Some(source),
        }
    }
}

/// Observable counters for one operation's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub openings: u32,
    pub rejected: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    trial_in_flight: bool,
    openings: u32,
    rejected: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            trial_in_flight: false,
            openings: 0,
            rejected: 0,
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure_at = Some(now);
        self.openings += 1;
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            openings: self.openings,
            rejected: self.rejected,
        }
    }
}

/// Registry of independent breakers keyed by operation name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, BreakerState>>,
}

/// Outcome of asking a breaker for permission to call.
enum Admission {
    Allowed,
    Rejected,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Create a registry ready to be shared between runs.
    #[must_use]
    pub fn shared(config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Breaker thresholds.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BreakerState>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `call` through the breaker for `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] without invoking `call` while the
    /// breaker rejects, or [`BreakerError::Failed`] carrying the original
    /// error and the breaker's verdict when `call` fails.
    pub async fn execute<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        if let Admission::Rejected = self.admit(operation) {
            return Err(BreakerError::Open {
                operation: operation.to_string(),
            });
        }

        let mut permit = Permit {
            registry: self,
            operation,
            settled: false,
        };
        let outcome = call().await;
        permit.settled = true;

        match outcome {
            Ok(value) => {
                self.record_success(operation);
                Ok(value)
            }
            Err(source) => {
                let circuit_now_open = self.record_failure(operation);
                Err(BreakerError::Failed {
                    source,
                    circuit_now_open,
                })
            }
        }
    }

    fn admit(&self, operation: &str) -> Admission {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(operation.to_string())
            .or_insert_with(BreakerState::new);

        match breaker.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let cooled = breaker
                    .last_failure_at
                    .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
                if cooled {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.trial_in_flight = true;
                    info!(operation, "Circuit half-open, allowing trial call");
                    Admission::Allowed
                } else {
                    breaker.rejected += 1;
                    debug!(operation, rejected = breaker.rejected, "Circuit open, call rejected");
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if breaker.trial_in_flight {
                    breaker.rejected += 1;
                    debug!(operation, "Trial call already in flight, call rejected");
                    Admission::Rejected
                } else {
                    breaker.trial_in_flight = true;
                    Admission::Allowed
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, operation: &str) {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(operation.to_string())
            .or_insert_with(BreakerState::new);

        if breaker.state == CircuitState::HalfOpen {
            info!(operation, "Trial call succeeded, circuit closed");
        }
        breaker.state = CircuitState::Closed;
        breaker.failure_count = 0;
        breaker.trial_in_flight = false;
    }

    /// Record a failed call and return whether the breaker is now open.
    pub fn record_failure(&self, operation: &str) -> bool {
        let now = Instant::now();
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(operation.to_string())
            .or_insert_with(BreakerState::new);

        breaker.failure_count = breaker.failure_count.saturating_add(1);
        match breaker.state {
            CircuitState::Closed => {
                if breaker.failure_count >= self.config.failure_threshold {
                    breaker.trip(now);
                    warn!(
                        operation,
                        failures = breaker.failure_count,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                breaker.trial_in_flight = false;
                breaker.trip(now);
                warn!(operation, "Trial call failed, circuit re-opened");
            }
            CircuitState::Open => {
                breaker.last_failure_at = Some(now);
            }
        }
        breaker.state == CircuitState::Open
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Current state of an operation's breaker (`Closed` if never used).
    #[must_use]
    pub fn state(&self, operation: &str) -> CircuitState {
        self.lock()
            .get(operation)
            .map_or(CircuitState::Closed, |b| b.state)
    }

    /// Failures recorded since the breaker last closed.
    #[must_use]
    pub fn failure_count(&self, operation: &str) -> u32 {
        self.lock().get(operation).map_or(0, |b| b.failure_count)
    }

    /// Calls rejected without being invoked.
    #[must_use]
    pub fn rejected_count(&self, operation: &str) -> u64 {
        self.lock().get(operation).map_or(0, |b| b.rejected)
    }

    /// Times the breaker has tripped open.
    #[must_use]
    pub fn openings(&self, operation: &str) -> u32 {
        self.lock().get(operation).map_or(0, |b| b.openings)
    }

    /// Openings summed over every operation.
    #[must_use]
    pub fn total_openings(&self) -> u32 {
        self.lock().values().map(|b| b.openings).sum()
    }

    /// Counters for every operation seen so far.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.lock()
            .iter()
            .map(|(op, b)| (op.clone(), b.snapshot()))
            .collect()
    }

    /// Manually close an operation's breaker.
    pub fn reset(&self, operation: &str) {
        if let Some(breaker) = self.lock().get_mut(operation) {
            *breaker = BreakerState::new();
        }
    }

    /// Forget every breaker.
    pub fn reset_all(&self) {
        self.lock().clear();
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Settles an admitted call if its future is dropped before completing.
struct Permit<'a> {
    registry: &'a CircuitBreakerRegistry,
    operation: &'a str,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            // An abandoned call counts as a failure so a half-open trial
            // slot is never left occupied.
            self.registry.record_failure(self.operation);
        }
    }
}
