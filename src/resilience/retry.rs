//! Bounded retries with exponential backoff.
//!
//! The retry manager only reports eligibility and delays. Counters live in
//! [`FlowControlState`], so there is exactly one retry count per operation
//! and escalation decisions stay with the engine.

use crate::error::RetriesExhausted;
use crate::flow::FlowControlState;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// ============================================================================
// Backoff Calculation
// ============================================================================

/// Default base delay before the first retry.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;

/// Default ceiling for a single delay.
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;

/// Multiplier applied per recorded retry.
pub const BACKOFF_MULTIPLIER: u64 = 2;

/// Delay settings for a retry manager.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any single delay, before jitter.
    pub cap: Duration,
    /// Fractional jitter; `0.2` spreads delays over ±20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// A policy that never sleeps.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            cap: Duration::ZERO,
            jitter: 0.0,
        }
    }
}

/// Calculate the un-jittered delay after `retry_count` recorded retries.
///
/// Returns `min(base * 2^retry_count, cap)`, saturating instead of
/// overflowing for large counts.
///
/// # Example
///
/// ```
/// use flowguard::resilience::calculate_backoff;
/// use std::time::Duration;
///
/// let base = Duration::from_secs(1);
/// let cap = Duration::from_secs(30);
/// assert_eq!(calculate_backoff(0, base, cap), Duration::from_secs(1));
/// assert_eq!(calculate_backoff(2, base, cap), Duration::from_secs(4));
/// assert_eq!(calculate_backoff(10, base, cap), Duration::from_secs(30));
/// ```
#[must_use]
pub fn calculate_backoff(retry_count: u32, base: Duration, cap: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
    let multiplier = BACKOFF_MULTIPLIER.saturating_pow(retry_count);
    let delay = base_ms.saturating_mul(multiplier);
    Duration::from_millis(delay.min(cap_ms))
}

/// Spread a delay by up to ±`jitter` of its length.
#[must_use]
pub fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    delay.mul_f64(factor.max(0.0))
}

// ============================================================================
// Retry Manager
// ============================================================================

/// Reports retry eligibility and delays for a single run.
#[derive(Debug, Clone)]
pub struct RetryManager {
    state: Arc<FlowControlState>,
    policy: BackoffPolicy,
}

impl RetryManager {
    /// Create a retry manager over a run's state.
    #[must_use]
    pub fn new(state: Arc<FlowControlState>, policy: BackoffPolicy) -> Self {
        Self { state, policy }
    }

    /// Delay settings in use.
    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Check if `operation` still has retry budget.
    #[must_use]
    pub fn can_retry(&self, operation: &str) -> bool {
        self.state.retry_count(operation) < self.state.max_retries_for(operation)
    }

    /// Retries left for `operation`.
    #[must_use]
    pub fn remaining(&self, operation: &str) -> u32 {
        self.state
            .max_retries_for(operation)
            .saturating_sub(self.state.retry_count(operation))
    }

    /// Delay to wait before the next retry of `operation`.
    #[must_use]
    pub fn next_delay(&self, operation: &str) -> Duration {
        let count = self.state.retry_count(operation);
        let delay = calculate_backoff(count, self.policy.base, self.policy.cap);
        apply_jitter(delay, self.policy.jitter)
    }

    /// Record one retry against `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`RetriesExhausted`] once the budget is spent; the counter is
    /// not incremented in that case.
    pub fn record_attempt(&self, operation: &str) -> Result<u32, RetriesExhausted> {
        let count = self.state.record_retry(operation)?;
        debug!(
            operation,
            retry = count,
            max = self.state.max_retries_for(operation),
            "Retry recorded"
        );
        Ok(count)
    }
}
