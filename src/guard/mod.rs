//! Loop prevention system.
//!
//! The guard is the run-wide backstop against pathological cycling. Three
//! independent checks can abort a run:
//!
//! 1. **Execution ceiling** - an operation invoked more often than its limit.
//! 2. **Oscillation** - a short stage block repeating back-to-back.
//! 3. **Wall clock** - the run outliving its total duration budget.
//!
//! Cancellation is observed at the same checkpoints.
//!
//! # Example
//!
//! ```
//! use flowguard::config::FlowConfig;
//! use flowguard::error::LoopGuardViolation;
//! use flowguard::guard::{CancellationToken, LoopGuard};
//!
//! let config = FlowConfig::default().with_max_executions("draft", 2);
//! let mut guard = LoopGuard::new(config.loop_guard_config(), CancellationToken::new());
//!
//! guard.check_and_record("draft").unwrap();
//! guard.check_and_record("draft").unwrap();
//! assert!(matches!(
//!     guard.check_and_record("draft"),
//!     Err(LoopGuardViolation::MaxExecutionLimitExceeded { .. })
//! ));
//! ```

pub mod cancel;
pub mod cycle;

pub use cancel::CancellationToken;
pub use cycle::{PathTracker, Repetition};

use crate::error::LoopGuardViolation;
use crate::stage::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// Loop guard limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopGuardConfig {
    /// Execution ceiling per operation name.
    pub max_executions: BTreeMap<String, u32>,
    /// Ceiling for operations missing from `max_executions`.
    pub default_max_executions: u32,
    /// Stages retained for oscillation detection.
    pub path_capacity: usize,
    /// Back-to-back repeats tolerated before aborting.
    pub max_repeats: u32,
    /// Longest block checked for repetition.
    pub max_pattern_len: usize,
    /// Wall-clock budget for the whole run.
    pub max_total_duration: Duration,
}

impl LoopGuardConfig {
    /// Ceiling for an operation.
    #[must_use]
    pub fn limit_for(&self, operation: &str) -> u32 {
        self.max_executions
            .get(operation)
            .copied()
            .unwrap_or(self.default_max_executions)
    }
}

/// Serializable view of the guard's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopGuardSnapshot {
    pub execution_counts: BTreeMap<String, u32>,
    pub stage_path: Vec<StageId>,
    pub run_started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Per-run loop guard state and checks.
#[derive(Debug)]
pub struct LoopGuard {
    config: LoopGuardConfig,
    execution_counts: BTreeMap<String, u32>,
    path: PathTracker,
    started: Instant,
    run_started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl LoopGuard {
    /// Create a guard for a run starting now.
    #[must_use]
    pub fn new(config: LoopGuardConfig, cancel: CancellationToken) -> Self {
        let path = PathTracker::new(config.path_capacity);
        Self {
            config,
            execution_counts: BTreeMap::new(),
            path,
            started: Instant::now(),
            run_started_at: Utc::now(),
            cancel,
        }
    }

    /// Limits in force.
    #[must_use]
    pub fn config(&self) -> &LoopGuardConfig {
        &self.config
    }

    /// Time since the run started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Check cancellation and the wall-clock ceiling.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `TotalTimeoutExceeded`.
    pub fn check(&self) -> Result<(), LoopGuardViolation> {
        if self.cancel.is_cancelled() {
            return Err(LoopGuardViolation::Cancelled);
        }

        let elapsed = self.elapsed();
        if elapsed > self.config.max_total_duration {
            let violation = LoopGuardViolation::TotalTimeoutExceeded {
                elapsed_ms: millis(elapsed),
                limit_ms: millis(self.config.max_total_duration),
            };
            warn!(%violation, "Loop guard tripped");
            return Err(violation);
        }
        Ok(())
    }

    /// Count one invocation of `operation`, failing past its ceiling.
    ///
    /// Must be called before every external call the run makes.
    ///
    /// # Errors
    ///
    /// Returns `MaxExecutionLimitExceeded` once the count passes the
    /// ceiling, plus anything [`LoopGuard::check`] reports.
    pub fn check_and_record(&mut self, operation: &str) -> Result<(), LoopGuardViolation> {
        self.check()?;

        let limit = self.config.limit_for(operation);
        let count = self
            .execution_counts
            .entry(operation.to_string())
            .or_insert(0);
        *count += 1;
        if *count > limit {
            let violation = LoopGuardViolation::MaxExecutionLimitExceeded {
                operation: operation.to_string(),
                count: *count,
                limit,
            };
            warn!(%violation, "Loop guard tripped");
            return Err(violation);
        }
        Ok(())
    }

    /// Fail if one more invocation of `operation` would pass its ceiling.
    ///
    /// Redo edges call this before moving backwards, so the edge itself
    /// cannot be taken more often than the target may run.
    ///
    /// # Errors
    ///
    /// Returns `MaxExecutionLimitExceeded` without recording anything.
    pub fn ensure_capacity(&self, operation: &str) -> Result<(), LoopGuardViolation> {
        let limit = self.config.limit_for(operation);
        let count = self.execution_count(operation);
        if count.saturating_add(1) > limit {
            let violation = LoopGuardViolation::MaxExecutionLimitExceeded {
                operation: operation.to_string(),
                count: count.saturating_add(1),
                limit,
            };
            warn!(%violation, "Loop guard refused redo");
            return Err(violation);
        }
        Ok(())
    }

    /// Record a stage transition and run the oscillation check.
    ///
    /// Repetition is only evaluated on backward edges; forward progress
    /// cannot form a cycle.
    ///
    /// # Errors
    ///
    /// Returns `CyclicPatternDetected` when a block repeats more than
    /// `max_repeats` times, plus anything [`LoopGuard::check`] reports.
    pub fn record_transition(&mut self, from: StageId, to: StageId) -> Result<(), LoopGuardViolation> {
        self.check()?;

        if self.path.is_empty() {
            self.path.push(from);
        }
        self.path.push(to);

        if from.is_backward_to(to) {
            if let Some(found) = self.path.tail_repetition(self.config.max_pattern_len) {
                if found.repeats > self.config.max_repeats {
                    let violation = LoopGuardViolation::CyclicPatternDetected {
                        pattern: found.pattern,
                        repeats: found.repeats,
                        max_repeats: self.config.max_repeats,
                    };
                    warn!(%violation, "Loop guard tripped");
                    return Err(violation);
                }
            }
        }
        Ok(())
    }

    /// Invocations recorded for an operation.
    #[must_use]
    pub fn execution_count(&self, operation: &str) -> u32 {
        self.execution_counts.get(operation).copied().unwrap_or(0)
    }

    /// Copy of the counters and path.
    #[must_use]
    pub fn snapshot(&self) -> LoopGuardSnapshot {
        LoopGuardSnapshot {
            execution_counts: self.execution_counts.clone(),
            stage_path: self.path.to_vec(),
            run_started_at: self.run_started_at,
            elapsed_ms: millis(self.elapsed()),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
