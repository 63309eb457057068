//! Run results handed to the caller once a run reaches a terminal stage.

use super::history::{EventKind, HistoryEntry};
use super::state::StateSnapshot;
use crate::error::{FlowError, LoopGuardViolation, StageError};
use crate::guard::LoopGuardSnapshot;
use crate::resilience::BreakerSnapshot;
use crate::stage::{StageId, StageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Typed reason a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum FailureReason {
    /// A stage spent its retry budget with no error edge to fall back on
    RetriesExhausted {
        stage: StageId,
        operation: String,
        attempts: u32,
        max: u32,
        last_error: StageError,
    },
    /// A stage's breaker rejected or tripped with no error edge
    CircuitOpen { stage: StageId, operation: String },
    MaxExecutionLimitExceeded {
        operation: String,
        count: u32,
        limit: u32,
    },
    CyclicPatternDetected {
        pattern: Vec<StageId>,
        repeats: u32,
        max_repeats: u32,
    },
    TotalTimeoutExceeded { elapsed_ms: u64, limit_ms: u64 },
    Cancelled,
    InvalidTransition { from: StageId, to: StageId },
    /// A non-retried downstream error
    Stage { stage: StageId, error: StageError },
    /// Anything else that stopped the run
    Internal { message: String },
}

impl FailureReason {
    /// Build the reason for a run-ending error raised while in `stage`.
    #[must_use]
    pub fn from_error(stage: StageId, error: &FlowError) -> Self {
        match error {
            FlowError::RetriesExhausted {
                stage,
                exhausted,
                last_error,
            } => Self::RetriesExhausted {
                stage: *stage,
                operation: exhausted.operation.clone(),
                attempts: exhausted.attempts,
                max: exhausted.max,
                last_error: last_error.clone(),
            },
            FlowError::CircuitOpen { operation } => Self::CircuitOpen {
                stage,
                operation: operation.clone(),
            },
            FlowError::LoopGuard(violation) => Self::from(violation.clone()),
            FlowError::InvalidTransition(invalid) => Self::InvalidTransition {
                from: invalid.from,
                to: invalid.to,
            },
            FlowError::Stage { stage, source } => Self::Stage {
                stage: *stage,
                error: source.clone(),
            },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }

    /// Short machine-friendly name of the reason.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RetriesExhausted { .. } => "RetriesExhausted",
            Self::CircuitOpen { .. } => "CircuitOpen",
            Self::MaxExecutionLimitExceeded { .. } => "MaxExecutionLimitExceeded",
            Self::CyclicPatternDetected { .. } => "CyclicPatternDetected",
            Self::TotalTimeoutExceeded { .. } => "TotalTimeoutExceeded",
            Self::Cancelled => "Cancelled",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::Stage { .. } => "Stage",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Check if the loop prevention system ended the run.
    #[must_use]
    pub fn is_guard_violation(&self) -> bool {
        matches!(
            self,
            Self::MaxExecutionLimitExceeded { .. }
                | Self::CyclicPatternDetected { .. }
                | Self::TotalTimeoutExceeded { .. }
                | Self::Cancelled
        )
    }

    /// Process exit code for this reason.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CircuitOpen { .. } => 2,
            Self::Cancelled => 4,
            Self::MaxExecutionLimitExceeded { .. }
            | Self::CyclicPatternDetected { .. }
            | Self::TotalTimeoutExceeded { .. } => 3,
            Self::InvalidTransition { .. } => 5,
            _ => 1,
        }
    }
}

impl From<LoopGuardViolation> for FailureReason {
    fn from(violation: LoopGuardViolation) -> Self {
        match violation {
            LoopGuardViolation::MaxExecutionLimitExceeded {
                operation,
                count,
                limit,
            } => Self::MaxExecutionLimitExceeded {
                operation,
                count,
                limit,
            },
            LoopGuardViolation::CyclicPatternDetected {
                pattern,
                repeats,
                max_repeats,
            } => Self::CyclicPatternDetected {
                pattern,
                repeats,
                max_repeats,
            },
            LoopGuardViolation::TotalTimeoutExceeded {
                elapsed_ms,
                limit_ms,
            } => Self::TotalTimeoutExceeded {
                elapsed_ms,
                limit_ms,
            },
            LoopGuardViolation::Cancelled => Self::Cancelled,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted {
                stage,
                operation,
                attempts,
                max,
                last_error,
            } => write!(
                f,
                "{} exhausted retries for '{}' ({}/{}); last error: {}",
                stage, operation, attempts, max, last_error
            ),
            Self::CircuitOpen { stage, operation } => {
                write!(f, "{} blocked: circuit open for '{}'", stage, operation)
            }
            Self::MaxExecutionLimitExceeded {
                operation,
                count,
                limit,
            } => write!(
                f,
                "'{}' exceeded its execution limit ({} > {})",
                operation, count, limit
            ),
            Self::CyclicPatternDetected {
                pattern, repeats, ..
            } => write!(f, "cyclic pattern {:?} repeated {} times", pattern, repeats),
            Self::TotalTimeoutExceeded {
                elapsed_ms,
                limit_ms,
            } => write!(
                f,
                "run exceeded total duration ({}ms > {}ms)",
                elapsed_ms, limit_ms
            ),
            Self::Cancelled => write!(f, "run cancelled"),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid transition {} -> {}", from, to)
            }
            Self::Stage { stage, error } => write!(f, "{} failed: {}", stage, error),
            Self::Internal { message } => write!(f, "{}", message),
        }
    }
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub topic: String,
    /// `Completed` or `Failed`
    pub final_stage: StageId,
    /// Present exactly when `final_stage` is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub state: StateSnapshot,
    pub guard: LoopGuardSnapshot,
    /// Breaker counters at the end of the run
    pub breakers: BTreeMap<String, BreakerSnapshot>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// Check if the run reached `Completed`.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.final_stage == StageId::Completed
    }

    /// Full retained history.
    #[must_use]
    pub fn history(&self) -> &[HistoryEntry] {
        &self.state.history
    }

    /// Cached per-stage results.
    #[must_use]
    pub fn results(&self) -> &BTreeMap<StageId, StageResult> {
        &self.state.results
    }

    /// Transitions taken during the run.
    #[must_use]
    pub fn transition_count(&self) -> u32 {
        self.state.transition_count
    }

    /// Retries recorded across all operations.
    #[must_use]
    pub fn total_retries(&self) -> u32 {
        self.state.retry_counts.values().sum()
    }

    /// Breaker openings seen in the registry used by the run.
    #[must_use]
    pub fn circuit_openings(&self) -> u32 {
        self.breakers.values().map(|b| b.openings).sum()
    }

    /// How often the engine entered a stage (including skipped re-entries).
    #[must_use]
    pub fn entries_of(&self, stage: StageId) -> usize {
        self.history()
            .iter()
            .filter(|e| e.stage == stage && e.kind == EventKind::Transition)
            .count()
    }

    /// Invocations of an operation counted by the loop guard.
    #[must_use]
    pub fn executions_of(&self, operation: &str) -> u32 {
        self.guard
            .execution_counts
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    /// Exit code for a CLI reporting this run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match &self.reason {
            None if self.is_completed() => 0,
            None => 1,
            Some(reason) => reason.exit_code(),
        }
    }

    /// Condensed view of the run for display.
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            topic: self.topic.clone(),
            final_stage: self.final_stage,
            reason: self.reason.as_ref().map(ToString::to_string),
            transitions: self.transition_count(),
            executions: self.guard.execution_counts.clone(),
            retries: self.total_retries(),
            circuit_openings: self.circuit_openings(),
            elapsed_ms: self.guard.elapsed_ms,
        }
    }
}

/// Headline numbers of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub topic: String,
    pub final_stage: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub transitions: u32,
    /// Invocations per operation
    pub executions: BTreeMap<String, u32>,
    pub retries: u32,
    pub circuit_openings: u32,
    pub elapsed_ms: u64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} ({}): {}", self.run_id, self.topic, self.final_stage)?;
        if let Some(reason) = &self.reason {
            writeln!(f, "  Reason: {}", reason)?;
        }
        writeln!(
            f,
            "  Transitions: {}, retries: {}, circuit openings: {}, elapsed: {}ms",
            self.transitions, self.retries, self.circuit_openings, self.elapsed_ms
        )?;
        let executions: Vec<String> = self
            .executions
            .iter()
            .map(|(op, count)| format!("{}={}", op, count))
            .collect();
        write!(f, "  Executions: {}", executions.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{InvalidTransition, RetriesExhausted};

    #[test]
    fn test_reason_from_retries_exhausted() {
        let err = FlowError::RetriesExhausted {
            stage: StageId::Draft,
            exhausted: RetriesExhausted {
                operation: "draft".into(),
                attempts: 2,
                max: 2,
            },
            last_error: StageError::failed("model overloaded"),
        };
        let reason = FailureReason::from_error(StageId::Draft, &err);
        assert_eq!(reason.kind(), "RetriesExhausted");
        assert_eq!(reason.exit_code(), 1);
        assert!(reason.to_string().contains("model overloaded"));
    }

    #[test]
    fn test_reason_from_guard_violation() {
        let err = FlowError::from(LoopGuardViolation::MaxExecutionLimitExceeded {
            operation: "draft".into(),
            count: 6,
            limit: 5,
        });
        let reason = FailureReason::from_error(StageId::HumanReview, &err);
        assert!(reason.is_guard_violation());
        assert_eq!(reason.exit_code(), 3);
        assert_eq!(
            FailureReason::from(LoopGuardViolation::Cancelled).exit_code(),
            4
        );
    }

    #[test]
    fn test_reason_keeps_stage_for_circuit_open() {
        let reason = FailureReason::from_error(StageId::Draft, &FlowError::circuit_open("draft"));
        assert_eq!(
            reason,
            FailureReason::CircuitOpen {
                stage: StageId::Draft,
                operation: "draft".into()
            }
        );
        assert_eq!(reason.exit_code(), 2);
    }

    #[test]
    fn test_reason_serializes_with_kind_tag() {
        let reason = FailureReason::from_error(
            StageId::Draft,
            &FlowError::from(InvalidTransition {
                from: StageId::Draft,
                to: StageId::Finalize,
            }),
        );
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "InvalidTransition");
        assert_eq!(reason.exit_code(), 5);
    }
}
