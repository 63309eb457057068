//! Custom error types for flowguard.
//!
//! This module provides structured error types that let the engine decide,
//! per failure, whether to retry, take an error-handling edge, or abort the
//! whole run.

use crate::stage::StageId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Stage Errors
// ============================================================================

/// Failure reported by an external stage operation.
///
/// Stage errors are recoverable: the engine retries them until the
/// operation's retry budget is spent.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageError {
    /// The stage ran and reported a failure
    #[error("stage failed: {message}")]
    Failed { message: String },

    /// The stage did not finish within its time budget
    #[error("stage timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The stage refused its input (e.g. validation rejected the request)
    #[error("stage rejected input: {reason}")]
    Rejected { reason: String },

    /// No operation is registered for the stage
    #[error("no operation registered for stage {stage}")]
    Unavailable { stage: StageId },
}

impl StageError {
    /// Create a generic stage failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Create a timeout failure from the elapsed budget.
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

// ============================================================================
// State Errors
// ============================================================================

/// A proposed transition is not in the static transition table.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: StageId,
    pub to: StageId,
}

/// An operation asked for one more retry than it is allowed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("retries exhausted for '{operation}' ({attempts}/{max})")]
pub struct RetriesExhausted {
    pub operation: String,
    pub attempts: u32,
    pub max: u32,
}

// ============================================================================
// Loop Guard Errors
// ============================================================================

/// Violation raised by the loop prevention system.
///
/// Every variant is fatal to the run and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopGuardViolation {
    /// An operation was invoked more often than its ceiling allows
    #[error("'{operation}' exceeded its execution limit ({count} > {limit})")]
    MaxExecutionLimitExceeded {
        operation: String,
        count: u32,
        limit: u32,
    },

    /// A short block of stages keeps repeating back-to-back
    #[error("cyclic pattern {pattern:?} repeated {repeats} times (max {max_repeats})")]
    CyclicPatternDetected {
        pattern: Vec<StageId>,
        repeats: u32,
        max_repeats: u32,
    },

    /// The run exceeded its wall-clock ceiling
    #[error("run exceeded total duration ({elapsed_ms}ms > {limit_ms}ms)")]
    TotalTimeoutExceeded { elapsed_ms: u64, limit_ms: u64 },

    /// The caller cancelled the run
    #[error("run cancelled")]
    Cancelled,
}

/// A human-review request produced no decision.
///
/// The engine never fails a run over this; it falls back to the default
/// decision.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewError {
    /// No decision arrived within the review timeout
    #[error("review timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The review channel could not be reached
    #[error("reviewer unavailable: {reason}")]
    Unavailable { reason: String },
}

// ============================================================================
// Main Error Type
// ============================================================================

/// Main error type for flowguard operations
#[derive(Error, Debug)]
pub enum FlowError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Flow Errors
    // =========================================================================
    /// Transition rejected by the transition table
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Retry budget spent for an operation
    #[error("Stage {stage} failed: {exhausted}; last error: {last_error}")]
    RetriesExhausted {
        stage: StageId,
        exhausted: RetriesExhausted,
        last_error: StageError,
    },

    /// Circuit breaker rejected or tripped on an operation
    #[error("Circuit open for '{operation}'")]
    CircuitOpen { operation: String },

    /// Loop prevention aborted the run
    #[error(transparent)]
    LoopGuard(#[from] LoopGuardViolation),

    /// A stage failed in a way that is not retried
    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: StageId,
        #[source]
        source: StageError,
    },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid-configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a circuit-open error
    pub fn circuit_open(operation: impl Into<String>) -> Self {
        Self::CircuitOpen {
            operation: operation.into(),
        }
    }

    /// Create a non-retried stage error
    pub fn stage(stage: StageId, source: StageError) -> Self {
        Self::Stage { stage, source }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error came from the loop prevention system
    pub fn is_guard_violation(&self) -> bool {
        matches!(self, Self::LoopGuard(_))
    }

    /// Check if this error is a caller cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::LoopGuard(LoopGuardViolation::Cancelled))
    }

    /// Check if a local handler may retry past this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Stage {
                source: StageError::Failed { .. } | StageError::Timeout { .. },
                ..
            }
        )
    }

    /// Check if this error must abort the run immediately
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LoopGuard(_)
                | Self::InvalidTransition(_)
                | Self::Config { .. }
                | Self::InvalidConfig { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CircuitOpen { .. } => 2,
            Self::LoopGuard(LoopGuardViolation::Cancelled) => 4,
            Self::LoopGuard(_) => 3,
            Self::InvalidTransition(_) => 5,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for flowguard results
pub type Result<T> = std::result::Result<T, FlowError>;
