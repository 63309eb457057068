//! Custom assertions for run results.
//!
//! Each assertion panics with the run summary and recent history, so a
//! failing test shows how the run actually went.

use crate::flow::{EventKind, RunResult};
use crate::stage::StageId;

fn recent_history(result: &RunResult) -> String {
    result
        .history()
        .iter()
        .rev()
        .take(12)
        .rev()
        .map(|e| {
            format!(
                "  {} {}{}",
                e.stage,
                e.kind,
                e.detail
                    .as_deref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assert that a run reached `Completed`.
///
/// # Panics
///
/// Panics with the failure reason if the run failed.
///
/// # Example
///
/// ```rust,ignore
/// let result = engine.run(request).await;
/// assert_completed(&result);
/// ```
pub fn assert_completed(result: &RunResult) {
    assert!(
        result.is_completed() && result.reason.is_none(),
        "Expected run to complete, but it ended in {}.\n{}\nRecent history:\n{}",
        result.final_stage,
        result.summary(),
        recent_history(result)
    );
}

/// Assert that a run failed with the given reason kind
/// (e.g. `"MaxExecutionLimitExceeded"`).
///
/// # Panics
///
/// Panics if the run completed or failed for another reason.
pub fn assert_failed_with(result: &RunResult, kind: &str) {
    assert_eq!(
        result.final_stage,
        StageId::Failed,
        "Expected run to fail with {}, but it ended in {}.\n{}",
        kind,
        result.final_stage,
        result.summary()
    );
    let actual = result.reason.as_ref().map(|r| r.kind());
    assert_eq!(
        actual,
        Some(kind),
        "Expected failure reason {}, got {:?}.\n{}\nRecent history:\n{}",
        kind,
        result.reason,
        result.summary(),
        recent_history(result)
    );
}

/// Assert the number of transitions a run took.
///
/// # Panics
///
/// Panics if the count differs.
pub fn assert_transition_count(result: &RunResult, expected: u32) {
    assert_eq!(
        result.transition_count(),
        expected,
        "Expected {} transitions, but got {}.\nRecent history:\n{}",
        expected,
        result.transition_count(),
        recent_history(result)
    );
}

/// Assert how often the loop guard counted an operation.
///
/// # Panics
///
/// Panics if the count differs.
pub fn assert_executions(result: &RunResult, operation: &str, expected: u32) {
    assert_eq!(
        result.executions_of(operation),
        expected,
        "Expected '{}' to run {} times, but it ran {} times.\nExecution counts: {:?}",
        operation,
        expected,
        result.executions_of(operation),
        result.guard.execution_counts
    );
}

/// Assert the retry counter of an operation.
///
/// # Panics
///
/// Panics if the count differs.
pub fn assert_retry_count(result: &RunResult, operation: &str, expected: u32) {
    let actual = result
        .state
        .retry_counts
        .get(operation)
        .copied()
        .unwrap_or(0);
    assert_eq!(
        actual, expected,
        "Expected {} retries for '{}', but got {}.\nRetry counts: {:?}",
        expected, operation, actual, result.state.retry_counts
    );
}

/// Assert that the run's history contains a transition into `stage`.
///
/// # Panics
///
/// Panics if the stage was never entered.
pub fn assert_visited(result: &RunResult, stage: StageId) {
    let visited = result
        .history()
        .iter()
        .any(|e| e.stage == stage && e.kind == EventKind::Transition);
    assert!(
        visited,
        "Expected run to enter {}, but it never did.\nRecent history:\n{}",
        stage,
        recent_history(result)
    );
}

/// Assert that the run never entered `stage`.
///
/// # Panics
///
/// Panics if the stage was entered.
pub fn assert_not_visited(result: &RunResult, stage: StageId) {
    assert_eq!(
        result.entries_of(stage),
        0,
        "Expected run to skip {}, but it entered it {} times.\nRecent history:\n{}",
        stage,
        result.entries_of(stage),
        recent_history(result)
    );
}
