//! Flow control state - the single source of truth for a run.
//!
//! Every mutating method takes the state's one lock for its whole body, so
//! no caller can observe a partial update (e.g. a stage marked complete
//! without its history entry).
//!
//! # Example
//!
//! ```
//! use flowguard::config::FlowConfig;
//! use flowguard::flow::FlowControlState;
//! use flowguard::stage::StageId;
//!
//! let state = FlowControlState::new(&FlowConfig::default());
//! assert_eq!(state.current_stage(), StageId::Validate);
//!
//! state.transition(StageId::AlignAudience).unwrap();
//! assert!(state.transition(StageId::Finalize).is_err());
//! assert_eq!(state.transition_count(), 1);
//! ```

use super::history::{BoundedHistory, EventKind, HistoryEntry};
use crate::config::FlowConfig;
use crate::error::{InvalidTransition, RetriesExhausted};
use crate::stage::{StageId, StageResult, StageTransitionTable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Mutable part of the aggregate, guarded by one mutex.
#[derive(Debug)]
struct StateInner {
    current_stage: StageId,
    retry_counts: BTreeMap<String, u32>,
    completed_stages: BTreeSet<StageId>,
    results: BTreeMap<StageId, StageResult>,
    history: BoundedHistory,
    transitions: u32,
}

/// Serializable copy of the state, handed to the caller at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub current_stage: StageId,
    pub retry_counts: BTreeMap<String, u32>,
    pub max_retries: BTreeMap<String, u32>,
    pub completed_stages: BTreeSet<StageId>,
    pub results: BTreeMap<StageId, StageResult>,
    pub history: Vec<HistoryEntry>,
    pub history_trimmed: u64,
    pub transition_count: u32,
    pub started_at: DateTime<Utc>,
}

/// Lock-protected aggregate describing a run's progress.
#[derive(Debug)]
pub struct FlowControlState {
    table: StageTransitionTable,
    max_retries: BTreeMap<String, u32>,
    default_max_retries: u32,
    started_at: DateTime<Utc>,
    inner: Mutex<StateInner>,
}

impl FlowControlState {
    /// Create a state starting at `Validate` with the standard table.
    #[must_use]
    pub fn new(config: &FlowConfig) -> Self {
        Self::with_table(config, StageTransitionTable::standard(), StageId::Validate)
    }

    /// Create a state with an explicit table and initial stage.
    #[must_use]
    pub fn with_table(config: &FlowConfig, table: StageTransitionTable, initial: StageId) -> Self {
        Self {
            table,
            max_retries: config.max_retries.clone(),
            default_max_retries: config.default_max_retries,
            started_at: Utc::now(),
            inner: Mutex::new(StateInner {
                current_stage: initial,
                retry_counts: BTreeMap::new(),
                completed_stages: BTreeSet::new(),
                results: BTreeMap::new(),
                history: BoundedHistory::new(config.history_cap, config.history_keep_recent),
                transitions: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        // Every critical section leaves the aggregate consistent, so a
        // poisoned lock still guards valid data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Stage transitions
    // =========================================================================

    /// Current stage.
    #[must_use]
    pub fn current_stage(&self) -> StageId {
        self.lock().current_stage
    }

    /// Check if the run has reached `Completed` or `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.current_stage().is_terminal()
    }

    /// Move to `to` if the transition table allows it.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and leaves the state untouched if the
    /// edge is not in the table.
    pub fn transition(&self, to: StageId) -> Result<(), InvalidTransition> {
        let mut inner = self.lock();
        let from = inner.current_stage;
        self.table.validate(from, to)?;

        inner
            .history
            .push(HistoryEntry::new(to, EventKind::Transition).with_detail(format!("from {}", from)));
        inner.current_stage = to;
        inner.transitions += 1;
        debug!(%from, %to, "Stage transition");
        Ok(())
    }

    /// Emergency abort: move straight to `Failed`, bypassing the table.
    ///
    /// Returns `false` (and records nothing) if the run already ended.
    pub fn fail(&self, reason: &str) -> bool {
        let mut inner = self.lock();
        let from = inner.current_stage;
        if from.is_terminal() {
            return false;
        }

        inner
            .history
            .push(HistoryEntry::new(from, EventKind::Aborted).with_detail(reason));
        inner.history.push(
            HistoryEntry::new(StageId::Failed, EventKind::Transition)
                .with_detail(format!("from {}", from)),
        );
        inner.current_stage = StageId::Failed;
        inner.transitions += 1;
        true
    }

    /// Number of transitions taken (not affected by history trimming).
    #[must_use]
    pub fn transition_count(&self) -> u32 {
        self.lock().transitions
    }

    /// The table transitions are validated against.
    #[must_use]
    pub fn table(&self) -> &StageTransitionTable {
        &self.table
    }

    // =========================================================================
    // Retry counters
    // =========================================================================

    /// Retry budget for an operation.
    #[must_use]
    pub fn max_retries_for(&self, operation: &str) -> u32 {
        self.max_retries
            .get(operation)
            .copied()
            .unwrap_or(self.default_max_retries)
    }

    /// Retries recorded so far for an operation.
    #[must_use]
    pub fn retry_count(&self, operation: &str) -> u32 {
        self.lock().retry_counts.get(operation).copied().unwrap_or(0)
    }

    /// Record one retry and return the new count.
    ///
    /// # Errors
    ///
    /// Returns [`RetriesExhausted`] without incrementing once the count has
    /// reached the operation's budget.
    pub fn record_retry(&self, operation: &str) -> Result<u32, RetriesExhausted> {
        let max = self.max_retries_for(operation);
        let mut inner = self.lock();
        let count = inner.retry_counts.get(operation).copied().unwrap_or(0);
        if count >= max {
            return Err(RetriesExhausted {
                operation: operation.to_string(),
                attempts: count,
                max,
            });
        }

        let next = count + 1;
        inner.retry_counts.insert(operation.to_string(), next);
        let stage = inner.current_stage;
        inner.history.push(
            HistoryEntry::new(stage, EventKind::Retry)
                .with_detail(format!("{} retry {}/{}", operation, next, max)),
        );
        Ok(next)
    }

    /// Copy of every retry counter.
    #[must_use]
    pub fn retry_counts(&self) -> BTreeMap<String, u32> {
        self.lock().retry_counts.clone()
    }

    // =========================================================================
    // Completion and result cache
    // =========================================================================

    /// Mark a stage complete and cache its result.
    ///
    /// Calling it again for the same stage overwrites the result.
    pub fn mark_completed(&self, stage: StageId, result: StageResult) {
        let mut inner = self.lock();
        let overwritten = inner.results.insert(stage, result).is_some();
        inner.completed_stages.insert(stage);
        let entry = HistoryEntry::new(stage, EventKind::Completed);
        inner.history.push(if overwritten {
            entry.with_detail("result replaced")
        } else {
            entry
        });
    }

    /// Clear a stage's completion flag and cached result.
    ///
    /// Returns whether the stage had been complete. A `Reset` event is
    /// recorded only in that case; resetting a stage that never completed
    /// leaves the history untouched.
    pub fn reset(&self, stage: StageId) -> bool {
        let mut inner = self.lock();
        Self::reset_locked(&mut inner, stage)
    }

    /// Reset several stages under a single lock acquisition.
    ///
    /// Returns the stages that had been complete.
    pub fn reset_group(&self, stages: &[StageId]) -> Vec<StageId> {
        let mut inner = self.lock();
        stages
            .iter()
            .copied()
            .filter(|stage| Self::reset_locked(&mut inner, *stage))
            .collect()
    }

    fn reset_locked(inner: &mut StateInner, stage: StageId) -> bool {
        let was_completed = inner.completed_stages.remove(&stage);
        inner.results.remove(&stage);
        if was_completed {
            inner
                .history
                .push(HistoryEntry::new(stage, EventKind::Reset));
        }
        was_completed
    }

    /// Check if a stage is complete.
    #[must_use]
    pub fn is_completed(&self, stage: StageId) -> bool {
        self.lock().completed_stages.contains(&stage)
    }

    /// Cached result for a stage.
    #[must_use]
    pub fn result(&self, stage: StageId) -> Option<StageResult> {
        self.lock().results.get(&stage).cloned()
    }

    /// Copy of every cached result.
    #[must_use]
    pub fn results(&self) -> BTreeMap<StageId, StageResult> {
        self.lock().results.clone()
    }

    /// Completed stages, in pipeline order.
    #[must_use]
    pub fn completed_stages(&self) -> BTreeSet<StageId> {
        self.lock().completed_stages.clone()
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Append an event to the history.
    pub fn record_event(&self, stage: StageId, kind: EventKind, detail: Option<String>) {
        let mut entry = HistoryEntry::new(stage, kind);
        entry.detail = detail;
        self.lock().history.push(entry);
    }

    /// Copy of the retained history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.to_vec()
    }

    /// Number of retained history entries.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    /// When the run started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Consistent copy of the whole aggregate.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.lock();
        let mut max_retries: BTreeMap<String, u32> = inner
            .retry_counts
            .keys()
            .map(|op| (op.clone(), self.max_retries_for(op)))
            .collect();
        max_retries.extend(self.max_retries.clone());
        StateSnapshot {
            current_stage: inner.current_stage,
            retry_counts: inner.retry_counts.clone(),
            max_retries,
            completed_stages: inner.completed_stages.clone(),
            results: inner.results.clone(),
            history: inner.history.to_vec(),
            history_trimmed: inner.history.trimmed(),
            transition_count: inner.transitions,
            started_at: self.started_at,
        }
    }
}
