//! Stage manager - idempotent completion, controlled reset, and analytics.
//!
//! The manager is a view over [`FlowControlState`]: it owns no counters or
//! caches of its own, so it can never drift from the state it reports on.

use super::history::{EventKind, HistoryEntry};
use super::state::FlowControlState;
use crate::stage::{StageId, StageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-stage attempt statistics derived from history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
}

impl StageStats {
    /// Fraction of finished attempts that succeeded (0.0 - 1.0).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let finished = self.successes + self.failures;
        if finished == 0 {
            0.0
        } else {
            f64::from(self.successes) / f64::from(finished)
        }
    }
}

/// Tracks stage completion and result memoization across re-entry.
#[derive(Debug, Clone)]
pub struct StageManager {
    state: Arc<FlowControlState>,
}

impl StageManager {
    /// Create a manager over a run's state.
    #[must_use]
    pub fn new(state: Arc<FlowControlState>) -> Self {
        Self { state }
    }

    /// Check if a stage has completed and its result is cached.
    #[must_use]
    pub fn is_completed(&self, stage: StageId) -> bool {
        self.state.is_completed(stage)
    }

    /// Mark a stage complete with its result.
    ///
    /// Completing an already-complete stage overwrites the result and
    /// re-stamps it; it is not an error.
    pub fn complete(&self, stage: StageId, mut result: StageResult) {
        result.stage = stage;
        result.completed_at = Utc::now();
        debug!(%stage, attempts = result.attempts, "Stage completed");
        self.state.mark_completed(stage, result);
    }

    /// Cached result of a completed stage.
    #[must_use]
    pub fn result(&self, stage: StageId) -> Option<StageResult> {
        self.state.result(stage)
    }

    /// Every cached result.
    #[must_use]
    pub fn results(&self) -> BTreeMap<StageId, StageResult> {
        self.state.results()
    }

    /// Clear a stage so it runs again on next entry.
    pub fn reset(&self, stage: StageId) -> bool {
        let was_completed = self.state.reset(stage);
        if was_completed {
            debug!(%stage, "Stage reset");
        }
        was_completed
    }

    /// Clear several stages at once.
    ///
    /// Resets are in-memory and cannot fail, so the group is all-or-nothing.
    pub fn reset_group(&self, stages: &[StageId]) -> Vec<StageId> {
        let reset = self.state.reset_group(stages);
        if !reset.is_empty() {
            debug!(stages = ?reset, "Stage group reset");
        }
        reset
    }

    // =========================================================================
    // Analytics (read-only)
    // =========================================================================

    /// Attempt counts per stage from the retained history.
    #[must_use]
    pub fn stats_per_stage(&self) -> BTreeMap<StageId, StageStats> {
        let mut stats: BTreeMap<StageId, StageStats> = BTreeMap::new();
        for entry in self.state.history() {
            if !matches!(
                entry.kind,
                EventKind::AttemptStarted | EventKind::AttemptSucceeded | EventKind::AttemptFailed
            ) {
                continue;
            }
            let slot = stats.entry(entry.stage).or_default();
            match entry.kind {
                EventKind::AttemptStarted => slot.attempts += 1,
                EventKind::AttemptSucceeded => slot.successes += 1,
                EventKind::AttemptFailed => slot.failures += 1,
                _ => {}
            }
        }
        stats
    }

    /// Success rate per stage (finished attempts only).
    #[must_use]
    pub fn success_rate_per_stage(&self) -> BTreeMap<StageId, f64> {
        self.stats_per_stage()
            .into_iter()
            .map(|(stage, stats)| (stage, stats.success_rate()))
            .collect()
    }

    /// Mean attempt duration per stage.
    ///
    /// Pairs each `AttemptStarted` with the next finishing event for the
    /// same stage; unpaired starts (trimmed or in flight) are ignored.
    #[must_use]
    pub fn average_duration_per_stage(&self) -> BTreeMap<StageId, Duration> {
        average_durations(&self.state.history())
    }
}

fn average_durations(history: &[HistoryEntry]) -> BTreeMap<StageId, Duration> {
    let mut open: BTreeMap<StageId, DateTime<Utc>> = BTreeMap::new();
    let mut totals: BTreeMap<StageId, (Duration, u32)> = BTreeMap::new();

    for entry in history {
        match entry.kind {
            EventKind::AttemptStarted => {
                open.insert(entry.stage, entry.at);
            }
            EventKind::AttemptSucceeded | EventKind::AttemptFailed => {
                if let Some(started) = open.remove(&entry.stage) {
                    let elapsed = (entry.at - started).to_std().unwrap_or(Duration::ZERO);
                    let total = totals.entry(entry.stage).or_insert((Duration::ZERO, 0));
                    total.0 += elapsed;
                    total.1 += 1;
                }
            }
            _ => {}
        }
    }

    totals
        .into_iter()
        .map(|(stage, (total, count))| (stage, total / count))
        .collect()
}
