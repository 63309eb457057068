//! Bounded, append-only run history.
//!
//! Entries are appended in the order the engine issues mutations. Once the
//! buffer grows past its cap the oldest entries are dropped; the most recent
//! `keep_recent` entries are never trimmed.

use crate::stage::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// What happened to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `current_stage` moved to this stage
    Transition,
    /// An external call for this stage started
    AttemptStarted,
    /// The external call returned successfully
    AttemptSucceeded,
    /// The external call failed or was rejected
    AttemptFailed,
    /// A retry was recorded against the stage's operation
    Retry,
    /// Stage result cached and marked complete
    Completed,
    /// Completion flag and cached result cleared
    Reset,
    /// Stage already complete; invocation skipped
    Skipped,
    /// A reviewer decision was applied
    Reviewed,
    /// Run aborted into `Failed`
    Aborted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Transition => "transition",
            EventKind::AttemptStarted => "attempt_started",
            EventKind::AttemptSucceeded => "attempt_succeeded",
            EventKind::AttemptFailed => "attempt_failed",
            EventKind::Retry => "retry",
            EventKind::Completed => "completed",
            EventKind::Reset => "reset",
            EventKind::Skipped => "skipped",
            EventKind::Reviewed => "reviewed",
            EventKind::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// One timestamped history record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Stage the event concerns
    pub stage: StageId,
    /// When the event was recorded
    pub at: DateTime<Utc>,
    /// Event kind
    pub kind: EventKind,
    /// Optional human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HistoryEntry {
    /// Create an entry stamped now.
    pub fn new(stage: StageId, kind: EventKind) -> Self {
        Self {
            stage,
            at: Utc::now(),
            kind,
            detail: None,
        }
    }

    /// Attach a detail string.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// History buffer with oldest-first trimming.
#[derive(Debug, Clone)]
pub struct BoundedHistory {
    entries: VecDeque<HistoryEntry>,
    cap: usize,
    keep_recent: usize,
    trimmed: u64,
}

impl BoundedHistory {
    /// Create a history that holds at most `cap` entries.
    ///
    /// `cap` is raised to `keep_recent` if smaller, so trimming can never
    /// touch the protected tail.
    #[must_use]
    pub fn new(cap: usize, keep_recent: usize) -> Self {
        let cap = cap.max(keep_recent).max(1);
        Self {
            entries: VecDeque::with_capacity(cap.min(1024)),
            cap,
            keep_recent,
            trimmed: 0,
        }
    }

    /// Append an entry, trimming from the oldest end if over the cap.
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.cap && self.entries.len() > self.keep_recent {
            self.entries.pop_front();
            self.trimmed += 1;
        }
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum retained entries.
    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Entries dropped by trimming so far.
    #[must_use]
    pub fn trimmed(&self) -> u64 {
        self.trimmed
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Most recent entry.
    #[must_use]
    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    /// Copy out all retained entries.
    #[must_use]
    pub fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}
