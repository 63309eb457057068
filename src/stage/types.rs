//! Request, stage input/output, cached result and review types.

use super::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Content Request
// ============================================================================

/// Where the content for a request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentOrigin {
    /// Written by the requester; research adds nothing
    Original,
    /// Needs supporting research before drafting
    #[default]
    Researched,
}

/// The content request a flow run works on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentRequest {
    /// Topic or working title
    pub topic: String,
    /// Origin of the content
    #[serde(default)]
    pub origin: ContentOrigin,
    /// Explicit request to skip the research stage
    #[serde(default)]
    pub skip_research: bool,
    /// Intended audience, if known up front
    #[serde(default)]
    pub audience: Option<String>,
    /// Free-form metadata passed through to stages
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ContentRequest {
    /// Create a request for content that needs research.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    /// Mark the content as self-authored.
    #[must_use]
    pub fn original(mut self) -> Self {
        self.origin = ContentOrigin::Original;
        self
    }

    /// Set the target audience.
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Check if the research stage should be skipped.
    #[must_use]
    pub fn wants_research(&self) -> bool {
        !self.skip_research && self.origin != ContentOrigin::Original
    }
}

// ============================================================================
// Stage I/O
// ============================================================================

/// Everything a stage operation receives.
///
/// Stages only see a snapshot: they return results, they never mutate flow
/// state directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    /// Stage being executed
    pub stage: StageId,
    /// 1-indexed attempt number for this stage entry
    pub attempt: u32,
    /// The original request
    pub request: ContentRequest,
    /// Cached results of stages completed so far
    pub upstream: BTreeMap<StageId, StageResult>,
    /// Latest reviewer feedback, if any
    pub feedback: Option<ReviewFeedback>,
}

impl StageInput {
    /// Payload of a completed upstream stage.
    #[must_use]
    pub fn upstream_payload(&self, stage: StageId) -> Option<&serde_json::Value> {
        self.upstream.get(&stage).map(|r| &r.payload)
    }
}

/// Data-driven branch signal returned by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum StageVerdict {
    /// Continue forward
    #[default]
    Pass,
    /// Content needs another draft
    Revise { reason: String },
    /// Hand the content to a human
    Escalate { reason: String },
}

impl fmt::Display for StageVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Revise { reason } => write!(f, "revise: {}", reason),
            Self::Escalate { reason } => write!(f, "escalate: {}", reason),
        }
    }
}

/// Successful output of a stage operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageOutput {
    /// Opaque stage payload
    pub payload: serde_json::Value,
    /// Branch signal
    #[serde(default)]
    pub verdict: StageVerdict,
}

impl StageOutput {
    /// A passing output with the given payload.
    pub fn pass(payload: serde_json::Value) -> Self {
        Self {
            payload,
            verdict: StageVerdict::Pass,
        }
    }

    /// An output asking for another draft.
    pub fn revise(reason: impl Into<String>) -> Self {
        Self {
            payload: serde_json::Value::Null,
            verdict: StageVerdict::Revise {
                reason: reason.into(),
            },
        }
    }

    /// An output asking for human escalation.
    pub fn escalate(reason: impl Into<String>) -> Self {
        Self {
            payload: serde_json::Value::Null,
            verdict: StageVerdict::Escalate {
                reason: reason.into(),
            },
        }
    }
}

/// Cached success payload of a completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage that produced the result
    pub stage: StageId,
    /// Opaque payload
    pub payload: serde_json::Value,
    /// Attempts it took (1 = first try)
    pub attempts: u32,
    /// When the stage was marked complete
    pub completed_at: DateTime<Utc>,
}

impl StageResult {
    /// Create a result stamped now.
    pub fn new(stage: StageId, payload: serde_json::Value, attempts: u32) -> Self {
        Self {
            stage,
            payload,
            attempts,
            completed_at: Utc::now(),
        }
    }
}

// ============================================================================
// Human Review
// ============================================================================

/// Reviewer decision kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Ship as is
    #[default]
    Approve,
    /// Small edits, folded into the style pass
    Minor,
    /// Rewrite the draft
    Major,
    /// Change direction: realign audience, then redraft
    Pivot,
}

impl ReviewDecision {
    /// Stage the engine moves to for this decision.
    ///
    /// # Example
    ///
    /// ```
    /// use flowguard::stage::{ReviewDecision, StageId};
    ///
    /// assert_eq!(ReviewDecision::Major.next_stage(), StageId::Draft);
    /// assert_eq!(ReviewDecision::Minor.next_stage(), StageId::StyleCheck);
    /// ```
    #[must_use]
    pub fn next_stage(&self) -> StageId {
        match self {
            Self::Approve | Self::Minor => StageId::StyleCheck,
            Self::Major => StageId::Draft,
            Self::Pivot => StageId::AlignAudience,
        }
    }

    /// Check if this decision sends the flow backward.
    #[must_use]
    pub fn is_redo(&self) -> bool {
        matches!(self, Self::Major | Self::Pivot)
    }
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
            Self::Pivot => write!(f, "pivot"),
        }
    }
}

/// A reviewer's decision plus optional notes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub decision: ReviewDecision,
    #[serde(default)]
    pub comments: Option<String>,
    /// True when no reviewer answered and the default was applied
    #[serde(default)]
    pub defaulted: bool,
}

impl ReviewFeedback {
    /// Feedback with a decision and no comments.
    pub fn new(decision: ReviewDecision) -> Self {
        Self {
            decision,
            comments: None,
            defaulted: false,
        }
    }

    /// "No feedback, continue".
    pub fn no_feedback() -> Self {
        Self {
            decision: ReviewDecision::Approve,
            comments: None,
            defaulted: true,
        }
    }

    /// Attach reviewer comments.
    #[must_use]
    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }
}
