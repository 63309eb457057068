//! Stage identities, the static transition table, and stage I/O types.
//!
//! - [`StageId`] - closed set of pipeline stages
//! - [`transitions`] - table of allowed next stages
//! - [`types`] - request, input/output, result and review types
//! - [`operation`] - traits for external stage operations and the reviewer

pub mod operation;
pub mod transitions;
pub mod types;

pub use operation::{AutoApprove, HumanReviewer, StageOperation};
pub use transitions::StageTransitionTable;
pub use types::{
    ContentOrigin, ContentRequest, ReviewDecision, ReviewFeedback, StageInput, StageOutput,
    StageResult, StageVerdict,
};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Stage Identity
// ============================================================================

/// One named step of the content pipeline.
///
/// `Completed` and `Failed` are terminal; nothing leaves them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize,
)]
pub enum StageId {
    Validate,
    Research,
    AlignAudience,
    Draft,
    HumanReview,
    StyleCheck,
    QualityCheck,
    EscalateToHuman,
    Finalize,
    Completed,
    Failed,
}

/// Budget category used to pick a default execution ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Content (re)generation - redo edges land here
    Generation,
    /// Pass/fail checks over generated content
    Validation,
    /// Everything else
    Generic,
}

impl StageId {
    /// Every stage, in pipeline order.
    pub const ALL: [StageId; 11] = [
        StageId::Validate,
        StageId::Research,
        StageId::AlignAudience,
        StageId::Draft,
        StageId::HumanReview,
        StageId::StyleCheck,
        StageId::QualityCheck,
        StageId::EscalateToHuman,
        StageId::Finalize,
        StageId::Completed,
        StageId::Failed,
    ];

    /// Stages that invoke an external agent operation.
    pub const AGENT_STAGES: [StageId; 8] = [
        StageId::Validate,
        StageId::Research,
        StageId::AlignAudience,
        StageId::Draft,
        StageId::StyleCheck,
        StageId::QualityCheck,
        StageId::EscalateToHuman,
        StageId::Finalize,
    ];

    /// Operation name used for retry budgets, breakers and execution ceilings.
    ///
    /// # Example
    ///
    /// ```
    /// use flowguard::stage::StageId;
    ///
    /// assert_eq!(StageId::StyleCheck.operation(), "style");
    /// ```
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            StageId::Validate => "validate",
            StageId::Research => "research",
            StageId::AlignAudience => "audience",
            StageId::Draft => "draft",
            StageId::HumanReview => "review",
            StageId::StyleCheck => "style",
            StageId::QualityCheck => "quality",
            StageId::EscalateToHuman => "escalate",
            StageId::Finalize => "finalize",
            StageId::Completed => "completed",
            StageId::Failed => "failed",
        }
    }

    /// Budget category of this stage's operation.
    #[must_use]
    pub fn operation_kind(&self) -> OperationKind {
        match self {
            StageId::Draft => OperationKind::Generation,
            StageId::Validate | StageId::StyleCheck | StageId::QualityCheck => {
                OperationKind::Validation
            }
            _ => OperationKind::Generic,
        }
    }

    /// Check if this stage ends the run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageId::Completed | StageId::Failed)
    }

    /// Position in the pipeline; used to tell forward from backward edges.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            StageId::Validate => 0,
            StageId::Research => 1,
            StageId::AlignAudience => 2,
            StageId::Draft => 3,
            StageId::HumanReview => 4,
            StageId::StyleCheck => 5,
            StageId::QualityCheck => 6,
            StageId::EscalateToHuman => 7,
            StageId::Finalize => 8,
            StageId::Completed | StageId::Failed => 9,
        }
    }

    /// Check if moving from `self` to `to` revisits an earlier stage.
    #[must_use]
    pub fn is_backward_to(&self, to: StageId) -> bool {
        to.rank() < self.rank()
    }

    /// The stage plus every non-terminal stage after it.
    ///
    /// This is the set whose cached results become stale when the stage
    /// is redone.
    ///
    /// # Example
    ///
    /// ```
    /// use flowguard::stage::StageId;
    ///
    /// let stale = StageId::Draft.downstream_of();
    /// assert!(stale.contains(&StageId::Draft));
    /// assert!(stale.contains(&StageId::QualityCheck));
    /// assert!(!stale.contains(&StageId::AlignAudience));
    /// ```
    #[must_use]
    pub fn downstream_of(&self) -> Vec<StageId> {
        StageId::ALL
            .iter()
            .copied()
            .filter(|s| !s.is_terminal() && s.rank() >= self.rank())
            .collect()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageId::Validate => "Validate",
            StageId::Research => "Research",
            StageId::AlignAudience => "AlignAudience",
            StageId::Draft => "Draft",
            StageId::HumanReview => "HumanReview",
            StageId::StyleCheck => "StyleCheck",
            StageId::QualityCheck => "QualityCheck",
            StageId::EscalateToHuman => "EscalateToHuman",
            StageId::Finalize => "Finalize",
            StageId::Completed => "Completed",
            StageId::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}
