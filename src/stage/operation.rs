//! Trait definitions for the engine's external collaborators.
//!
//! Stage operations and the human reviewer are opaque, slow, and unreliable.
//! Abstracting them behind these traits lets the engine be driven by real
//! agents in production and by scripted mocks in tests.

use crate::error::{ReviewError, StageError};
use super::{ReviewFeedback, StageInput, StageOutput, StageResult};
use async_trait::async_trait;
use std::time::Duration;

/// Abstraction for one external stage operation.
///
/// Implementations must complete or fail on their own; the engine also
/// bounds every call with the configured stage timeout.
///
/// # Example
///
/// ```rust,ignore
/// use flowguard::stage::StageOperation;
///
/// struct Drafter { client: AgentClient }
///
/// #[async_trait]
/// impl StageOperation for Drafter {
///     async fn invoke(&self, input: StageInput) -> Result<StageOutput, StageError> {
///         let text = self.client.draft(&input.request.topic).await?;
///         Ok(StageOutput::pass(json!({ "text": text })))
///     }
/// }
/// ```
#[async_trait]
pub trait StageOperation: Send + Sync {
    /// Run the stage once.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] when the stage fails. `Failed` and `Timeout`
    /// are retried; `Rejected` is not.
    async fn invoke(&self, input: StageInput) -> Result<StageOutput, StageError>;
}

/// Abstraction for the human-review decision channel.
#[async_trait]
pub trait HumanReviewer: Send + Sync {
    /// Ask for a decision on a draft, honoring `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a [`ReviewError`] if no decision is available. The engine
    /// treats any error as "no feedback, continue".
    async fn request_review(
        &self,
        draft: &StageResult,
        timeout: Duration,
    ) -> Result<ReviewFeedback, ReviewError>;
}

/// Reviewer that approves every draft immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl HumanReviewer for AutoApprove {
    async fn request_review(
        &self,
        _draft: &StageResult,
        _timeout: Duration,
    ) -> Result<ReviewFeedback, ReviewError> {
        Ok(ReviewFeedback::no_feedback())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{ReviewDecision, StageId};

    #[tokio::test]
    async fn test_auto_approve_defaults() {
        let draft = StageResult::new(StageId::Draft, serde_json::Value::Null, 1);
        let feedback = AutoApprove
            .request_review(&draft, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(feedback.decision, ReviewDecision::Approve);
        assert!(feedback.defaulted);
    }
}
