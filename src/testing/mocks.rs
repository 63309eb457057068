//! Mock implementations of the stage and reviewer traits.
//!
//! These mocks provide scripted, deterministic stand-ins for agent stages
//! and the human reviewer. They also back the CLI's scenario runs.

use crate::error::{ReviewError, StageError};
use crate::stage::{
    HumanReviewer, ReviewDecision, ReviewFeedback, StageId, StageInput, StageOperation,
    StageOutput, StageResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// What a scripted stage does on one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageBehavior {
    /// Succeed with a generated payload
    Pass,
    /// Succeed but ask for a revision
    Revise { reason: String },
    /// Succeed but ask for human escalation
    Escalate { reason: String },
    /// Fail with a retryable error
    #[serde(alias = "error")]
    Fail { message: String },
    /// Refuse the input (not retried)
    Reject { reason: String },
}

impl StageBehavior {
    /// Shorthand for a retryable failure.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
        }
    }

    /// Shorthand for a revision request.
    pub fn revise(reason: impl Into<String>) -> Self {
        Self::Revise {
            reason: reason.into(),
        }
    }

    /// Shorthand for an escalation request.
    pub fn escalate(reason: impl Into<String>) -> Self {
        Self::Escalate {
            reason: reason.into(),
        }
    }

    fn produce(&self, input: &StageInput) -> Result<StageOutput, StageError> {
        match self {
            Self::Pass => Ok(StageOutput::pass(json!({
                "stage": input.stage.operation(),
                "topic": input.request.topic,
                "attempt": input.attempt,
            }))),
            Self::Revise { reason } => Ok(StageOutput::revise(reason.clone())),
            Self::Escalate { reason } => Ok(StageOutput::escalate(reason.clone())),
            Self::Fail { message } => Err(StageError::failed(message.clone())),
            Self::Reject { reason } => Err(StageError::rejected(reason.clone())),
        }
    }
}

/// Pick the call's step; the last step repeats forever.
fn scripted<T: Clone>(script: &[T], call: u32) -> Option<T> {
    let index = usize::try_from(call.saturating_sub(1)).unwrap_or(usize::MAX);
    script.get(index).or_else(|| script.last()).cloned()
}

/// Scripted stand-in for every agent stage.
///
/// Stages without a script pass on every call.
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockStage::new()
///     .failing(StageId::Draft, 2)
///     .always(StageId::StyleCheck, StageBehavior::revise("tone"));
///
/// let engine = FlowEngine::builder(config).all_stages(Arc::new(stage)).build()?;
/// ```
#[derive(Debug, Default)]
pub struct MockStage {
    scripts: BTreeMap<StageId, Vec<StageBehavior>>,
    delays: BTreeMap<StageId, Duration>,
    calls: Mutex<BTreeMap<StageId, u32>>,
    call_count: AtomicU32,
}

impl MockStage {
    /// Create a mock where every stage passes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a stage's calls in order; the last step repeats.
    #[must_use]
    pub fn with_script(mut self, stage: StageId, script: Vec<StageBehavior>) -> Self {
        self.scripts.insert(stage, script);
        self
    }

    /// Make every call of a stage behave the same way.
    #[must_use]
    pub fn always(self, stage: StageId, behavior: StageBehavior) -> Self {
        self.with_script(stage, vec![behavior])
    }

    /// Fail a stage `times` times, then pass.
    #[must_use]
    pub fn failing(self, stage: StageId, times: usize) -> Self {
        let mut script = vec![StageBehavior::fail("scripted failure"); times];
        script.push(StageBehavior::Pass);
        self.with_script(stage, script)
    }

    /// Delay every call of a stage.
    #[must_use]
    pub fn with_delay(mut self, stage: StageId, delay: Duration) -> Self {
        self.delays.insert(stage, delay);
        self
    }

    /// Total calls across all stages.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Calls that reached one stage.
    pub fn calls_for(&self, stage: StageId) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stage)
            .copied()
            .unwrap_or(0)
    }

    fn next_call(&self, stage: StageId) -> u32 {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let count = calls.entry(stage).or_insert(0);
        *count += 1;
        *count
    }
}

#[async_trait]
impl StageOperation for MockStage {
    async fn invoke(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let call = self.next_call(input.stage);
        if let Some(delay) = self.delays.get(&input.stage) {
            tokio::time::sleep(*delay).await;
        }

        let behavior = self
            .scripts
            .get(&input.stage)
            .and_then(|script| scripted(script, call))
            .unwrap_or(StageBehavior::Pass);
        behavior.produce(&input)
    }
}

/// Scripted stand-in for the human reviewer.
///
/// # Example
///
/// ```rust,ignore
/// let reviewer = MockReviewer::new()
///     .with_decisions(vec![ReviewDecision::Major, ReviewDecision::Approve]);
/// ```
#[derive(Debug, Default)]
pub struct MockReviewer {
    decisions: Vec<ReviewDecision>,
    delay: Option<Duration>,
    error: Option<String>,
    call_count: AtomicU32,
}

impl MockReviewer {
    /// Create a reviewer that approves everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with one decision.
    #[must_use]
    pub fn always(decision: ReviewDecision) -> Self {
        Self::new().with_decisions(vec![decision])
    }

    /// Answer calls in order; the last decision repeats.
    #[must_use]
    pub fn with_decisions(mut self, decisions: Vec<ReviewDecision>) -> Self {
        self.decisions = decisions;
        self
    }

    /// Wait before answering (to exercise the review timeout).
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every request as unavailable.
    #[must_use]
    pub fn with_error(mut self, reason: &str) -> Self {
        self.error = Some(reason.to_string());
        self
    }

    /// Review requests received.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HumanReviewer for MockReviewer {
    async fn request_review(
        &self,
        _draft: &StageResult,
        _timeout: Duration,
    ) -> Result<ReviewFeedback, ReviewError> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.error {
            return Err(ReviewError::Unavailable {
                reason: reason.clone(),
            });
        }

        let decision = scripted(&self.decisions, call).unwrap_or_default();
        Ok(ReviewFeedback::new(decision).with_comments(format!("scripted review #{}", call)))
    }
}
