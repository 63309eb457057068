//! Flow engine - drives one content request from `Validate` to a terminal
//! stage.
//!
//! Every edge is an explicit branch in this file. A stage step is:
//!
//! 1. loop guard check for the stage's operation,
//! 2. breaker-wrapped, timeout-bounded external call,
//! 3. on failure, retry with backoff while budget remains, otherwise take
//!    the stage's error edge,
//! 4. on success, cache the result and transition.
//!
//! Redo edges (review `major`/`pivot`, style/quality `revise`) first make
//! sure the target can still run, then reset the target and everything
//! downstream of it.
//!
//! # Example
//!
//! ```rust,ignore
//! use flowguard::config::FlowConfig;
//! use flowguard::flow::FlowEngine;
//! use flowguard::stage::ContentRequest;
//!
//! let engine = FlowEngine::builder(FlowConfig::load(&project_dir)?)
//!     .all_stages(agent)
//!     .reviewer(reviewer)
//!     .build()?;
//!
//! let result = engine.run(ContentRequest::new("async rust")).await;
//! println!("{}", result.summary());
//! ```

use super::history::EventKind;
use super::outcome::{FailureReason, RunResult};
use super::stage_manager::StageManager;
use super::state::FlowControlState;
use crate::config::{ConfigValidator, FlowConfig};
use crate::error::{FlowError, Result, RetriesExhausted, StageError};
use crate::guard::{CancellationToken, LoopGuard};
use crate::resilience::{BreakerError, CircuitBreakerRegistry, RetryManager};
use crate::stage::{
    AutoApprove, ContentRequest, HumanReviewer, ReviewFeedback, StageId, StageInput,
    StageOperation, StageOutput, StageResult, StageTransitionTable, StageVerdict,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Builder for [`FlowEngine`].
pub struct FlowEngineBuilder {
    config: FlowConfig,
    stages: BTreeMap<StageId, Arc<dyn StageOperation>>,
    reviewer: Option<Arc<dyn HumanReviewer>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    cancel: Option<CancellationToken>,
}

impl FlowEngineBuilder {
    /// Register the operation for one stage.
    #[must_use]
    pub fn stage(mut self, stage: StageId, operation: Arc<dyn StageOperation>) -> Self {
        self.stages.insert(stage, operation);
        self
    }

    /// Register one operation for every agent stage.
    ///
    /// The operation can tell stages apart through [`StageInput::stage`].
    #[must_use]
    pub fn all_stages(mut self, operation: Arc<dyn StageOperation>) -> Self {
        for stage in StageId::AGENT_STAGES {
            self.stages.insert(stage, Arc::clone(&operation));
        }
        self
    }

    /// Set the human reviewer (defaults to auto-approve).
    #[must_use]
    pub fn reviewer(mut self, reviewer: Arc<dyn HumanReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Share a breaker registry across runs.
    ///
    /// Without one, every run gets a fresh registry.
    #[must_use]
    pub fn breakers(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(registry);
        self
    }

    /// Use an externally controlled cancellation token.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Validate the configuration and build the engine.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidConfig`] if the configuration has errors
    /// or an agent stage has no operation.
    pub fn build(self) -> Result<FlowEngine> {
        let report = ConfigValidator::new().validate(&self.config);
        if !report.is_valid() {
            return Err(FlowError::invalid_config(
                "config",
                report.errors.join("; "),
            ));
        }
        for warning in &report.warnings {
            warn!(warning = %warning, "Configuration warning");
        }

        let missing: Vec<String> = StageId::AGENT_STAGES
            .iter()
            .filter(|s| !self.stages.contains_key(s))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(FlowError::invalid_config(
                "stages",
                format!("no operation registered for {}", missing.join(", ")),
            ));
        }

        let reviewer = self.reviewer.unwrap_or_else(|| {
            debug!("No reviewer configured, approving every draft");
            Arc::new(AutoApprove)
        });

        Ok(FlowEngine {
            config: self.config,
            table: StageTransitionTable::standard(),
            stages: self.stages,
            reviewer,
            breakers: self.breakers,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

/// Orchestrates content runs.
///
/// An engine holds only immutable wiring; each [`FlowEngine::run`] owns its
/// own state and loop guard, so independent runs may execute concurrently.
pub struct FlowEngine {
    config: FlowConfig,
    table: StageTransitionTable,
    stages: BTreeMap<StageId, Arc<dyn StageOperation>>,
    reviewer: Arc<dyn HumanReviewer>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    cancel: CancellationToken,
}

impl FlowEngine {
    /// Start building an engine.
    #[must_use]
    pub fn builder(config: FlowConfig) -> FlowEngineBuilder {
        FlowEngineBuilder {
            config,
            stages: BTreeMap::new(),
            reviewer: None,
            breakers: None,
            cancel: None,
        }
    }

    /// Configuration consumed by every run.
    #[must_use]
    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Token that cancels every run of this engine.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shared breaker registry, if one was injected.
    #[must_use]
    pub fn shared_breakers(&self) -> Option<&Arc<CircuitBreakerRegistry>> {
        self.breakers.as_ref()
    }

    /// Drive one request to `Completed` or `Failed`.
    ///
    /// Never panics and never returns early: every failure is folded into
    /// the returned [`RunResult`].
    pub async fn run(&self, request: ContentRequest) -> RunResult {
        let run_id = Uuid::new_v4();
        let state = Arc::new(FlowControlState::with_table(
            &self.config,
            self.table.clone(),
            StageId::Validate,
        ));
        let breakers = self.breakers.clone().unwrap_or_else(|| {
            CircuitBreakerRegistry::shared(self.config.breaker_config())
        });

        let mut run = Run {
            engine: self,
            run_id,
            request,
            stages: StageManager::new(Arc::clone(&state)),
            retries: RetryManager::new(Arc::clone(&state), self.config.backoff_policy()),
            guard: LoopGuard::new(self.config.loop_guard_config(), self.cancel.clone()),
            breakers,
            feedback: None,
            state,
        };

        info!(%run_id, topic = %run.request.topic, "Run started");
        let reason = match run.drive().await {
            Ok(()) => None,
            Err(err) => {
                let stage = run.state.current_stage();
                let reason = FailureReason::from_error(stage, &err);
                run.state.fail(&reason.to_string());
                if err.is_cancelled() {
                    warn!(%run_id, %stage, "Run cancelled");
                } else {
                    error!(%run_id, %stage, reason = %reason, "Run failed");
                }
                Some(reason)
            }
        };

        let result = RunResult {
            run_id,
            topic: run.request.topic.clone(),
            final_stage: run.state.current_stage(),
            reason,
            state: run.state.snapshot(),
            guard: run.guard.snapshot(),
            breakers: run.breakers.snapshot(),
            finished_at: Utc::now(),
        };
        info!(
            %run_id,
            final_stage = %result.final_stage,
            transitions = result.transition_count(),
            retries = result.total_retries(),
            "Run finished"
        );
        result
    }
}

/// Per-run state and collaborators.
struct Run<'a> {
    engine: &'a FlowEngine,
    run_id: Uuid,
    request: ContentRequest,
    state: Arc<FlowControlState>,
    stages: StageManager,
    retries: RetryManager,
    guard: LoopGuard,
    breakers: Arc<CircuitBreakerRegistry>,
    feedback: Option<ReviewFeedback>,
}

impl Run<'_> {
    async fn drive(&mut self) -> Result<()> {
        while !self.state.is_terminal() {
            self.guard.check()?;
            let stage = self.state.current_stage();

            if stage != StageId::HumanReview && self.stages.is_completed(stage) {
                self.state
                    .record_event(stage, EventKind::Skipped, Some("result cached".into()));
                debug!(run_id = %self.run_id, %stage, "Stage already complete, skipping");
                let next = self.forward_edge(stage);
                self.advance(next)?;
                continue;
            }

            match stage {
                StageId::HumanReview => self.review().await?,
                _ => self.step(stage).await?,
            }
        }
        Ok(())
    }

    // =========================================================================
    // Agent stages
    // =========================================================================

    async fn step(&mut self, stage: StageId) -> Result<()> {
        match self.attempt(stage).await {
            Ok((output, attempts)) => self.on_output(stage, output, attempts),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => self.take_error_edge(stage, err),
        }
    }

    /// Call a stage until it succeeds, runs out of retries, or trips its
    /// breaker.
    async fn attempt(&mut self, stage: StageId) -> Result<(StageOutput, u32)> {
        let op = stage.operation();
        let timeout = self.engine.config.stage_timeout();
        let operation = self
            .engine
            .stages
            .get(&stage)
            .cloned()
            .ok_or_else(|| FlowError::stage(stage, StageError::Unavailable { stage }))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.guard.check_and_record(op)?;

            let input = self.input_for(stage, attempt);
            self.state.record_event(
                stage,
                EventKind::AttemptStarted,
                Some(format!("attempt {}", attempt)),
            );
            debug!(run_id = %self.run_id, %stage, attempt, "Invoking stage");

            let operation = Arc::clone(&operation);
            let outcome = self
                .breakers
                .execute(op, move || async move {
                    match tokio::time::timeout(timeout, operation.invoke(input)).await {
                        Ok(result) => result,
                        Err(_) => Err(StageError::timeout(timeout)),
                    }
                })
                .await;

            let (source, circuit_now_open) = match outcome {
                Ok(output) => {
                    self.state
                        .record_event(stage, EventKind::AttemptSucceeded, None);
                    return Ok((output, attempt));
                }
                Err(BreakerError::Open { operation }) => {
                    self.state.record_event(
                        stage,
                        EventKind::AttemptFailed,
                        Some("rejected: circuit open".into()),
                    );
                    warn!(run_id = %self.run_id, %stage, "Circuit open, call rejected");
                    return Err(FlowError::circuit_open(operation));
                }
                Err(BreakerError::Failed {
                    source,
                    circuit_now_open,
                }) => (source, circuit_now_open),
            };

            self.state.record_event(
                stage,
                EventKind::AttemptFailed,
                Some(source.to_string()),
            );

            if matches!(
                source,
                StageError::Rejected { .. } | StageError::Unavailable { .. }
            ) {
                return Err(FlowError::stage(stage, source));
            }

            if !self.retries.can_retry(op) {
                let exhausted = RetriesExhausted {
                    operation: op.to_string(),
                    attempts: self.state.retry_count(op),
                    max: self.state.max_retries_for(op),
                };
                warn!(run_id = %self.run_id, %stage, error = %source, "Retries exhausted");
                return Err(FlowError::RetriesExhausted {
                    stage,
                    exhausted,
                    last_error: source,
                });
            }

            if circuit_now_open {
                warn!(run_id = %self.run_id, %stage, error = %source, "Failure opened circuit");
                return Err(FlowError::circuit_open(op));
            }

            let delay = self.retries.next_delay(op);
            let retry = self.retries.record_attempt(op).map_err(|exhausted| {
                FlowError::RetriesExhausted {
                    stage,
                    exhausted,
                    last_error: source.clone(),
                }
            })?;
            warn!(
                run_id = %self.run_id,
                %stage,
                retry,
                delay_ms = delay.as_millis() as u64,
                error = %source,
                "Stage failed, retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Fold a successful stage output into state and pick the next edge.
    fn on_output(&mut self, stage: StageId, output: StageOutput, attempts: u32) -> Result<()> {
        let StageOutput { payload, verdict } = output;
        let payload = if payload.is_null() && verdict != StageVerdict::Pass {
            serde_json::to_value(&verdict)?
        } else {
            payload
        };
        self.stages
            .complete(stage, StageResult::new(stage, payload, attempts));
        debug!(run_id = %self.run_id, %stage, verdict = %verdict, "Stage returned");

        match (stage, verdict) {
            (_, StageVerdict::Pass) => {
                let next = self.forward_edge(stage);
                self.advance(next)
            }

            (StageId::Validate, StageVerdict::Revise { reason } | StageVerdict::Escalate { reason }) => {
                Err(FlowError::stage(stage, StageError::rejected(reason)))
            }

            (
                StageId::StyleCheck | StageId::QualityCheck,
                StageVerdict::Revise { reason },
            ) => {
                let op = stage.operation();
                if self.retries.can_retry(op) {
                    self.retries.record_attempt(op).map_err(|exhausted| {
                        FlowError::RetriesExhausted {
                            stage,
                            exhausted,
                            last_error: StageError::rejected(reason.clone()),
                        }
                    })?;
                    info!(run_id = %self.run_id, %stage, reason = %reason, "Revision requested, redoing draft");
                    self.redo(StageId::Draft)
                } else {
                    info!(run_id = %self.run_id, %stage, reason = %reason, "Revision budget spent, escalating");
                    self.advance(StageId::EscalateToHuman)
                }
            }

            (StageId::StyleCheck | StageId::QualityCheck, StageVerdict::Escalate { reason }) => {
                info!(run_id = %self.run_id, %stage, reason = %reason, "Escalating to human");
                self.advance(StageId::EscalateToHuman)
            }

            (_, StageVerdict::Revise { reason } | StageVerdict::Escalate { reason }) => {
                self.take_error_edge(stage, FlowError::stage(stage, StageError::rejected(reason)))
            }
        }
    }

    /// Follow a stage's error-handling edge, or fail the run if it has none.
    fn take_error_edge(&mut self, stage: StageId, err: FlowError) -> Result<()> {
        let edge = match stage {
            StageId::Research => Some(StageId::AlignAudience),
            StageId::StyleCheck | StageId::QualityCheck => Some(StageId::EscalateToHuman),
            StageId::EscalateToHuman => Some(StageId::Finalize),
            _ => None,
        };

        match edge {
            Some(to) => {
                warn!(run_id = %self.run_id, %stage, %to, error = %err, "Stage failed, taking error edge");
                self.advance(to)
            }
            None => Err(err),
        }
    }

    // =========================================================================
    // Human review
    // =========================================================================

    async fn review(&mut self) -> Result<()> {
        let stage = StageId::HumanReview;
        self.guard.check_and_record(stage.operation())?;

        let draft = self
            .state
            .result(StageId::Draft)
            .unwrap_or_else(|| StageResult::new(StageId::Draft, serde_json::Value::Null, 0));
        let timeout = self.engine.config.review_timeout();

        self.state
            .record_event(stage, EventKind::AttemptStarted, None);
        let feedback = match tokio::time::timeout(
            timeout,
            self.engine.reviewer.request_review(&draft, timeout),
        )
        .await
        {
            Ok(Ok(feedback)) => feedback,
            Ok(Err(err)) => {
                warn!(run_id = %self.run_id, error = %err, "Review failed, continuing without feedback");
                ReviewFeedback::no_feedback()
            }
            Err(_) => {
                warn!(
                    run_id = %self.run_id,
                    timeout_secs = timeout.as_secs(),
                    "Review timed out, continuing without feedback"
                );
                ReviewFeedback::no_feedback()
            }
        };
        self.state
            .record_event(stage, EventKind::AttemptSucceeded, None);

        let decision = feedback.decision;
        let detail = if feedback.defaulted {
            format!("{} (default)", decision)
        } else {
            decision.to_string()
        };
        self.state
            .record_event(stage, EventKind::Reviewed, Some(detail));
        info!(run_id = %self.run_id, decision = %decision, defaulted = feedback.defaulted, "Review decision");

        let payload = serde_json::to_value(&feedback)?;
        self.stages
            .complete(stage, StageResult::new(stage, payload, 1));
        self.feedback = Some(feedback);

        let next = decision.next_stage();
        if decision.is_redo() {
            self.redo(next)
        } else {
            self.advance(next)
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// The edge a stage takes when it passes.
    fn forward_edge(&self, stage: StageId) -> StageId {
        match stage {
            StageId::Validate if self.request.wants_research() => StageId::Research,
            StageId::Validate | StageId::Research => StageId::AlignAudience,
            StageId::AlignAudience => StageId::Draft,
            StageId::Draft => StageId::HumanReview,
            StageId::HumanReview => self
                .feedback
                .as_ref()
                .map_or(StageId::StyleCheck, |f| f.decision.next_stage()),
            StageId::StyleCheck => StageId::QualityCheck,
            StageId::QualityCheck | StageId::EscalateToHuman => StageId::Finalize,
            StageId::Finalize | StageId::Completed => StageId::Completed,
            StageId::Failed => StageId::Failed,
        }
    }

    /// Move backwards to `to`, consuming one unit of its execution ceiling.
    fn redo(&mut self, to: StageId) -> Result<()> {
        self.guard.ensure_capacity(to.operation())?;
        let reset = self.stages.reset_group(&to.downstream_of());
        debug!(run_id = %self.run_id, %to, reset = reset.len(), "Redo");
        self.advance(to)
    }

    fn advance(&mut self, to: StageId) -> Result<()> {
        let from = self.state.current_stage();
        self.guard.record_transition(from, to)?;
        self.state.transition(to)?;
        info!(run_id = %self.run_id, %from, %to, "Transition");
        Ok(())
    }

    fn input_for(&self, stage: StageId, attempt: u32) -> StageInput {
        StageInput {
            stage,
            attempt,
            request: self.request.clone(),
            upstream: self.state.results(),
            feedback: self.feedback.clone(),
        }
    }
}
