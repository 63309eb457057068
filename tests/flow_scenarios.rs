//! End-to-end flow scenarios driven through scripted stages and reviewers.

use flowguard::error::StageError;
use flowguard::flow::{EventKind, FailureReason, FlowControlState, StageManager};
use flowguard::resilience::CircuitState;
use flowguard::stage::{ContentRequest, ReviewDecision, StageId, StageResult};
use flowguard::testing::{
    assert_completed, assert_executions, assert_failed_with, assert_not_visited,
    assert_retry_count, assert_transition_count, assert_visited,
};
use flowguard::{
    CancellationToken, CircuitBreakerRegistry, FlowConfig, FlowEngine, MockReviewer, MockStage,
    StageBehavior,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn config() -> FlowConfig {
    FlowConfig::default().without_backoff()
}

fn engine(config: FlowConfig, stage: &Arc<MockStage>, reviewer: &Arc<MockReviewer>) -> FlowEngine {
    FlowEngine::builder(config)
        .all_stages(stage.clone())
        .reviewer(reviewer.clone())
        .build()
        .unwrap()
}

fn original(topic: &str) -> ContentRequest {
    ContentRequest::new(topic).original()
}

// =============================================================================
// Happy paths
// =============================================================================

#[tokio::test]
async fn test_original_content_happy_path() {
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(config(), &stage, &reviewer)
        .run(original("lifetimes"))
        .await;

    assert_completed(&result);
    assert_transition_count(&result, 7);
    assert_eq!(result.total_retries(), 0);
    assert_eq!(result.circuit_openings(), 0);
    assert_not_visited(&result, StageId::Research);
    assert_not_visited(&result, StageId::EscalateToHuman);
    assert_eq!(reviewer.call_count(), 1);
    assert_eq!(stage.calls_for(StageId::Draft), 1);
}

#[tokio::test]
async fn test_researched_content_visits_research() {
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(MockReviewer::always(ReviewDecision::Minor));

    let result = engine(config(), &stage, &reviewer)
        .run(ContentRequest::new("tokio internals"))
        .await;

    assert_completed(&result);
    assert_transition_count(&result, 8);
    assert_visited(&result, StageId::Research);
    assert!(result.results().contains_key(&StageId::Research));
}

#[tokio::test]
async fn test_explicit_skip_research() {
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(MockReviewer::new());
    let mut request = ContentRequest::new("macros");
    request.skip_research = true;

    let result = engine(config(), &stage, &reviewer).run(request).await;

    assert_completed(&result);
    assert_eq!(stage.calls_for(StageId::Research), 0);
}

#[tokio::test]
async fn test_draft_sees_upstream_results() {
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(config(), &stage, &reviewer)
        .run(original("traits"))
        .await;

    assert_completed(&result);
    let audience = &result.results()[&StageId::AlignAudience];
    assert_eq!(audience.payload["stage"], json!("audience"));
    assert_eq!(audience.payload["topic"], json!("traits"));
}

// =============================================================================
// Retry ceiling
// =============================================================================

#[tokio::test]
async fn test_retry_ceiling_then_retries_exhausted() {
    let mut cfg = config().with_max_retries("draft", 3);
    cfg.failure_threshold = 10;
    let stage = Arc::new(MockStage::new().always(StageId::Draft, StageBehavior::fail("503")));
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(cfg, &stage, &reviewer).run(original("x")).await;

    assert_failed_with(&result, "RetriesExhausted");
    assert_eq!(stage.calls_for(StageId::Draft), 4);
    assert_retry_count(&result, "draft", 3);
    match result.reason.as_ref().unwrap() {
        FailureReason::RetriesExhausted {
            stage,
            attempts,
            max,
            ..
        } => {
            assert_eq!(*stage, StageId::Draft);
            assert_eq!(*attempts, 3);
            assert_eq!(*max, 3);
        }
        other => panic!("unexpected reason {other:?}"),
    }
    assert_eq!(result.exit_code(), 1);
}

#[tokio::test]
async fn test_stage_timeout_counts_as_failure() {
    let mut cfg = config();
    cfg.stage_timeout_secs = 1;
    let stage = Arc::new(MockStage::new().with_delay(StageId::Draft, Duration::from_millis(1300)));
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(cfg, &stage, &reviewer).run(original("slow")).await;

    assert_failed_with(&result, "RetriesExhausted");
    assert_eq!(stage.calls_for(StageId::Draft), 3);
    assert_eq!(reviewer.call_count(), 0);
    match result.reason.as_ref().unwrap() {
        FailureReason::RetriesExhausted {
            stage, last_error, ..
        } => {
            assert_eq!(*stage, StageId::Draft);
            assert!(matches!(last_error, StageError::Timeout { timeout_ms: 1000 }));
            assert!(last_error.to_string().contains("timed out"));
        }
        other => panic!("unexpected reason {other:?}"),
    }
}

#[tokio::test]
async fn test_total_duration_ceiling_stops_run() {
    let mut cfg = config();
    cfg.max_total_duration_secs = 1;
    let stage = Arc::new(MockStage::new().with_delay(StageId::Draft, Duration::from_millis(1200)));
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(cfg, &stage, &reviewer).run(original("long")).await;

    assert_failed_with(&result, "TotalTimeoutExceeded");
    assert_eq!(result.exit_code(), 3);
    assert_eq!(stage.calls_for(StageId::Draft), 1);
    assert_eq!(stage.calls_for(StageId::Finalize), 0);
    match result.reason.as_ref().unwrap() {
        FailureReason::TotalTimeoutExceeded {
            elapsed_ms,
            limit_ms,
        } => {
            assert_eq!(*limit_ms, 1000);
            assert!(*elapsed_ms > 1000);
        }
        other => panic!("unexpected reason {other:?}"),
    }
}

#[tokio::test]
async fn test_transient_failure_recovers() {
    let stage = Arc::new(MockStage::new().failing(StageId::Draft, 1));
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(config(), &stage, &reviewer)
        .run(original("x"))
        .await;

    assert_completed(&result);
    assert_retry_count(&result, "draft", 1);
    assert_eq!(result.results()[&StageId::Draft].attempts, 2);
    let failed = result
        .history()
        .iter()
        .filter(|e| e.stage == StageId::Draft && e.kind == EventKind::AttemptFailed)
        .count();
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn test_validate_rejection_is_not_retried() {
    let stage = Arc::new(MockStage::new().always(
        StageId::Validate,
        StageBehavior::Reject {
            reason: "empty brief".into(),
        },
    ));
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(config(), &stage, &reviewer)
        .run(original("x"))
        .await;

    assert_failed_with(&result, "Stage");
    assert_eq!(stage.calls_for(StageId::Validate), 1);
    assert_eq!(result.total_retries(), 0);
}

#[tokio::test]
async fn test_validate_revise_verdict_fails_run() {
    let stage = Arc::new(
        MockStage::new().always(StageId::Validate, StageBehavior::revise("missing outline")),
    );
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(config(), &stage, &reviewer)
        .run(original("x"))
        .await;

    assert_failed_with(&result, "Stage");
    assert_eq!(stage.calls_for(StageId::AlignAudience), 0);
}

// =============================================================================
// Circuit breaking
// =============================================================================

#[tokio::test]
async fn test_breaker_trip_fails_run_with_circuit_open() {
    let mut cfg = config().with_max_retries("draft", 5);
    cfg.failure_threshold = 2;
    let stage = Arc::new(MockStage::new().always(StageId::Draft, StageBehavior::fail("down")));
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(cfg, &stage, &reviewer).run(original("x")).await;

    assert_failed_with(&result, "CircuitOpen");
    assert_eq!(stage.calls_for(StageId::Draft), 2);
    assert_eq!(result.circuit_openings(), 1);
    assert_eq!(result.breakers["draft"].state, CircuitState::Open);
    assert_eq!(result.exit_code(), 2);
}

#[tokio::test]
async fn test_research_failure_degrades_to_align_audience() {
    let stage = Arc::new(MockStage::new().always(StageId::Research, StageBehavior::fail("no sources")));
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(config(), &stage, &reviewer)
        .run(ContentRequest::new("obscure topic"))
        .await;

    assert_completed(&result);
    assert_eq!(stage.calls_for(StageId::Research), 3);
    assert_retry_count(&result, "research", 2);
    assert!(!result.results().contains_key(&StageId::Research));
    assert_eq!(result.circuit_openings(), 1);
    assert_transition_count(&result, 8);
}

#[tokio::test]
async fn test_shared_registry_blocks_other_runs() {
    let registry = CircuitBreakerRegistry::shared(flowguard::resilience::CircuitBreakerConfig {
        failure_threshold: 2,
        recovery_timeout: Duration::from_secs(60),
    });
    let broken = Arc::new(MockStage::new().always(StageId::Draft, StageBehavior::fail("down")));
    let healthy = Arc::new(MockStage::new());

    let first = FlowEngine::builder(config().with_max_retries("draft", 5))
        .all_stages(broken.clone())
        .breakers(Arc::clone(&registry))
        .build()
        .unwrap();
    let second = FlowEngine::builder(config())
        .all_stages(healthy.clone())
        .breakers(Arc::clone(&registry))
        .build()
        .unwrap();

    let result = first.run(original("a")).await;
    assert_failed_with(&result, "CircuitOpen");
    assert_eq!(registry.state("draft"), CircuitState::Open);

    let result = second.run(original("b")).await;
    assert_failed_with(&result, "CircuitOpen");
    assert_eq!(healthy.calls_for(StageId::Draft), 0);
    assert!(registry.rejected_count("draft") >= 1);
}

#[tokio::test]
async fn test_concurrent_runs_share_engine() {
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(MockReviewer::new());
    let engine = engine(config(), &stage, &reviewer);

    let runs = (0..4).map(|i| engine.run(original(&format!("post {i}"))));
    let results = futures::future::join_all(runs).await;

    assert_eq!(results.len(), 4);
    for result in &results {
        assert_completed(result);
        assert_transition_count(result, 7);
    }
    assert_eq!(stage.calls_for(StageId::Finalize), 4);
}

// =============================================================================
// Style / quality revisions and escalation
// =============================================================================

#[tokio::test]
async fn test_style_revisions_then_escalate() {
    let stage = Arc::new(MockStage::new().always(StageId::StyleCheck, StageBehavior::revise("tone")));
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(config().with_max_retries("style", 2), &stage, &reviewer)
        .run(original("x"))
        .await;

    assert_completed(&result);
    assert_executions(&result, "style", 3);
    assert_executions(&result, "draft", 3);
    assert_retry_count(&result, "style", 2);
    assert_visited(&result, StageId::EscalateToHuman);
    assert_not_visited(&result, StageId::QualityCheck);
    assert_transition_count(&result, 13);
}

#[tokio::test]
async fn test_quality_escalation_goes_to_human() {
    let stage = Arc::new(
        MockStage::new().always(StageId::QualityCheck, StageBehavior::escalate("legal review")),
    );
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(config(), &stage, &reviewer)
        .run(original("x"))
        .await;

    assert_completed(&result);
    assert_visited(&result, StageId::EscalateToHuman);
    assert_eq!(result.total_retries(), 0);
}

#[tokio::test]
async fn test_escalation_failure_still_finalizes() {
    let stage = Arc::new(
        MockStage::new()
            .always(StageId::StyleCheck, StageBehavior::escalate("unsure"))
            .always(StageId::EscalateToHuman, StageBehavior::fail("pager down")),
    );
    let reviewer = Arc::new(MockReviewer::new());

    let result = engine(config(), &stage, &reviewer)
        .run(original("x"))
        .await;

    assert_completed(&result);
    assert_eq!(stage.calls_for(StageId::EscalateToHuman), 3);
    assert_eq!(stage.calls_for(StageId::Finalize), 1);
}

// =============================================================================
// Human review
// =============================================================================

#[tokio::test]
async fn test_major_then_approve_redoes_draft() {
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(
        MockReviewer::new().with_decisions(vec![ReviewDecision::Major, ReviewDecision::Approve]),
    );

    let result = engine(config(), &stage, &reviewer)
        .run(original("x"))
        .await;

    assert_completed(&result);
    assert_executions(&result, "draft", 2);
    assert_executions(&result, "review", 2);
    assert_eq!(stage.calls_for(StageId::AlignAudience), 1);
    assert_transition_count(&result, 9);
}

#[tokio::test]
async fn test_pivot_keeps_research_cached() {
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(
        MockReviewer::new().with_decisions(vec![ReviewDecision::Pivot, ReviewDecision::Approve]),
    );

    let result = engine(config(), &stage, &reviewer)
        .run(ContentRequest::new("x"))
        .await;

    assert_completed(&result);
    assert_eq!(stage.calls_for(StageId::Research), 1);
    assert_eq!(stage.calls_for(StageId::AlignAudience), 2);
    assert_eq!(stage.calls_for(StageId::Draft), 2);
    assert_transition_count(&result, 11);
}

#[tokio::test]
async fn test_review_timeout_uses_default_decision() {
    let mut cfg = config();
    cfg.review_timeout_secs = 0;
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(
        MockReviewer::always(ReviewDecision::Major).with_delay(Duration::from_millis(200)),
    );

    let result = engine(cfg, &stage, &reviewer).run(original("x")).await;

    assert_completed(&result);
    assert_executions(&result, "review", 1);
    let reviewed = result
        .history()
        .iter()
        .find(|e| e.kind == EventKind::Reviewed)
        .unwrap();
    assert_eq!(reviewed.detail.as_deref(), Some("approve (default)"));
}

#[tokio::test]
async fn test_reviewer_error_uses_default_decision() {
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(MockReviewer::always(ReviewDecision::Pivot).with_error("offline"));

    let result = engine(config(), &stage, &reviewer)
        .run(original("x"))
        .await;

    assert_completed(&result);
    assert_eq!(stage.calls_for(StageId::AlignAudience), 1);
    let feedback = &result.results()[&StageId::HumanReview].payload;
    assert_eq!(feedback["decision"], json!("approve"));
}

// =============================================================================
// Loop prevention
// =============================================================================

#[tokio::test]
async fn test_review_oscillation_hits_draft_ceiling() {
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(MockReviewer::always(ReviewDecision::Major));

    let result = engine(config(), &stage, &reviewer)
        .run(original("x"))
        .await;

    assert_failed_with(&result, "MaxExecutionLimitExceeded");
    assert_eq!(stage.calls_for(StageId::Draft), 5);
    assert_eq!(reviewer.call_count(), 5);
    assert_eq!(result.exit_code(), 3);
    match result.reason.as_ref().unwrap() {
        FailureReason::MaxExecutionLimitExceeded {
            operation,
            count,
            limit,
        } => {
            assert_eq!(operation, "draft");
            assert_eq!(*count, 6);
            assert_eq!(*limit, 5);
        }
        other => panic!("unexpected reason {other:?}"),
    }
}

#[tokio::test]
async fn test_review_oscillation_detected_as_cycle() {
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(MockReviewer::always(ReviewDecision::Major));
    let mut cfg = config().with_max_executions("draft", 100);
    cfg.default_max_executions = 100;

    let result = engine(cfg, &stage, &reviewer).run(original("x")).await;

    assert_failed_with(&result, "CyclicPatternDetected");
    assert_eq!(stage.calls_for(StageId::Draft), 5);
    match result.reason.as_ref().unwrap() {
        FailureReason::CyclicPatternDetected {
            pattern, repeats, ..
        } => {
            assert_eq!(pattern.len(), 2);
            assert!(pattern.contains(&StageId::Draft));
            assert!(pattern.contains(&StageId::HumanReview));
            assert_eq!(*repeats, 4);
        }
        other => panic!("unexpected reason {other:?}"),
    }
}

#[tokio::test]
async fn test_alternating_major_pivot_stopped_by_draft_ceiling() {
    let stage = Arc::new(MockStage::new());
    let decisions = [ReviewDecision::Major, ReviewDecision::Pivot]
        .into_iter()
        .cycle()
        .take(10)
        .collect();
    let reviewer = Arc::new(MockReviewer::new().with_decisions(decisions));

    let result = engine(config(), &stage, &reviewer)
        .run(original("x"))
        .await;

    // The repeating block is longer than maxPatternLen, so only the
    // execution ceiling can stop it.
    assert_failed_with(&result, "MaxExecutionLimitExceeded");
    assert_eq!(stage.calls_for(StageId::Draft), 5);
    assert_eq!(stage.calls_for(StageId::AlignAudience), 3);
    assert_eq!(reviewer.call_count(), 5);
    match result.reason.as_ref().unwrap() {
        FailureReason::MaxExecutionLimitExceeded {
            operation, limit, ..
        } => {
            assert_eq!(operation, "draft");
            assert_eq!(*limit, 5);
        }
        other => panic!("unexpected reason {other:?}"),
    }
}

#[tokio::test]
async fn test_every_oscillating_config_terminates() {
    let configs = vec![
        config(),
        config().with_max_executions("draft", 2),
        config().with_max_executions("audience", 3),
        {
            let mut cfg = config();
            cfg.max_repeats = 1;
            cfg
        },
        {
            let mut cfg = config();
            cfg.generation_max_executions = 50;
            cfg.default_max_executions = 50;
            cfg
        },
    ];

    for decision in [ReviewDecision::Major, ReviewDecision::Pivot] {
        for cfg in &configs {
            let stage = Arc::new(MockStage::new());
            let reviewer = Arc::new(MockReviewer::always(decision));
            let result = engine(cfg.clone(), &stage, &reviewer)
                .run(ContentRequest::new("loop"))
                .await;

            assert_eq!(result.final_stage, StageId::Failed);
            let reason = result.reason.as_ref().unwrap();
            assert!(reason.is_guard_violation(), "{decision}: {reason}");
            for agent in StageId::AGENT_STAGES {
                let calls = stage.calls_for(agent);
                assert!(
                    calls <= cfg.max_executions_for(agent.operation()),
                    "{agent} ran {calls} times"
                );
            }
            assert!(reviewer.call_count() <= cfg.max_executions_for("review"));
        }
    }
}

#[tokio::test]
async fn test_history_stays_bounded() {
    let mut cfg = config();
    cfg.history_cap = 20;
    cfg.history_keep_recent = 5;
    let stage = Arc::new(MockStage::new());
    let reviewer = Arc::new(MockReviewer::always(ReviewDecision::Major));

    let result = engine(cfg, &stage, &reviewer).run(original("x")).await;

    assert_eq!(result.final_stage, StageId::Failed);
    assert_eq!(result.history().len(), 20);
    assert!(result.state.history_trimmed > 0);
    assert!(result.transition_count() > 10);
    let last = result.history().last().unwrap();
    assert_eq!(last.stage, StageId::Failed);
    assert_eq!(last.kind, EventKind::Transition);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let token = CancellationToken::new();
    token.cancel();
    let stage = Arc::new(MockStage::new());
    let engine = FlowEngine::builder(config())
        .all_stages(stage.clone())
        .cancellation(token)
        .build()
        .unwrap();

    let result = engine.run(original("x")).await;

    assert_failed_with(&result, "Cancelled");
    assert_eq!(stage.call_count(), 0);
    assert_eq!(result.exit_code(), 4);
}

#[tokio::test]
async fn test_cancel_during_run() {
    let stage = Arc::new(MockStage::new().with_delay(StageId::Draft, Duration::from_millis(100)));
    let engine = FlowEngine::builder(config())
        .all_stages(stage.clone())
        .build()
        .unwrap();
    let token = engine.cancellation_token();

    let canceller = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(engine.run(original("x")), canceller);

    assert_failed_with(&result, "Cancelled");
    assert_eq!(stage.calls_for(StageId::Finalize), 0);
}

// =============================================================================
// Idempotent completion
// =============================================================================

#[test]
fn test_completion_is_idempotent() {
    let state = Arc::new(FlowControlState::new(&FlowConfig::default()));
    let stages = StageManager::new(Arc::clone(&state));

    stages.complete(
        StageId::Draft,
        StageResult::new(StageId::Draft, json!({"v": 1}), 1),
    );
    stages.complete(
        StageId::Draft,
        StageResult::new(StageId::Draft, json!({"v": 2}), 1),
    );

    assert!(stages.is_completed(StageId::Draft));
    assert_eq!(stages.results().len(), 1);
    assert_eq!(stages.result(StageId::Draft).unwrap().payload, json!({"v": 2}));

    let reset = stages.reset_group(&StageId::Draft.downstream_of());
    assert_eq!(reset, vec![StageId::Draft]);
    assert!(!stages.is_completed(StageId::Draft));
    assert!(stages.reset_group(&StageId::Draft.downstream_of()).is_empty());
}

#[test]
fn test_missing_stage_rejected_at_build() {
    let result = FlowEngine::builder(FlowConfig::default())
        .stage(StageId::Validate, Arc::new(MockStage::new()))
        .build();
    assert!(result.is_err());
}

#[test]
fn test_invalid_config_rejected_at_build() {
    let mut cfg = FlowConfig::default();
    cfg.failure_threshold = 0;
    let result = FlowEngine::builder(cfg)
        .all_stages(Arc::new(MockStage::new()))
        .build();
    assert!(result.is_err());
}
