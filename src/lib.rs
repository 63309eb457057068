//! Flowguard - loop-proof flow control for content pipelines
//!
//! Orchestrates slow, unreliable agent stages through a fixed state machine
//! with circuit breakers, bounded retries, and a loop guard that guarantees
//! every run terminates.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`stage`] - Stage identities, the transition table, stage I/O types
//! - [`flow`] - Run state, stage memoization, the engine and run results
//! - [`resilience`] - Circuit breakers and retry backoff
//! - [`guard`] - Execution ceilings, oscillation detection, wall clock, cancellation
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`scenario`] - Scripted runs for demos and tests
//! - [`testing`] - Mocks, fixtures and assertions
//!
//! # Example
//!
//! ```rust,ignore
//! use flowguard::{ContentRequest, FlowConfig, FlowEngine, MockReviewer, MockStage};
//! use std::sync::Arc;
//!
//! let engine = FlowEngine::builder(FlowConfig::default())
//!     .all_stages(Arc::new(MockStage::new()))
//!     .reviewer(Arc::new(MockReviewer::new()))
//!     .build()?;
//!
//! let result = engine.run(ContentRequest::new("borrow checker tips")).await;
//! assert!(result.is_completed());
//! ```

pub mod config;
pub mod error;
pub mod flow;
pub mod guard;
pub mod resilience;
pub mod scenario;
pub mod stage;
pub mod testing;

// Re-export commonly used types
pub use error::{FlowError, LoopGuardViolation, Result, StageError};

pub use config::{ConfigValidator, FlowConfig, ValidationReport};

pub use flow::{FailureReason, FlowControlState, FlowEngine, RunResult, StageManager};

pub use guard::{CancellationToken, LoopGuard};

pub use resilience::{CircuitBreakerRegistry, CircuitState, RetryManager};

pub use stage::{
    ContentRequest, HumanReviewer, ReviewDecision, StageId, StageOperation, StageTransitionTable,
};

// Re-export testing types for convenience
pub use testing::{MockReviewer, MockStage, StageBehavior};

// TestFixture is only available in test builds
#[cfg(test)]
pub use testing::TestFixture;
