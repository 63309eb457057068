//! Testing infrastructure for flowguard.
//!
//! This module provides mocks, fixtures, and assertions for driving the
//! engine without real agents or reviewers.
//!
//! # Architecture
//!
//! The testing infrastructure is organized into:
//! - **Mocks**: Scripted stage and reviewer doubles
//! - **Fixtures**: Temporary project directories (test-only)
//! - **Assertions**: Run-result assertions with readable failure output
//!
//! # Example
//!
//! ```rust,ignore
//! use flowguard::testing::{assert_completed, MockReviewer, MockStage};
//!
//! let stage = MockStage::new().failing(StageId::Research, 1);
//! let reviewer = MockReviewer::always(ReviewDecision::Minor);
//!
//! let result = engine.run(request).await;
//! assert_completed(&result);
//! ```

pub mod assertions;
#[cfg(test)]
pub mod fixtures;
pub mod mocks;

// Re-export commonly used types
pub use assertions::*;
#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;
