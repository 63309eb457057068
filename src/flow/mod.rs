//! Flow control: run state, stage memoization, run results and the engine.
//!
//! - [`state`] - lock-protected aggregate that is the single source of truth
//! - [`history`] - bounded event log
//! - [`stage_manager`] - idempotent completion and reset
//! - [`outcome`] - typed failure reasons and the run result
//! - [`engine`] - the state machine that drives a run

pub mod engine;
pub mod history;
pub mod outcome;
pub mod stage_manager;
pub mod state;

pub use engine::{FlowEngine, FlowEngineBuilder};
pub use history::{BoundedHistory, EventKind, HistoryEntry};
pub use outcome::{FailureReason, RunResult, RunSummary};
pub use stage_manager::{StageManager, StageStats};
pub use state::{FlowControlState, StateSnapshot};
