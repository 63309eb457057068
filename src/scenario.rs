//! Scripted run scenarios.
//!
//! A scenario file describes a content request plus how each stage and the
//! reviewer behave, so the engine can be exercised end to end without real
//! agents.
//!
//! ```json
//! {
//!   "request": { "topic": "ownership in practice", "origin": "original" },
//!   "stages": {
//!     "StyleCheck": { "script": [{ "outcome": "revise", "reason": "tone" }, { "outcome": "pass" }] },
//!     "Draft": { "delayMs": 20 }
//!   },
//!   "review": { "decisions": ["major", "approve"] }
//! }
//! ```

use crate::stage::{ContentRequest, ReviewDecision, StageId};
use crate::testing::{MockReviewer, MockStage, StageBehavior};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Behavior of one stage in a scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageScript {
    /// Outcomes per call; the last repeats. Empty means always pass.
    #[serde(default)]
    pub script: Vec<StageBehavior>,
    /// Delay added to every call.
    #[serde(default)]
    pub delay_ms: u64,
}

/// Behavior of the reviewer in a scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewScript {
    /// Decisions per review; the last repeats. Empty means always approve.
    #[serde(default)]
    pub decisions: Vec<ReviewDecision>,
    /// Delay before each answer.
    #[serde(default)]
    pub delay_ms: u64,
    /// Make every review fail with this reason.
    #[serde(default)]
    pub unavailable: Option<String>,
}

/// A scripted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub request: ContentRequest,
    #[serde(default)]
    pub stages: BTreeMap<StageId, StageScript>,
    #[serde(default)]
    pub review: ReviewScript,
}

impl Scenario {
    /// A scenario where every stage passes and the reviewer approves.
    #[must_use]
    pub fn happy_path(request: ContentRequest) -> Self {
        Self {
            request,
            stages: BTreeMap::new(),
            review: ReviewScript::default(),
        }
    }

    /// Parse a scenario from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid scenario.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Invalid scenario")
    }

    /// Load a scenario file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("In {}", path.display()))
    }

    /// Build the scripted stage operation.
    #[must_use]
    pub fn stage_mock(&self) -> MockStage {
        self.stages
            .iter()
            .fold(MockStage::new(), |mock, (stage, script)| {
                let mock = if script.script.is_empty() {
                    mock
                } else {
                    mock.with_script(*stage, script.script.clone())
                };
                if script.delay_ms > 0 {
                    mock.with_delay(*stage, Duration::from_millis(script.delay_ms))
                } else {
                    mock
                }
            })
    }

    /// Build the scripted reviewer.
    #[must_use]
    pub fn reviewer(&self) -> MockReviewer {
        let mut reviewer = MockReviewer::new().with_decisions(self.review.decisions.clone());
        if self.review.delay_ms > 0 {
            reviewer = reviewer.with_delay(Duration::from_millis(self.review.delay_ms));
        }
        if let Some(reason) = &self.review.unavailable {
            reviewer = reviewer.with_error(reason);
        }
        reviewer
    }
}
