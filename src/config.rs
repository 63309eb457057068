//! Run configuration for the flow control engine.
//!
//! Configuration is consumed when an engine is built and never mutated
//! during a run.
//!
//! # Example settings.json
//!
//! ```json
//! {
//!   "failureThreshold": 3,
//!   "recoveryTimeoutSecs": 60,
//!   "maxRetries": { "style": 2, "draft": 3 },
//!   "maxExecutions": { "draft": 5 },
//!   "maxTotalDurationSecs": 1800,
//!   "historyCap": 500
//! }
//! ```

pub mod validation;

pub use validation::{ConfigValidator, ValidationReport};

use crate::guard::LoopGuardConfig;
use crate::resilience::{BackoffPolicy, CircuitBreakerConfig};
use crate::stage::{OperationKind, StageId};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory (relative to the project) holding flowguard settings
pub const SETTINGS_DIR: &str = ".flowguard";

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Total duration preset for interactive runs (30 minutes)
pub const INTERACTIVE_MAX_DURATION_SECS: u64 = 30 * 60;

/// Total duration preset for batch runs (4 hours)
pub const BATCH_MAX_DURATION_SECS: u64 = 4 * 60 * 60;

/// Run configuration loaded from `.flowguard/settings.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    // ------------------------------------------------------------------
    // Circuit breaker
    // ------------------------------------------------------------------
    /// Consecutive failures before a breaker opens (default: 3).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open breaker waits before a half-open probe (default: 60).
    #[serde(default = "default_recovery_timeout_secs", alias = "recoveryTimeoutSeconds")]
    pub recovery_timeout_secs: u64,

    // ------------------------------------------------------------------
    // Retries
    // ------------------------------------------------------------------
    /// Per-operation retry budgets, keyed by operation name.
    #[serde(default)]
    pub max_retries: BTreeMap<String, u32>,

    /// Retry budget for operations not listed in `max_retries` (default: 2).
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Base backoff delay in milliseconds (default: 1000).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff cap in milliseconds (default: 30000).
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Jitter fraction applied to backoff delays (default: 0.2).
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    // ------------------------------------------------------------------
    // Loop prevention
    // ------------------------------------------------------------------
    /// Per-operation execution ceilings, keyed by operation name.
    #[serde(default)]
    pub max_executions: BTreeMap<String, u32>,

    /// Ceiling for draft-regeneration operations (default: 5).
    #[serde(default = "default_generation_max_executions")]
    pub generation_max_executions: u32,

    /// Ceiling for validation operations (default: 3).
    #[serde(default = "default_validation_max_executions")]
    pub validation_max_executions: u32,

    /// Ceiling for every other operation (default: 10).
    #[serde(default = "default_max_executions")]
    pub default_max_executions: u32,

    /// Wall-clock ceiling for a whole run in seconds (default: 1800).
    #[serde(default = "default_max_total_duration_secs", alias = "maxTotalDurationSeconds")]
    pub max_total_duration_secs: u64,

    /// Stage transitions kept for oscillation detection (default: 200).
    #[serde(default = "default_path_capacity")]
    pub path_capacity: usize,

    /// Back-to-back repeats of a stage block tolerated (default: 3).
    #[serde(default = "default_max_repeats")]
    pub max_repeats: u32,

    /// Longest stage block checked for repetition (default: 4).
    #[serde(default = "default_max_pattern_len")]
    pub max_pattern_len: usize,

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------
    /// Maximum history entries kept (default: 500).
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// Most recent entries never trimmed (default: 50).
    #[serde(default = "default_history_keep_recent")]
    pub history_keep_recent: usize,

    // ------------------------------------------------------------------
    // Blocking points
    // ------------------------------------------------------------------
    /// Time budget for one external stage call in seconds (default: 600).
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Time budget for a human-review decision in seconds (default: 300).
    #[serde(default = "default_review_timeout_secs")]
    pub review_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_retry_jitter() -> f64 {
    0.2
}

fn default_generation_max_executions() -> u32 {
    5
}

fn default_validation_max_executions() -> u32 {
    3
}

fn default_max_executions() -> u32 {
    10
}

fn default_max_total_duration_secs() -> u64 {
    INTERACTIVE_MAX_DURATION_SECS
}

fn default_path_capacity() -> usize {
    200
}

fn default_max_repeats() -> u32 {
    3
}

fn default_max_pattern_len() -> usize {
    4
}

fn default_history_cap() -> usize {
    500
}

fn default_history_keep_recent() -> usize {
    50
}

fn default_stage_timeout_secs() -> u64 {
    600
}

fn default_review_timeout_secs() -> u64 {
    300
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            max_retries: BTreeMap::new(),
            default_max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter: default_retry_jitter(),
            max_executions: BTreeMap::new(),
            generation_max_executions: default_generation_max_executions(),
            validation_max_executions: default_validation_max_executions(),
            default_max_executions: default_max_executions(),
            max_total_duration_secs: default_max_total_duration_secs(),
            path_capacity: default_path_capacity(),
            max_repeats: default_max_repeats(),
            max_pattern_len: default_max_pattern_len(),
            history_cap: default_history_cap(),
            history_keep_recent: default_history_keep_recent(),
            stage_timeout_secs: default_stage_timeout_secs(),
            review_timeout_secs: default_review_timeout_secs(),
        }
    }
}

impl FlowConfig {
    /// Preset for interactive use (minutes-scale wall-clock ceiling).
    #[must_use]
    pub fn interactive() -> Self {
        Self::default()
    }

    /// Preset for batch use (hours-scale wall-clock ceiling).
    #[must_use]
    pub fn batch() -> Self {
        Self {
            max_total_duration_secs: BATCH_MAX_DURATION_SECS,
            ..Self::default()
        }
    }

    /// Set the retry budget for one operation.
    #[must_use]
    pub fn with_max_retries(mut self, operation: impl Into<String>, max: u32) -> Self {
        self.max_retries.insert(operation.into(), max);
        self
    }

    /// Set the execution ceiling for one operation.
    #[must_use]
    pub fn with_max_executions(mut self, operation: impl Into<String>, max: u32) -> Self {
        self.max_executions.insert(operation.into(), max);
        self
    }

    /// Disable backoff waiting (useful for dry runs and tests).
    #[must_use]
    pub fn without_backoff(mut self) -> Self {
        self.retry_base_delay_ms = 0;
        self.retry_max_delay_ms = 0;
        self.retry_jitter = 0.0;
        self
    }

    /// Retry budget for an operation.
    #[must_use]
    pub fn max_retries_for(&self, operation: &str) -> u32 {
        self.max_retries
            .get(operation)
            .copied()
            .unwrap_or(self.default_max_retries)
    }

    /// Execution ceiling for an operation.
    ///
    /// Explicit entries win; otherwise the stage's [`OperationKind`] picks
    /// the default.
    #[must_use]
    pub fn max_executions_for(&self, operation: &str) -> u32 {
        if let Some(max) = self.max_executions.get(operation) {
            return *max;
        }
        let kind = StageId::ALL
            .iter()
            .find(|s| s.operation() == operation)
            .map(StageId::operation_kind)
            .unwrap_or(OperationKind::Generic);
        match kind {
            OperationKind::Generation => self.generation_max_executions,
            OperationKind::Validation => self.validation_max_executions,
            OperationKind::Generic => self.default_max_executions,
        }
    }

    /// Breaker settings derived from this configuration.
    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }

    /// Backoff settings derived from this configuration.
    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.retry_base_delay_ms),
            cap: Duration::from_millis(self.retry_max_delay_ms),
            jitter: self.retry_jitter,
        }
    }

    /// Loop guard settings derived from this configuration.
    #[must_use]
    pub fn loop_guard_config(&self) -> LoopGuardConfig {
        let max_executions = StageId::ALL
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| (s.operation().to_string(), self.max_executions_for(s.operation())))
            .chain(self.max_executions.clone())
            .collect();
        LoopGuardConfig {
            max_executions,
            default_max_executions: self.default_max_executions,
            path_capacity: self.path_capacity,
            max_repeats: self.max_repeats,
            max_pattern_len: self.max_pattern_len,
            max_total_duration: Duration::from_secs(self.max_total_duration_secs),
        }
    }

    /// Time budget for one stage call.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Time budget for a review decision.
    #[must_use]
    pub fn review_timeout(&self) -> Duration {
        Duration::from_secs(self.review_timeout_secs)
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Load configuration for a project directory.
    ///
    /// Looks for `<project>/.flowguard/settings.json`, then the user-level
    /// `flowguard/settings.json` in the platform config directory, and
    /// falls back to defaults.
    pub fn load(project_dir: &Path) -> anyhow::Result<Self> {
        let project_settings = Self::settings_path(project_dir);
        if project_settings.exists() {
            return Self::from_file(&project_settings);
        }

        if let Some(user_settings) = Self::user_settings_path() {
            if user_settings.exists() {
                return Self::from_file(&user_settings);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from an explicit JSON or TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let config = if is_toml {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config {}", path.display()))?
        };
        Ok(config)
    }

    /// Get the settings.json path for a project
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        project_dir.join(SETTINGS_DIR).join(SETTINGS_FILE)
    }

    /// Get the user-level settings path, if the platform has a config dir
    pub fn user_settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("flowguard").join(SETTINGS_FILE))
    }
}
