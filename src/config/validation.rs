//! Configuration validation for flowguard.
//!
//! Checks a [`FlowConfig`] for values that would make the engine's
//! termination guarantees meaningless (zero thresholds, an empty pattern
//! window) or that silently pre-empt one another (retry budgets the
//! execution ceiling can never honor).
//!
//! # Example
//!
//! ```rust
//! use flowguard::config::{ConfigValidator, FlowConfig};
//!
//! let report = ConfigValidator::new().validate(&FlowConfig::default());
//! assert!(report.is_valid());
//! assert_eq!(report.exit_code(), 0);
//! ```

use super::FlowConfig;
use crate::stage::StageId;

/// Result of configuration validation.
///
/// Contains all errors and warnings found during validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Errors that prevent the configuration from being used.
    pub errors: Vec<String>,
    /// Warnings that don't prevent validity but indicate potential issues.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Create a new empty validation report.
    ///
    /// An empty report is considered valid.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the configuration is valid (no errors).
    ///
    /// Warnings do not affect validity.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns 0 if valid, 7 (configuration error) if invalid.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_valid() {
            0
        } else {
            7
        }
    }

    /// Generate a human-readable summary of the validation result.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.is_valid() {
            if self.warnings.is_empty() {
                "Configuration is valid.".to_string()
            } else {
                format!(
                    "Configuration is valid with {} warning(s).",
                    self.warnings.len()
                )
            }
        } else {
            format!(
                "Configuration is invalid with {} error(s).",
                self.errors.len()
            )
        }
    }

    /// Generate a verbose report listing every error and warning.
    #[must_use]
    pub fn verbose_report(&self) -> String {
        let mut lines = vec![
            "Configuration Validation Report".to_string(),
            "\u{2500}".repeat(50),
        ];

        if !self.errors.is_empty() {
            lines.push(String::new());
            lines.push(format!("Errors ({}):", self.errors.len()));
            for error in &self.errors {
                lines.push(format!("  \u{2717} {}", error));
            }
        }

        if !self.warnings.is_empty() {
            lines.push(String::new());
            lines.push(format!("Warnings ({}):", self.warnings.len()));
            for warning in &self.warnings {
                lines.push(format!("  \u{26a0} {}", warning));
            }
        }

        lines.push(String::new());
        lines.push(format!("Status: {}", self.summary()));

        lines.join("\n")
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Validates run configuration values.
#[derive(Debug, Clone, Default)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Create a new validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate a configuration and return a report.
    #[must_use]
    pub fn validate(&self, config: &FlowConfig) -> ValidationReport {
        let mut report = ValidationReport::new();

        if config.failure_threshold == 0 {
            report.error("failureThreshold must be at least 1");
        }
        if config.max_repeats == 0 {
            report.error("maxRepeats must be at least 1");
        }
        if config.max_pattern_len == 0 {
            report.error("maxPatternLen must be at least 1");
        }
        if config.path_capacity < config.max_pattern_len.saturating_mul(2) {
            report.error(format!(
                "pathCapacity ({}) must hold at least two copies of maxPatternLen ({})",
                config.path_capacity, config.max_pattern_len
            ));
        }
        if config.max_total_duration_secs == 0 {
            report.error("maxTotalDurationSecs must be greater than 0");
        }
        if config.history_cap == 0 {
            report.error("historyCap must be greater than 0");
        }
        if config.history_cap < config.history_keep_recent {
            report.error(format!(
                "historyCap ({}) must not be smaller than historyKeepRecent ({})",
                config.history_cap, config.history_keep_recent
            ));
        }
        if !(0.0..1.0).contains(&config.retry_jitter) {
            report.error(format!(
                "retryJitter ({}) must be in [0, 1)",
                config.retry_jitter
            ));
        }
        if config.retry_base_delay_ms > config.retry_max_delay_ms {
            report.warning(format!(
                "retryBaseDelayMs ({}) exceeds retryMaxDelayMs ({}); every delay will be capped",
                config.retry_base_delay_ms, config.retry_max_delay_ms
            ));
        }
        if config.stage_timeout_secs == 0 {
            report.error("stageTimeoutSecs must be greater than 0");
        }
        if config.review_timeout_secs == 0 {
            report.warning("reviewTimeoutSecs is 0; every review will use the default decision");
        }

        for (operation, max) in &config.max_executions {
            if *max == 0 {
                report.error(format!(
                    "maxExecutions.{} is 0; the operation could never run",
                    operation
                ));
            }
        }

        for stage in StageId::AGENT_STAGES {
            let op = stage.operation();
            let retries = config.max_retries_for(op);
            let ceiling = config.max_executions_for(op);
            if retries.saturating_add(1) > ceiling {
                report.warning(format!(
                    "'{}' allows {} retries but only {} executions; the execution ceiling will stop it first",
                    op, retries, ceiling
                ));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let report = ConfigValidator::new().validate(&FlowConfig::default());
        assert!(report.is_valid(), "{}", report.verbose_report());
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.summary(), "Configuration is valid.");
    }

    #[test]
    fn test_zero_threshold_is_error() {
        let config = FlowConfig {
            failure_threshold: 0,
            ..FlowConfig::default()
        };
        let report = ConfigValidator::new().validate(&config);
        assert!(!report.is_valid());
        assert_eq!(report.exit_code(), 7);
        assert!(report.errors[0].contains("failureThreshold"));
    }

    #[test]
    fn test_history_cap_below_keep_recent() {
        let config = FlowConfig {
            history_cap: 10,
            history_keep_recent: 50,
            ..FlowConfig::default()
        };
        let report = ConfigValidator::new().validate(&config);
        assert!(report.errors.iter().any(|e| e.contains("historyCap")));
    }

    #[test]
    fn test_jitter_out_of_range() {
        let config = FlowConfig {
            retry_jitter: 1.5,
            ..FlowConfig::default()
        };
        let report = ConfigValidator::new().validate(&config);
        assert!(report.errors.iter().any(|e| e.contains("retryJitter")));
    }

    #[test]
    fn test_retry_budget_preempted_by_ceiling_warns() {
        let config = FlowConfig::default().with_max_retries("style", 5);
        let report = ConfigValidator::new().validate(&config);
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("'style'")));
        assert!(report.summary().contains("warning"));
    }

    #[test]
    fn test_zero_execution_ceiling_is_error() {
        let config = FlowConfig::default().with_max_executions("draft", 0);
        let report = ConfigValidator::new().validate(&config);
        assert!(report.errors.iter().any(|e| e.contains("maxExecutions.draft")));
    }

    #[test]
    fn test_verbose_report_lists_errors() {
        let config = FlowConfig {
            max_pattern_len: 0,
            ..FlowConfig::default()
        };
        let report = ConfigValidator::new().validate(&config);
        let text = report.verbose_report();
        assert!(text.contains("Errors"));
        assert!(text.contains("maxPatternLen"));
        assert!(text.contains("Status: Configuration is invalid"));
    }
}
