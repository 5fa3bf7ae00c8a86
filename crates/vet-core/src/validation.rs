//! Validation for pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::config::{LicensePolicy, StageSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

impl Validate for LicensePolicy {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.allowed.is_empty() && !self.allow_unlicensed {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "license.allowed.empty",
                message: "allow list is empty; every package would be rejected".to_string(),
            });
        }

        for id in self.allowed.intersection(&self.denied) {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "license.allowed_and_denied",
                message: format!("license {id} is both allowed and denied"),
            });
        }

        if self.allowed.iter().any(|id| id.trim().is_empty()) {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "license.allowed.blank",
                message: "allow list contains a blank identifier".to_string(),
            });
        }

        issues
    }
}

impl Validate for StageSettings {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.sleep.is_zero() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "worker.sleep.zero",
                message: "sleep interval cannot be 0".to_string(),
            });
        }

        if self.max_per_cycle == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "worker.max_per_cycle.zero",
                message: "per-cycle cap must be greater than zero".to_string(),
            });
        }

        if self.max_per_cycle > 1000 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "worker.max_per_cycle.high",
                message: format!(
                    "per-cycle cap {} is very high; a single cycle may hold the store for a long time",
                    self.max_per_cycle
                ),
            });
        }

        issues
    }
}

/// True when any issue is an error.
pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}
