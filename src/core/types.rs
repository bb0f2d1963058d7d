//! Shared deterministic types for gate evaluation.
//!
//! These types define stable contracts between the gate layer, the stage
//! runner, and the evidence writer. They must not depend on I/O and must
//! serialize identically across runs.

use serde::{Deserialize, Serialize};

/// Severity of a gate violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// A specific quality issue reported by a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub suggestion: String,
}

impl Violation {
    pub fn error(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            severity: Severity::Error,
            message: message.into(),
            location: String::new(),
            suggestion: String::new(),
        }
    }
}

/// Outcome of one gate evaluation.
///
/// Score is a non-negative integer where lower is better. Command gates
/// use 0 for pass and 100 for fail; external-check gates pass through the
/// external tool's score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub score: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repair_hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,
}

impl GateResult {
    pub fn passing(score: u32) -> Self {
        Self {
            passed: true,
            score,
            kind: String::new(),
            violations: Vec::new(),
            repair_hints: Vec::new(),
            diagnostics: None,
        }
    }

    pub fn failing(score: u32, violations: Vec<Violation>, repair_hints: Vec<String>) -> Self {
        Self {
            passed: false,
            score,
            kind: String::new(),
            violations,
            repair_hints,
            diagnostics: None,
        }
    }
}
