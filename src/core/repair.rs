//! Repair-loop bookkeeping and prompt generation.
//!
//! The stage runner feeds every failed attempt into [`RepairState`]; when
//! two consecutive attempts share both the violation fingerprint and the
//! output hash, the model is making no progress and the runner escalates
//! (once) before giving up.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::artifact::Artifact;
use crate::core::types::{GateResult, Violation};

/// Fingerprint of one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptState {
    pub prompt_hash: String,
    pub output_hash: String,
    pub fingerprint: String,
}

/// Tracks failed attempts and the one-shot escalation decision.
#[derive(Debug, Clone, Default)]
pub struct RepairState {
    pub attempts: Vec<AttemptState>,
    pub escalated: bool,
}

impl RepairState {
    pub fn record(&mut self, attempt: AttemptState) {
        self.attempts.push(attempt);
    }

    /// True when the newest attempt repeats the previous one exactly
    /// (same violations, same output).
    pub fn looping(&self) -> bool {
        if self.attempts.len() < 2 {
            return false;
        }
        let current = &self.attempts[self.attempts.len() - 1];
        let previous = &self.attempts[self.attempts.len() - 2];
        current.fingerprint == previous.fingerprint && current.output_hash == previous.output_hash
    }
}

/// Hash the sorted set of violation triples plus any apply error.
///
/// Returns an empty string when there is nothing to fingerprint.
pub fn fingerprint_violations(violations: &[Violation], apply_error: Option<&str>) -> String {
    if violations.is_empty() && apply_error.is_none() {
        return String::new();
    }
    let mut normalized: Vec<String> = violations
        .iter()
        .map(|v| format!("{}|{}|{}", v.rule, v.message, v.location))
        .collect();
    normalized.sort();
    if let Some(err) = apply_error {
        normalized.push(format!("apply:{err}"));
    }
    hex::encode(Sha256::digest(normalized.join("\n").as_bytes()))
}

/// Build the standard repair prompt: previous output verbatim, numbered
/// violations, hints, and an instruction to return the corrected output.
pub fn repair_prompt(original: &Artifact, failure: &GateResult) -> String {
    let mut prompt = String::new();
    prompt.push_str("The following output failed quality checks:\n\n");
    prompt.push_str("---\n");
    prompt.push_str(&original.content);
    prompt.push_str("\n---\n\n");

    prompt.push_str("Issues found:\n");
    for (i, violation) in failure.violations.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. [{}] {}: {}\n",
            i + 1,
            violation.severity.as_str(),
            violation.rule,
            violation.message
        ));
        if !violation.suggestion.is_empty() {
            prompt.push_str(&format!("   Suggestion: {}\n", violation.suggestion));
        }
    }

    if !failure.repair_hints.is_empty() {
        prompt.push_str("\nRepair hints:\n");
        for hint in &failure.repair_hints {
            prompt.push_str(&format!("- {hint}\n"));
        }
    }

    prompt.push_str("\nPlease fix all issues and provide the corrected output.");
    prompt
}

/// Build the escalation prompt used after loop detection: the model must
/// not repeat its previous output, and apply stages must answer with a
/// unified diff.
pub fn escalation_prompt(original: &Artifact, failure: &GateResult, apply_stage: bool) -> String {
    let mut prompt = String::new();
    prompt.push_str("Your previous attempts repeated the same failing output.\n");
    prompt.push_str("Do NOT repeat the previous output; change the implementation approach.\n\n");
    prompt.push_str("Previous output:\n---\n");
    prompt.push_str(&original.content);
    prompt.push_str("\n---\n\n");

    prompt.push_str("Unresolved issues:\n");
    for violation in &failure.violations {
        prompt.push_str(&format!(
            "- [{}] {}: {}\n",
            violation.severity.as_str(),
            violation.rule,
            violation.message
        ));
    }

    if apply_stage {
        prompt.push_str(
            "\nRespond with a unified diff against the current workspace that resolves every issue.",
        );
    } else {
        prompt.push_str("\nRespond with a corrected output that resolves every issue.");
    }
    prompt
}
