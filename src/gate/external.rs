//! External-check gates wrapping the `hollowcheck` CLI contract.
//!
//! The artifact content is written to a fresh temp directory (file blocks
//! when markers are present, otherwise a single `artifact.<ext>` file),
//! then `<binary> lint <dir> --format json [--contract <path>]` runs and
//! its JSON verdict is mapped onto a [`GateResult`].

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::artifact::Artifact;
use crate::core::cancel::CancelToken;
use crate::core::diff::parse_file_blocks;
use crate::core::types::{GateResult, Severity, Violation};
use crate::io::apply::safe_join;
use crate::io::process::run_command_with_timeout;

const DEFAULT_BINARY: &str = "hollowcheck";
const DEFAULT_EXTENSION: &str = ".go";
const CHECK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// JSON verdict emitted by the external checker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckOutput {
    #[serde(default)]
    passed: bool,
    #[serde(default)]
    score: u32,
    #[serde(default)]
    violations: Vec<CheckIssue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckIssue {
    #[serde(default)]
    rule: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    file: String,
    #[serde(default)]
    line: u32,
    #[serde(default)]
    message: String,
}

/// A gate delegating to an external lint binary.
#[derive(Debug)]
pub struct ExternalCheckGate {
    binary_path: String,
    contract_path: Option<PathBuf>,
}

impl ExternalCheckGate {
    pub fn new(binary_path: &str, contract_path: Option<PathBuf>) -> Self {
        let binary_path = if binary_path.is_empty() {
            DEFAULT_BINARY.to_string()
        } else {
            binary_path.to_string()
        };
        Self {
            binary_path,
            contract_path,
        }
    }

    pub fn name(&self) -> &str {
        "hollowcheck"
    }

    pub fn evaluate(&self, token: &CancelToken, artifact: &Artifact) -> Result<GateResult> {
        let temp = tempfile::Builder::new()
            .prefix("flowgate-check-")
            .tempdir()
            .context("create check temp dir")?;

        write_artifact(temp.path(), artifact)?;
        let output = self.run_check(token, temp.path())?;

        let mut result = to_gate_result(&output);
        result.kind = "hollowcheck".to_string();
        result.diagnostics = serde_json::to_value(&output).ok();
        Ok(result)
    }

    fn run_check(&self, token: &CancelToken, dir: &Path) -> Result<CheckOutput> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("lint").arg(dir).args(["--format", "json"]);
        if let Some(contract) = &self.contract_path {
            cmd.arg("--contract").arg(contract);
        }

        let output = run_command_with_timeout(cmd, token, CHECK_TIMEOUT, OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("run {}", self.binary_path))?;

        if !output.stdout.is_empty() {
            return serde_json::from_slice(&output.stdout).map_err(|parse_err| {
                if !output.status.success() {
                    anyhow!(
                        "{} failed: exit {}, stderr: {}",
                        self.binary_path,
                        output.exit_code(),
                        output.stderr_lossy().trim()
                    )
                } else {
                    anyhow!("parse {} output: {parse_err}", self.binary_path)
                }
            });
        }

        if !output.status.success() {
            return Err(anyhow!(
                "{} failed: exit {}, stderr: {}",
                self.binary_path,
                output.exit_code(),
                output.stderr_lossy().trim()
            ));
        }

        // Clean exit with no report counts as a pass.
        Ok(CheckOutput {
            passed: true,
            score: 0,
            violations: Vec::new(),
        })
    }
}

/// Lay the artifact out for the checker, honoring file-block markers.
fn write_artifact(dir: &Path, artifact: &Artifact) -> Result<()> {
    let files = parse_file_blocks(&artifact.content);
    if !files.is_empty() {
        for (rel, content) in &files {
            let path = safe_join(dir, rel)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        }
        return Ok(());
    }

    let ext = artifact
        .metadata
        .get("extension")
        .map(String::as_str)
        .unwrap_or(DEFAULT_EXTENSION);
    let path = dir.join(format!("artifact{ext}"));
    fs::write(&path, &artifact.content).with_context(|| format!("write {}", path.display()))
}

fn to_gate_result(output: &CheckOutput) -> GateResult {
    if output.passed {
        return GateResult::passing(output.score);
    }

    let mut violations = Vec::with_capacity(output.violations.len());
    let mut hints = Vec::new();
    for issue in &output.violations {
        violations.push(Violation {
            rule: issue.rule.clone(),
            severity: parse_severity(&issue.severity),
            message: issue.message.clone(),
            location: issue_location(issue),
            suggestion: String::new(),
        });
        hints.push(repair_hint(issue));
    }

    GateResult::failing(output.score, violations, hints)
}

fn parse_severity(raw: &str) -> Severity {
    match raw {
        "warning" => Severity::Warning,
        "info" => Severity::Info,
        _ => Severity::Error,
    }
}

fn issue_location(issue: &CheckIssue) -> String {
    if issue.line > 0 {
        format!("{}:{}", issue.file, issue.line)
    } else {
        issue.file.clone()
    }
}

/// Produce an actionable hint from an issue, keyed by rule class.
fn repair_hint(issue: &CheckIssue) -> String {
    let location = issue_location(issue);
    let rule = issue.rule.to_ascii_lowercase();
    let message = issue.message.to_ascii_lowercase();

    if rule == "forbidden_pattern" {
        if message.contains("todo") {
            return format!("Remove TODO comment at {location}");
        }
        if message.contains("fixme") {
            return format!("Address FIXME comment at {location}");
        }
        if message.contains("panic") && message.contains("not implemented") {
            return format!("Replace unimplemented panic with a real implementation at {location}");
        }
        if message.contains("panic") {
            return format!("Replace panic with proper error handling at {location}");
        }
        return format!("Remove forbidden pattern at {location}: {}", issue.message);
    }
    if rule.contains("stub") || rule.contains("low_complexity") {
        return format!("Implement stub function at {location}");
    }
    if rule.contains("placeholder") || rule.contains("mock_data") {
        return format!("Replace placeholder/mock data at {location}");
    }
    if rule.contains("missing_file") {
        return format!("Create required file: {}", issue.message);
    }
    if rule.contains("missing_symbol") {
        return format!("Implement required symbol: {}", issue.message);
    }
    if rule.contains("missing_test") {
        return format!("Add required test: {}", issue.message);
    }
    if rule.contains("empty") {
        return format!("Add implementation to empty block at {location}");
    }
    if rule.contains("error") {
        if message.contains("ignored") {
            return format!("Handle error properly at {location}");
        }
        return format!("Fix error at {location}: {}", issue.message);
    }
    format!("Fix {} violation at {location}: {}", issue.rule, issue.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(rule: &str, message: &str, file: &str, line: u32) -> CheckIssue {
        CheckIssue {
            rule: rule.to_string(),
            severity: "error".to_string(),
            file: file.to_string(),
            line,
            message: message.to_string(),
        }
    }

    #[test]
    fn passing_output_maps_to_passing_result() {
        let output = CheckOutput {
            passed: true,
            score: 5,
            violations: Vec::new(),
        };
        let result = to_gate_result(&output);
        assert!(result.passed);
        assert_eq!(result.score, 5);
    }

    #[test]
    fn failing_output_carries_violations_and_hints() {
        let output = CheckOutput {
            passed: false,
            score: 40,
            violations: vec![
                issue("forbidden_pattern", "TODO found", "main.go", 10),
                issue("stub_function", "empty body", "lib.go", 3),
            ],
        };
        let result = to_gate_result(&output);
        assert!(!result.passed);
        assert_eq!(result.score, 40);
        assert_eq!(result.violations[0].location, "main.go:10");
        assert_eq!(result.repair_hints[0], "Remove TODO comment at main.go:10");
        assert_eq!(result.repair_hints[1], "Implement stub function at lib.go:3");
    }

    #[test]
    fn hint_classes_cover_known_rules() {
        let cases = [
            ("mock_data", "placeholder numbers", "Replace placeholder/mock data"),
            ("missing_file", "need main.go", "Create required file"),
            ("missing_symbol", "need Run", "Implement required symbol"),
            ("missing_test", "need TestRun", "Add required test"),
            ("empty_block", "empty if", "Add implementation to empty block"),
            ("error_check", "error ignored", "Handle error properly"),
            ("custom_rule", "odd thing", "Fix custom_rule violation"),
        ];
        for (rule, message, expected) in cases {
            let hint = repair_hint(&issue(rule, message, "f.go", 1));
            assert!(hint.starts_with(expected), "{rule}: {hint}");
        }
    }

    #[test]
    fn writes_single_file_artifact_with_extension() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifact =
            Artifact::new("fn main() {}", "mock", "m", "p").with_metadata("extension", ".rs");
        write_artifact(temp.path(), &artifact).expect("write");
        assert_eq!(
            fs::read_to_string(temp.path().join("artifact.rs")).expect("read"),
            "fn main() {}"
        );
    }

    #[test]
    fn writes_file_blocks_when_markers_present() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifact = Artifact::new(
            "// file: a/main.go\npackage main\n// file: b.go\npackage b\n",
            "mock",
            "m",
            "p",
        );
        write_artifact(temp.path(), &artifact).expect("write");
        assert!(temp.path().join("a/main.go").exists());
        assert!(temp.path().join("b.go").exists());
    }

    #[test]
    fn rejects_escaping_file_block_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifact = Artifact::new("// file: ../escape.go\npackage x\n", "mock", "m", "p");
        assert!(write_artifact(temp.path(), &artifact).is_err());
    }

    #[test]
    fn missing_binary_is_a_gate_error() {
        let gate = ExternalCheckGate::new("definitely-not-hollowcheck-49x", None);
        let artifact = Artifact::new("x", "mock", "m", "p");
        assert!(gate.evaluate(&CancelToken::new(), &artifact).is_err());
    }
}
