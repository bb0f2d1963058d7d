//! Command gates: run an allowed local command and gate on its exit code.

use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::core::cancel::CancelToken;
use crate::core::policy::{CommandPolicy, PolicyMode};
use crate::core::types::{GateResult, Violation};
use crate::io::process::run_command_with_timeout;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Execution details captured for evidence and gate logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandDiagnostics {
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workdir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub blocked_reason: String,
    pub policy_mode: PolicyMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

/// A gate that spawns a policy-checked local command.
#[derive(Debug)]
pub struct CommandGate {
    name: String,
    argv: Vec<String>,
    policy: CommandPolicy,
    timeout: Duration,
}

impl CommandGate {
    pub fn new(name: &str, argv: Vec<String>, policy: CommandPolicy) -> Result<Self> {
        if argv.is_empty() {
            bail!("command gate requires a command");
        }
        let name = if name.is_empty() { &argv[0] } else { name };
        Ok(Self {
            name: name.to_string(),
            argv,
            policy,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check policy, then spawn the command in the configured workdir.
    ///
    /// Blocked commands never spawn: the result carries `blocked_reason`
    /// and no exit code. Otherwise `passed == (exit code == 0)`.
    pub fn evaluate(&self, token: &CancelToken) -> Result<GateResult> {
        let workdir = self
            .policy
            .workdir
            .clone()
            .unwrap_or_else(|| self.policy.workspace_root.clone());

        if let Some(reason) = self.policy.block_reason(&self.argv) {
            let mut result = self.result_from_diagnostics(
                CommandDiagnostics {
                    command: self.argv.clone(),
                    workdir: workdir.display().to_string(),
                    blocked_reason: reason.clone(),
                    policy_mode: self.policy.mode,
                    capability: self.policy.capability.clone(),
                    ..CommandDiagnostics::default()
                },
                false,
            );
            result.violations = vec![Violation::error("command_blocked", reason)];
            return Ok(result);
        }

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        cmd.current_dir(&workdir);
        // Subprocesses see only the parent environment; nothing extra is
        // injected here.

        let start = Instant::now();
        let output = match run_command_with_timeout(cmd, token, self.timeout, OUTPUT_LIMIT_BYTES) {
            Ok(output) => output,
            Err(err) => {
                if err.downcast_ref::<crate::core::cancel::Cancelled>().is_some() {
                    return Err(err);
                }
                let mut result = self.result_from_diagnostics(
                    CommandDiagnostics {
                        command: self.argv.clone(),
                        workdir: workdir.display().to_string(),
                        duration_ms: start.elapsed().as_millis() as u64,
                        error: err.to_string(),
                        policy_mode: self.policy.mode,
                        capability: self.policy.capability.clone(),
                        ..CommandDiagnostics::default()
                    },
                    false,
                );
                result.violations =
                    vec![Violation::error("command_failed", "command failed to start")];
                return Ok(result);
            }
        };

        let exit_code = output.exit_code();
        let passed = output.status.success();
        let mut result = self.result_from_diagnostics(
            CommandDiagnostics {
                command: self.argv.clone(),
                workdir: workdir.display().to_string(),
                stdout: output.stdout_lossy(),
                stderr: output.stderr_lossy(),
                exit_code: Some(exit_code),
                duration_ms: start.elapsed().as_millis() as u64,
                error: if output.timed_out {
                    "command timed out".to_string()
                } else {
                    String::new()
                },
                policy_mode: self.policy.mode,
                capability: self.policy.capability.clone(),
                ..CommandDiagnostics::default()
            },
            passed,
        );

        if !passed {
            result.violations = vec![Violation::error(
                "command_failed",
                format!("command exited with status {exit_code}"),
            )];
            if !output.stderr.is_empty() {
                result.repair_hints =
                    vec!["Review stderr output for failure details".to_string()];
            }
        }

        Ok(result)
    }

    fn result_from_diagnostics(&self, diag: CommandDiagnostics, passed: bool) -> GateResult {
        let score = if passed { 0 } else { 100 };
        GateResult {
            passed,
            score,
            kind: "command".to_string(),
            violations: Vec::new(),
            repair_hints: Vec::new(),
            diagnostics: serde_json::to_value(diag).ok(),
        }
    }
}

/// Render command diagnostics as the gate log body.
pub fn format_gate_log(diag: &CommandDiagnostics) -> String {
    format!(
        "command: {}\nexit: {}\n\nstdout:\n{}\n\nstderr:\n{}\n",
        diag.command.join(" "),
        diag.exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string()),
        diag.stdout,
        diag.stderr,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn permissive_policy(root: PathBuf) -> CommandPolicy {
        CommandPolicy {
            mode: PolicyMode::None,
            capability: None,
            templates: Vec::new(),
            deny_shell: false,
            shell_approved: true,
            workspace_root: root,
            workdir: None,
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn passing_command_scores_zero() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gate = CommandGate::new(
            "check",
            argv(&["sh", "-c", "exit 0"]),
            permissive_policy(temp.path().to_path_buf()),
        )
        .expect("gate");

        let result = gate.evaluate(&CancelToken::new()).expect("evaluate");
        assert!(result.passed);
        assert_eq!(result.score, 0);
        assert_eq!(result.kind, "command");
        let diag: CommandDiagnostics =
            serde_json::from_value(result.diagnostics.expect("diag")).expect("parse");
        assert_eq!(diag.exit_code, Some(0));
    }

    #[test]
    fn failing_command_reports_violation_and_hint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gate = CommandGate::new(
            "check",
            argv(&["sh", "-c", "echo broken >&2; exit 2"]),
            permissive_policy(temp.path().to_path_buf()),
        )
        .expect("gate");

        let result = gate.evaluate(&CancelToken::new()).expect("evaluate");
        assert!(!result.passed);
        assert_eq!(result.score, 100);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].rule, "command_failed");
        assert_eq!(
            result.repair_hints,
            vec!["Review stderr output for failure details".to_string()]
        );
    }

    #[test]
    fn blocked_command_never_spawns() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("bad.txt");
        let mut policy = permissive_policy(temp.path().to_path_buf());
        policy.deny_shell = true;
        policy.shell_approved = false;

        let gate = CommandGate::new(
            "check",
            argv(&["sh", "-c", &format!("echo x > {}", marker.display())]),
            policy,
        )
        .expect("gate");

        let result = gate.evaluate(&CancelToken::new()).expect("evaluate");
        assert!(!result.passed);
        assert_eq!(result.violations[0].rule, "command_blocked");
        let diag: CommandDiagnostics =
            serde_json::from_value(result.diagnostics.expect("diag")).expect("parse");
        assert!(diag.exit_code.is_none());
        assert!(diag.blocked_reason.contains("denied by policy"));
        assert!(!marker.exists());
    }

    #[test]
    fn unspawnable_command_is_a_failed_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gate = CommandGate::new(
            "check",
            argv(&["definitely-not-a-real-binary-49x"]),
            permissive_policy(temp.path().to_path_buf()),
        )
        .expect("gate");

        let result = gate.evaluate(&CancelToken::new()).expect("evaluate");
        assert!(!result.passed);
        assert_eq!(result.violations[0].rule, "command_failed");
        assert_eq!(result.violations[0].message, "command failed to start");
    }

    #[test]
    fn runs_in_configured_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sub = temp.path().join("sub");
        std::fs::create_dir_all(&sub).expect("mkdir");
        std::fs::write(sub.join("present.txt"), "x").expect("write");

        let mut policy = permissive_policy(temp.path().to_path_buf());
        policy.workdir = Some(sub);
        let gate = CommandGate::new(
            "check",
            argv(&["sh", "-c", "test -f present.txt"]),
            policy,
        )
        .expect("gate");

        let result = gate.evaluate(&CancelToken::new()).expect("evaluate");
        assert!(result.passed);
    }

    #[test]
    fn empty_argv_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(CommandGate::new("x", Vec::new(), permissive_policy(temp.path().to_path_buf()))
            .is_err());
    }
}
