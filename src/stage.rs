//! Orchestration for a single pipeline stage.
//!
//! Each attempt runs generate -> (optional apply) -> gates, records an
//! [`AttemptRecord`], and either finishes the stage or feeds the failure
//! back through the repair prompt builder. Two consecutive attempts with
//! identical violations and identical output escalate once (switching to
//! the fallback model when configured); a third repeat is a terminal
//! repair loop.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::artifact::Artifact;
use crate::core::cancel::{CancelToken, Cancelled};
use crate::core::cost::CostTracker;
use crate::core::repair::{
    escalation_prompt, fingerprint_violations, repair_prompt, AttemptState, RepairState,
};
use crate::core::template::{render_prompt, StageBinding};
use crate::core::types::{GateResult, Violation};
use crate::gate::build_gates;
use crate::io::apply::{apply_output, ApplyResult};
use crate::io::backend::{call_with_retry, BackendRegistry, ModelBackend, RetryConfig};
use crate::io::clone::{clone_to_temp, TempClone};
use crate::io::evidence::{AttemptRecord, EvidenceWriter, GateRecord, StageRecord};
use crate::io::manifest::{Pipeline, Stage};

/// Preview cap for prompts/outputs stored inline in stage records; the
/// full contents live in blobs.
const EVIDENCE_PREVIEW_LIMIT: usize = 4096;

/// Applying to the real workspace without explicit approval.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("apply for real requires explicit approval")]
pub struct ApplyRequiresApproval;

/// Two consecutive attempts repeated the same failure and output after
/// escalation already fired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "repair loop detected for stage {stage}: fingerprint={fingerprint} output_hash={output_hash} prompt_ref={prompt_ref} output_ref={output_ref}"
)]
pub struct RepairLoopDetected {
    pub stage: String,
    pub fingerprint: String,
    pub output_hash: String,
    pub prompt_ref: String,
    pub output_ref: String,
}

/// Everything a stage needs from its surrounding run.
pub struct StageEnv<'a> {
    pub pipeline: &'a Pipeline,
    pub backends: &'a BackendRegistry,
    pub writer: &'a EvidenceWriter,
    pub workspace_root: &'a Path,
    pub input: &'a str,
    pub apply_for_real: bool,
    pub apply_approved: bool,
    pub retry: RetryConfig,
    pub token: CancelToken,
}

/// Result of a completed stage.
#[derive(Debug)]
pub struct StageOutcome {
    pub artifact: Artifact,
    pub gate_results: Vec<EvaluatedGate>,
    pub apply_result: Option<ApplyResult>,
}

/// One gate evaluation with runner-side metadata.
#[derive(Debug, Clone)]
pub struct EvaluatedGate {
    pub name: String,
    pub result: Option<GateResult>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Execute one stage to completion or failure.
///
/// The stage record reflects whatever progress was made and is returned
/// in both cases so the pipeline can persist partial evidence.
#[instrument(skip_all, fields(stage = %stage.name))]
pub fn run_stage(
    env: &StageEnv<'_>,
    tracker: &mut CostTracker,
    stage: &Stage,
    artifacts: &BTreeMap<String, StageBinding>,
) -> (StageRecord, Result<StageOutcome>) {
    let mut record = StageRecord {
        name: stage.name.clone(),
        ..StageRecord::default()
    };
    let outcome = run_stage_inner(env, tracker, stage, artifacts, &mut record);
    (record, outcome)
}

fn run_stage_inner(
    env: &StageEnv<'_>,
    tracker: &mut CostTracker,
    stage: &Stage,
    artifacts: &BTreeMap<String, StageBinding>,
    record: &mut StageRecord,
) -> Result<StageOutcome> {
    let start = Instant::now();

    let (adapter_name, backend) = resolve_backend(env.pipeline, env.backends, stage)?;
    let mut model = resolve_model(env.pipeline, backend, stage)?;

    let mut prompt = render_prompt(&stage.prompt, env.input, artifacts)
        .with_context(|| format!("render prompt for stage {}", stage.name))?;

    let (prompt_ref, prompt_sha) = env
        .writer
        .write_blob(&env.token, "prompt", prompt.as_bytes())
        .with_context(|| format!("write prompt blob for stage {}", stage.name))?;

    record.adapter = adapter_name.clone();
    record.model = model.clone();
    record.prompt = truncate_preview(&prompt);
    record.prompt_ref = prompt_ref;
    record.prompt_hash = prompt_sha;
    record.prompt_len = prompt.len();

    let attempts = stage.max_retries + 1;
    let mut state = RepairState::default();
    let mut fallback_active = false;

    let mut last_artifact: Option<Artifact> = None;
    let mut last_gates: Vec<EvaluatedGate> = Vec::new();
    let mut last_apply: Option<ApplyResult> = None;

    for attempt in 1..=attempts {
        let attempt_start = Instant::now();
        info!(attempt, model = %model, "starting attempt");

        let response = call_with_retry(
            backend,
            &env.token,
            &model,
            &prompt,
            &env.retry,
            tracker,
            fallback_active,
        )
        .with_context(|| format!("stage {} backend error", stage.name))?;

        let artifact = Artifact::new(&response.content, &adapter_name, &model, &prompt);
        last_artifact = Some(artifact.clone());

        let (attempt_prompt_ref, attempt_prompt_sha) =
            store_attempt_blob(env, "attempt-prompt", prompt.as_bytes())?;
        let (attempt_output_ref, attempt_output_sha) =
            store_attempt_blob(env, "attempt-output", artifact.content.as_bytes())?;

        let applied = apply_if_needed(env, stage, &artifact)?;
        last_apply = applied.result.clone();

        let gate_results = evaluate_gates(env, stage, &artifact, &applied.target)?;
        last_gates = gate_results.clone();

        let apply_error = applied.error.clone();
        let succeeded = apply_error.is_none() && all_gates_passed(&gate_results);

        let mut attempt_record = AttemptRecord {
            attempt,
            prompt_hash: attempt_prompt_sha,
            prompt_ref: attempt_prompt_ref.clone(),
            output_ref: attempt_output_ref.clone(),
            output_hash: attempt_output_sha,
            output_len: artifact.content.len(),
            workspace_used: applied.target.display().to_string(),
            workspace_mode: applied.mode.to_string(),
            gate_results: gate_records(&gate_results),
            apply_error: apply_error.clone().unwrap_or_default(),
            succeeded,
            escalated: false,
            duration_ms: attempt_start.elapsed().as_millis() as u64,
        };

        if let Some(clone) = applied.clone {
            clone.release()?;
        }

        if succeeded {
            record.attempts.push(attempt_record);
            debug!(attempt, "attempt succeeded");
            break;
        }

        let failure = consolidate_failures(&gate_results, apply_error.as_deref());
        let fingerprint = fingerprint_violations(&failure.violations, apply_error.as_deref());
        state.record(AttemptState {
            prompt_hash: attempt_record.prompt_hash.clone(),
            output_hash: artifact.hash.clone(),
            fingerprint: fingerprint.clone(),
        });

        if state.looping() {
            if !state.escalated {
                state.escalated = true;
                if let Some(fallback) = &stage.fallback_model {
                    model = fallback.clone();
                    fallback_active = true;
                }
                prompt = escalation_prompt(&artifact, &failure, stage.apply);
                warn!(attempt, fingerprint = %fingerprint, "no progress; escalating");
                attempt_record.escalated = true;
                record.attempts.push(attempt_record);
                continue;
            }
            record.attempts.push(attempt_record);
            return Err(anyhow!(RepairLoopDetected {
                stage: stage.name.clone(),
                fingerprint,
                output_hash: artifact.hash.clone(),
                prompt_ref: attempt_prompt_ref,
                output_ref: attempt_output_ref,
            }));
        }

        record.attempts.push(attempt_record);

        if attempt == attempts {
            if let Some(apply_error) = apply_error {
                bail!("stage {} apply failed: {apply_error}", stage.name);
            }
            if let Some(failed) = first_gate_failure(&gate_results) {
                bail!("stage {} gate {failed} failed", stage.name);
            }
            bail!("stage {} failed", stage.name);
        }

        prompt = repair_prompt(&artifact, &failure);
        debug!(attempt, "built repair prompt");
    }

    let artifact = last_artifact.expect("at least one attempt ran");
    let (output_ref, output_sha) = env
        .writer
        .write_blob(&env.token, "output", artifact.content.as_bytes())
        .with_context(|| format!("write output blob for stage {}", stage.name))?;

    record.output = truncate_preview(&artifact.content);
    record.output_ref = output_ref;
    record.output_hash = output_sha;
    record.output_len = artifact.content.len();
    record.gate_results = gate_records(&last_gates);
    record.apply_result = last_apply.clone().map(Into::into);
    record.duration_ms = start.elapsed().as_millis() as u64;

    Ok(StageOutcome {
        artifact,
        gate_results: last_gates,
        apply_result: last_apply,
    })
}

fn resolve_backend<'a>(
    pipeline: &Pipeline,
    backends: &'a BackendRegistry,
    stage: &Stage,
) -> Result<(String, &'a dyn ModelBackend)> {
    let name = stage
        .backend
        .clone()
        .or_else(|| pipeline.defaults.backend.clone())
        .or_else(|| {
            if backends.len() == 1 {
                backends.keys().next().cloned()
            } else {
                None
            }
        })
        .ok_or_else(|| anyhow!("backend not specified for stage {}", stage.name))?;

    let backend = backends
        .get(&name)
        .ok_or_else(|| anyhow!("backend {name} not found"))?;
    Ok((name, backend.as_ref()))
}

fn resolve_model(pipeline: &Pipeline, backend: &dyn ModelBackend, stage: &Stage) -> Result<String> {
    stage
        .model
        .clone()
        .or_else(|| pipeline.defaults.model.clone())
        .or_else(|| backend.models().into_iter().next())
        .ok_or_else(|| anyhow!("model not specified for stage {}", stage.name))
}

struct AppliedWorkspace {
    target: PathBuf,
    mode: &'static str,
    result: Option<ApplyResult>,
    error: Option<String>,
    clone: Option<TempClone>,
}

/// Apply the artifact when the stage requests it.
///
/// Dry-run (the default) applies to a fresh temp clone so gates observe
/// the change without mutating the real workspace. `--apply-for-real`
/// without approval is fatal before any filesystem write. Apply parse or
/// write errors are not fatal: they feed the repair loop.
fn apply_if_needed(
    env: &StageEnv<'_>,
    stage: &Stage,
    artifact: &Artifact,
) -> Result<AppliedWorkspace> {
    if !stage.apply {
        return Ok(AppliedWorkspace {
            target: env.workspace_root.to_path_buf(),
            mode: "real",
            result: None,
            error: None,
            clone: None,
        });
    }

    if env.apply_for_real && !env.apply_approved {
        return Err(anyhow!(ApplyRequiresApproval));
    }

    let (target, mode, clone) = if env.apply_for_real {
        (env.workspace_root.to_path_buf(), "real", None)
    } else {
        let clone = clone_to_temp(env.workspace_root, &env.token)?;
        (clone.path().to_path_buf(), "temp", Some(clone))
    };

    match apply_output(&target, &artifact.content) {
        Ok(result) => Ok(AppliedWorkspace {
            target,
            mode,
            result: Some(result),
            error: None,
            clone,
        }),
        Err(err) => {
            if err.downcast_ref::<Cancelled>().is_some() {
                return Err(err);
            }
            Ok(AppliedWorkspace {
                target,
                mode,
                result: None,
                error: Some(format!("{err:#}")),
                clone,
            })
        }
    }
}

/// Evaluate the stage's gates in order against `target`.
///
/// The first failing gate short-circuits the rest. A gate that errors
/// (rather than fails) is recorded and also short-circuits; both feed the
/// repair loop. Cancellation is fatal.
fn evaluate_gates(
    env: &StageEnv<'_>,
    stage: &Stage,
    artifact: &Artifact,
    target: &Path,
) -> Result<Vec<EvaluatedGate>> {
    if stage.gates.is_empty() {
        return Ok(Vec::new());
    }

    let gates = build_gates(env.pipeline, &stage.gates, target, env.apply_approved)?;

    let mut results = Vec::with_capacity(gates.len());
    for gate in &gates {
        let start = Instant::now();
        match gate.evaluate(&env.token, artifact) {
            Ok(result) => {
                let passed = result.passed;
                results.push(EvaluatedGate {
                    name: gate.name().to_string(),
                    result: Some(result),
                    error: None,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
                if !passed {
                    break;
                }
            }
            Err(err) => {
                if err.downcast_ref::<Cancelled>().is_some() {
                    return Err(err);
                }
                warn!(gate = gate.name(), error = %err, "gate errored");
                results.push(EvaluatedGate {
                    name: gate.name().to_string(),
                    result: None,
                    error: Some(format!("{err:#}")),
                    duration_ms: start.elapsed().as_millis() as u64,
                });
                break;
            }
        }
    }

    Ok(results)
}

fn all_gates_passed(results: &[EvaluatedGate]) -> bool {
    results.iter().all(|g| {
        g.error.is_none() && g.result.as_ref().map(|r| r.passed).unwrap_or(false)
    })
}

fn first_gate_failure(results: &[EvaluatedGate]) -> Option<&str> {
    results
        .iter()
        .find(|g| g.error.is_some() || g.result.as_ref().map(|r| !r.passed).unwrap_or(true))
        .map(|g| g.name.as_str())
}

/// Merge the attempt's failures into one result for the repair builder.
pub fn consolidate_failures(
    results: &[EvaluatedGate],
    apply_error: Option<&str>,
) -> GateResult {
    if let Some(err) = apply_error {
        return GateResult::failing(
            100,
            vec![Violation::error("apply_failed", err)],
            Vec::new(),
        );
    }

    let mut violations = Vec::new();
    let mut hints = Vec::new();
    for evaluated in results {
        let Some(result) = &evaluated.result else {
            continue;
        };
        if result.passed {
            continue;
        }
        violations.extend(result.violations.iter().cloned());
        hints.extend(result.repair_hints.iter().cloned());
    }

    if violations.is_empty() {
        violations.push(Violation::error(
            "gate_failed",
            "gate failed without specific violations",
        ));
    }

    GateResult::failing(100, violations, hints)
}

fn gate_records(results: &[EvaluatedGate]) -> Vec<GateRecord> {
    results
        .iter()
        .map(|evaluated| {
            let mut record = GateRecord {
                name: evaluated.name.clone(),
                error: evaluated.error.clone().unwrap_or_default(),
                duration_ms: evaluated.duration_ms,
                ..GateRecord::default()
            };
            if let Some(result) = &evaluated.result {
                record.passed = result.passed;
                record.score = result.score;
                record.kind = result.kind.clone();
                record.violations = result.violations.clone();
                record.repair_hints = result.repair_hints.clone();
                record.diagnostics = result.diagnostics.clone();
            }
            record
        })
        .collect()
}

fn store_attempt_blob(
    env: &StageEnv<'_>,
    kind: &str,
    content: &[u8],
) -> Result<(String, String)> {
    match env.writer.write_blob(&env.token, kind, content) {
        Ok(pair) => Ok(pair),
        Err(err) => {
            if err.downcast_ref::<Cancelled>().is_some() {
                return Err(err);
            }
            // Attempt blobs are best-effort: keep the hash for loop
            // detection even when the store write fails.
            warn!(kind, error = %err, "attempt blob write failed");
            use sha2::Digest;
            Ok((String::new(), hex::encode(sha2::Sha256::digest(content))))
        }
    }
}

fn truncate_preview(value: &str) -> String {
    if value.len() <= EVIDENCE_PREVIEW_LIMIT {
        return value.to_string();
    }
    let mut end = EVIDENCE_PREVIEW_LIMIT;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

impl From<ApplyResult> for crate::io::evidence::ApplyRecord {
    fn from(result: ApplyResult) -> Self {
        Self {
            applied_files: result.applied_files,
            deleted_files: result.deleted_files,
            used_unified_diff: result.used_unified_diff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Severity;

    fn evaluated(name: &str, result: Option<GateResult>, error: Option<&str>) -> EvaluatedGate {
        EvaluatedGate {
            name: name.to_string(),
            result,
            error: error.map(str::to_string),
            duration_ms: 1,
        }
    }

    #[test]
    fn consolidation_prefers_apply_error() {
        let gates = vec![evaluated(
            "g",
            Some(GateResult::failing(
                100,
                vec![Violation::error("other", "x")],
                Vec::new(),
            )),
            None,
        )];
        let failure = consolidate_failures(&gates, Some("write failed"));
        assert_eq!(failure.violations.len(), 1);
        assert_eq!(failure.violations[0].rule, "apply_failed");
        assert_eq!(failure.violations[0].message, "write failed");
    }

    #[test]
    fn consolidation_collects_violations_and_hints() {
        let gates = vec![
            evaluated("ok", Some(GateResult::passing(0)), None),
            evaluated(
                "bad",
                Some(GateResult::failing(
                    100,
                    vec![Violation {
                        rule: "command_failed".into(),
                        severity: Severity::Error,
                        message: "exit 1".into(),
                        location: String::new(),
                        suggestion: String::new(),
                    }],
                    vec!["check stderr".into()],
                )),
                None,
            ),
        ];
        let failure = consolidate_failures(&gates, None);
        assert_eq!(failure.violations.len(), 1);
        assert_eq!(failure.repair_hints, vec!["check stderr".to_string()]);
    }

    #[test]
    fn consolidation_synthesizes_generic_violation() {
        let gates = vec![evaluated("err", None, Some("gate exploded"))];
        let failure = consolidate_failures(&gates, None);
        assert_eq!(failure.violations[0].rule, "gate_failed");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let value = "é".repeat(EVIDENCE_PREVIEW_LIMIT);
        let preview = truncate_preview(&value);
        assert!(preview.len() <= EVIDENCE_PREVIEW_LIMIT);
        assert!(value.starts_with(&preview));
    }

    #[test]
    fn gate_pass_detection() {
        assert!(all_gates_passed(&[]));
        assert!(all_gates_passed(&[evaluated(
            "g",
            Some(GateResult::passing(0)),
            None
        )]));
        assert!(!all_gates_passed(&[evaluated(
            "g",
            Some(GateResult::failing(100, Vec::new(), Vec::new())),
            None
        )]));
        assert!(!all_gates_passed(&[evaluated("g", None, Some("boom"))]));
    }
}
