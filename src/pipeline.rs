//! Pipeline execution: validate, then run stages in declared order.
//!
//! Every run produces a run record and whatever stage records completed
//! before a failure; the evidence directory path is part of any run
//! error so callers can always point at the diagnostics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::core::cancel::CancelToken;
use crate::core::cost::CostTracker;
use crate::core::template::StageBinding;
use crate::gate::command::{format_gate_log, CommandDiagnostics};
use crate::io::apply::ApplyResult;
use crate::io::backend::{BackendRegistry, RetryConfig};
use crate::io::evidence::{new_run_id, EvidenceWriter, RunRecord, StageRecord};
use crate::io::manifest::Pipeline;
use crate::stage::{run_stage, EvaluatedGate, StageEnv};

/// Options for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input: String,
    pub workspace_path: Option<PathBuf>,
    pub evidence_dir: Option<PathBuf>,
    pub pipeline_path: String,
    pub apply_for_real: bool,
    pub apply_approved: bool,
    /// Overrides the manifest's `max_budget_usd` when set.
    pub max_budget_usd: Option<f64>,
    pub retry: Option<RetryConfig>,
    pub token: CancelToken,
}

/// Completed stage as seen by the caller.
#[derive(Debug)]
pub struct StageSummary {
    pub name: String,
    pub output: String,
    pub output_hash: String,
    pub gate_results: Vec<EvaluatedGate>,
    pub apply_result: Option<ApplyResult>,
}

/// Outputs of a pipeline run.
#[derive(Debug)]
pub struct RunResult {
    pub run_id: String,
    pub evidence_dir: PathBuf,
    pub stages: BTreeMap<String, StageSummary>,
}

/// Execute the pipeline against the given backends.
#[instrument(skip_all, fields(pipeline = %pipeline.name))]
pub fn run(pipeline: &Pipeline, backends: &BackendRegistry, opts: &RunOptions) -> Result<RunResult> {
    pipeline.validate()?;
    if backends.is_empty() {
        bail!("no backends configured");
    }

    let workspace = resolve_workspace(pipeline, opts)?;
    let evidence_base = opts
        .evidence_dir
        .clone()
        .unwrap_or_else(|| workspace.join(".flowgate").join("runs"));

    let run_id = new_run_id();
    let writer = EvidenceWriter::open(&evidence_base, &run_id)?;
    info!(run_id = %run_id, evidence = %writer.run_dir().display(), "starting run");

    let mut run_record = RunRecord {
        id: run_id.clone(),
        timestamp: Some(chrono::Utc::now()),
        pipeline_file: opts.pipeline_path.clone(),
        input_hash: hex::encode(Sha256::digest(opts.input.as_bytes())),
        workspace: workspace.display().to_string(),
        tool_versions: BTreeMap::from([(
            "flowgate".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        )]),
        cost_report: None,
    };
    writer.write_run(&run_record)?;

    let max_budget = opts.max_budget_usd.unwrap_or(pipeline.max_budget_usd);
    let mut tracker = CostTracker::new(pipeline.pricing.clone(), max_budget);

    let env = StageEnv {
        pipeline,
        backends,
        writer: &writer,
        workspace_root: &workspace,
        input: &opts.input,
        apply_for_real: opts.apply_for_real,
        apply_approved: opts.apply_approved,
        retry: opts.retry.unwrap_or_default(),
        token: opts.token.clone(),
    };

    let mut artifacts: BTreeMap<String, StageBinding> = BTreeMap::new();
    let mut summaries = BTreeMap::new();

    for stage in &pipeline.stages {
        let (record, outcome) = run_stage(&env, &mut tracker, stage, &artifacts);
        writer.write_stage(&record)?;

        match outcome {
            Ok(outcome) => {
                write_gate_logs(&writer, &stage.name, &outcome.gate_results)?;
                artifacts.insert(
                    stage.name.clone(),
                    StageBinding {
                        text: outcome.artifact.content.clone(),
                        hash: outcome.artifact.hash.clone(),
                    },
                );
                summaries.insert(
                    stage.name.clone(),
                    StageSummary {
                        name: stage.name.clone(),
                        output: outcome.artifact.content,
                        output_hash: record.output_hash.clone(),
                        gate_results: outcome.gate_results,
                        apply_result: outcome.apply_result,
                    },
                );
                info!(stage = %stage.name, "stage succeeded");
            }
            Err(err) => {
                write_gate_logs_from_record(&writer, &record)?;
                finalize_run_record(&writer, &mut run_record, &tracker)?;
                return Err(anyhow!(err).context(format!(
                    "stage {} failed (evidence: {})",
                    stage.name,
                    writer.run_dir().display()
                )));
            }
        }
    }

    finalize_run_record(&writer, &mut run_record, &tracker)?;

    Ok(RunResult {
        run_id,
        evidence_dir: writer.run_dir().to_path_buf(),
        stages: summaries,
    })
}

fn resolve_workspace(pipeline: &Pipeline, opts: &RunOptions) -> Result<PathBuf> {
    if let Some(path) = &opts.workspace_path {
        return Ok(path.clone());
    }
    if let Some(path) = &pipeline.workspace.path {
        return Ok(path.clone());
    }
    std::env::current_dir().context("resolve current directory")
}

fn finalize_run_record(
    writer: &EvidenceWriter,
    run_record: &mut RunRecord,
    tracker: &CostTracker,
) -> Result<()> {
    run_record.cost_report = Some(tracker.report());
    writer.write_run(run_record)
}

/// Persist command-gate diagnostics as `gates/<stage>-<gate>.log`.
fn write_gate_logs(
    writer: &EvidenceWriter,
    stage_name: &str,
    results: &[EvaluatedGate],
) -> Result<()> {
    for evaluated in results {
        let Some(result) = &evaluated.result else {
            continue;
        };
        if result.kind != "command" {
            continue;
        }
        let Some(diag) = &result.diagnostics else {
            continue;
        };
        let Ok(diag) = serde_json::from_value::<CommandDiagnostics>(diag.clone()) else {
            continue;
        };
        writer.write_gate_log(stage_name, &evaluated.name, &format_gate_log(&diag))?;
    }
    Ok(())
}

/// Same as [`write_gate_logs`] but for a failed stage, using the last
/// attempt's persisted gate records.
fn write_gate_logs_from_record(writer: &EvidenceWriter, record: &StageRecord) -> Result<()> {
    let Some(attempt) = record.attempts.last() else {
        return Ok(());
    };
    for gate in &attempt.gate_results {
        if gate.kind != "command" {
            continue;
        }
        let Some(diag) = &gate.diagnostics else {
            continue;
        };
        let Ok(diag) = serde_json::from_value::<CommandDiagnostics>(diag.clone()) else {
            continue;
        };
        writer.write_gate_log(&record.name, &gate.name, &format_gate_log(&diag))?;
    }
    Ok(())
}

/// Validate a manifest file without running it.
pub fn validate_manifest_file(path: &Path) -> Result<Pipeline> {
    let pipeline = crate::io::manifest::load_manifest(path)?;
    pipeline.validate()?;
    Ok(pipeline)
}
