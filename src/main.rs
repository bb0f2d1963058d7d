//! Gated LLM pipeline runner CLI.
//!
//! `run` executes a manifest against the configured backends, `validate`
//! checks a manifest without running it, and `attest`/`verify` build and
//! check evidence attestations for completed runs.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use flowgate::attest::{build_attestation, verify::verify_attestation_file, write_attestation};
use flowgate::exit_codes;
use flowgate::io::backend::{BackendRegistry, MockBackend};
use flowgate::pipeline::{run as run_pipeline, validate_manifest_file, RunOptions};

#[derive(Parser)]
#[command(
    name = "flowgate",
    version,
    about = "Gated multi-stage LLM pipeline runner with evidence bundles"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a pipeline manifest.
    Run {
        /// Pipeline manifest (YAML).
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Pipeline input string.
        #[arg(short, long, default_value = "")]
        input: String,
        /// Workspace root (overrides the manifest).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Evidence output directory (defaults to <workspace>/.flowgate/runs).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Apply artifacts to the real workspace instead of a temp clone.
        #[arg(long)]
        apply: bool,
        /// Approve real-workspace applies and shell gates.
        #[arg(long)]
        yes: bool,
        /// Abort once estimated spend would exceed this (0 disables).
        #[arg(long)]
        max_budget_usd: Option<f64>,
    },
    /// Check a manifest against the stage/gate invariants.
    Validate {
        /// Pipeline manifest (YAML).
        manifest: PathBuf,
    },
    /// Build an attestation for a completed stage.
    Attest {
        /// Run directory (one entry of .flowgate/runs).
        #[arg(long)]
        run: PathBuf,
        /// Stage name to attest.
        #[arg(long)]
        stage: String,
        /// Output file (stdout when omitted).
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Verify an attestation against a run directory.
    Verify {
        /// Attestation JSON file.
        #[arg(long)]
        attestation: PathBuf,
        /// Run directory the attestation refers to.
        #[arg(long)]
        run: PathBuf,
    },
}

fn main() {
    flowgate::logging::init();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(exit_codes::ERROR);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            file,
            input,
            workspace,
            out,
            apply,
            yes,
            max_budget_usd,
        } => cmd_run(file, input, workspace, out, apply, yes, max_budget_usd),
        Command::Validate { manifest } => cmd_validate(manifest),
        Command::Attest { run, stage, out } => cmd_attest(run, &stage, out),
        Command::Verify { attestation, run } => cmd_verify(attestation, run),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    file: PathBuf,
    input: String,
    workspace: Option<PathBuf>,
    out: Option<PathBuf>,
    apply: bool,
    yes: bool,
    max_budget_usd: Option<f64>,
) -> Result<()> {
    let pipeline = validate_manifest_file(&file)?;
    let backends = default_backends();

    let opts = RunOptions {
        input,
        workspace_path: workspace,
        evidence_dir: out,
        pipeline_path: file.display().to_string(),
        apply_for_real: apply,
        apply_approved: yes,
        max_budget_usd,
        retry: None,
        token: Default::default(),
    };

    let result = run_pipeline(&pipeline, &backends, &opts)?;
    println!("run {} complete", result.run_id);
    println!("evidence: {}", result.evidence_dir.display());
    for stage in &pipeline.stages {
        if let Some(summary) = result.stages.get(&stage.name) {
            let gates = summary.gate_results.len();
            println!(
                "  {}: {} bytes, {} gate{} passed",
                summary.name,
                summary.output.len(),
                gates,
                if gates == 1 { "" } else { "s" }
            );
        }
    }
    Ok(())
}

fn cmd_validate(manifest: PathBuf) -> Result<()> {
    let pipeline = validate_manifest_file(&manifest)?;
    println!(
        "{}: {} stage{}, {} gate{}",
        pipeline.name,
        pipeline.stages.len(),
        if pipeline.stages.len() == 1 { "" } else { "s" },
        pipeline.gates.len(),
        if pipeline.gates.len() == 1 { "" } else { "s" },
    );
    Ok(())
}

fn cmd_attest(run: PathBuf, stage: &str, out: Option<PathBuf>) -> Result<()> {
    let attestation = build_attestation(&run, stage)?;
    match out {
        Some(path) => {
            write_attestation(&path, &attestation)?;
            println!("wrote {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&attestation)?),
    }
    Ok(())
}

fn cmd_verify(attestation: PathBuf, run: PathBuf) -> Result<()> {
    verify_attestation_file(&attestation, &run)?;
    println!("attestation verified");
    Ok(())
}

/// Provider clients live outside the engine; the default registry wires
/// the deterministic mock backend. API keys are read from the process
/// environment by the provider crates, never from configuration files.
fn default_backends() -> BackendRegistry {
    let mut backends = BackendRegistry::new();
    backends.insert(
        "mock".to_string(),
        Box::new(MockBackend::echoing("mock")),
    );
    backends
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from([
            "flowgate",
            "run",
            "-f",
            "pipeline.yaml",
            "-i",
            "hello",
            "--apply",
            "--yes",
            "--max-budget-usd",
            "2.5",
        ]);
        match cli.command {
            Command::Run {
                file,
                input,
                apply,
                yes,
                max_budget_usd,
                ..
            } => {
                assert_eq!(file, PathBuf::from("pipeline.yaml"));
                assert_eq!(input, "hello");
                assert!(apply);
                assert!(yes);
                assert_eq!(max_budget_usd, Some(2.5));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parse_verify() {
        let cli = Cli::parse_from([
            "flowgate",
            "verify",
            "--attestation",
            "att.json",
            "--run",
            "runs/x",
        ]);
        assert!(matches!(cli.command, Command::Verify { .. }));
    }
}
