//! Attestations: bind a claim about a stage's gate outcome to sha256
//! hashes of the evidence files that justify it.

pub mod verify;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::io::apply::safe_join;
use crate::io::evidence::{RunRecord, StageRecord};

pub const SCHEMA_V0: &str = "flowgate.attestation.v0";

/// A v0 attestation for one stage of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttestationV0 {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub subject: Subject,
    #[serde(default)]
    pub claim: Claim,
    #[serde(default)]
    pub evidence: EvidenceRefs,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub pipeline_file: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub stage: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub gate_count: usize,
    #[serde(default)]
    pub gated: bool,
    #[serde(default)]
    pub gates: Vec<GateClaim>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateClaim {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub score: u32,
}

/// Relative paths of the evidence files the hashes cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRefs {
    #[serde(default)]
    pub run_json: String,
    #[serde(default)]
    pub stage_json: String,
    #[serde(default)]
    pub blobs: Vec<String>,
    #[serde(default)]
    pub gate_logs: Vec<String>,
}

/// Sort gate claims by (name, kind) for stable comparison.
pub fn sort_gate_claims(gates: &mut [GateClaim]) {
    gates.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.kind.cmp(&b.kind)));
}

/// Build a v0 attestation for `stage` from a run directory.
///
/// Collects the stage's prompt/output blobs (including every attempt's),
/// the stage's gate logs, and hashes each referenced file. Relative paths
/// read back from evidence are re-checked against traversal before any
/// file is touched.
pub fn build_attestation(run_dir: &Path, stage_name: &str) -> Result<AttestationV0> {
    if run_dir.as_os_str().is_empty() {
        bail!("run directory is required");
    }
    if stage_name.is_empty() {
        bail!("stage name is required");
    }

    let stage_json_rel = format!("stages/{stage_name}.json");
    let run_record: RunRecord = read_json(run_dir, "run.json")?;
    let stage_record: StageRecord = read_json(run_dir, &stage_json_rel)?;

    let mut gates: Vec<GateClaim> = stage_record
        .gate_results
        .iter()
        .map(|g| GateClaim {
            name: g.name.clone(),
            kind: g.kind.clone(),
            passed: g.passed,
            score: g.score,
        })
        .collect();
    let passed = stage_record.gate_results.iter().all(|g| g.passed);
    sort_gate_claims(&mut gates);

    let blobs = collect_stage_blobs(&stage_record);
    let gate_logs = find_gate_logs(run_dir, stage_name)?;

    let mut hashes = BTreeMap::new();
    let mut add_hash = |rel: &str| -> Result<()> {
        if rel.is_empty() || hashes.contains_key(rel) {
            return Ok(());
        }
        let path = safe_join(run_dir, rel)?;
        let data =
            fs::read(&path).with_context(|| format!("read evidence file {rel}"))?;
        hashes.insert(rel.to_string(), hex::encode(Sha256::digest(&data)));
        Ok(())
    };

    add_hash("run.json")?;
    add_hash(&stage_json_rel)?;
    for blob in &blobs {
        add_hash(blob)?;
    }
    for log in &gate_logs {
        add_hash(log)?;
    }

    Ok(AttestationV0 {
        schema: SCHEMA_V0.to_string(),
        subject: Subject {
            workspace: run_record.workspace,
            pipeline_file: run_record.pipeline_file,
            run_id: run_record.id,
            stage: stage_name.to_string(),
        },
        claim: Claim {
            passed,
            gate_count: gates.len(),
            gated: !gates.is_empty(),
            gates,
        },
        evidence: EvidenceRefs {
            run_json: "run.json".to_string(),
            stage_json: stage_json_rel,
            blobs,
            gate_logs,
        },
        hashes,
    })
}

/// Write an attestation as pretty JSON.
pub fn write_attestation(path: &Path, attestation: &AttestationV0) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(attestation).context("serialize attestation")?;
    payload.push('\n');
    fs::write(path, payload).with_context(|| format!("write {}", path.display()))
}

/// Read an attestation from disk.
pub fn read_attestation(path: &Path) -> Result<AttestationV0> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(run_dir: &Path, rel: &str) -> Result<T> {
    let path = safe_join(run_dir, rel)?;
    let raw = fs::read_to_string(&path).with_context(|| format!("read {rel}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {rel}"))
}

fn collect_stage_blobs(record: &StageRecord) -> Vec<String> {
    let mut blobs = Vec::new();
    for reference in [&record.prompt_ref, &record.output_ref] {
        if !reference.is_empty() {
            blobs.push(reference.clone());
        }
    }
    for attempt in &record.attempts {
        for reference in [&attempt.prompt_ref, &attempt.output_ref] {
            if !reference.is_empty() {
                blobs.push(reference.clone());
            }
        }
    }
    blobs.sort();
    blobs.dedup();
    blobs
}

fn find_gate_logs(run_dir: &Path, stage_name: &str) -> Result<Vec<String>> {
    let gates_dir = run_dir.join("gates");
    let entries = match fs::read_dir(&gates_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", gates_dir.display()))
        }
    };

    let prefix = format!("{stage_name}-");
    let mut logs = Vec::new();
    for entry in entries {
        let entry = entry.context("read gates dir entry")?;
        if entry.file_type().context("gate log file type")?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) {
            logs.push(format!("gates/{name}"));
        }
    }
    logs.sort();
    Ok(logs)
}
