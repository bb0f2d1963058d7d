//! Attestation verification against a run directory.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::attest::{sort_gate_claims, AttestationV0, GateClaim, SCHEMA_V0};
use crate::io::apply::safe_join;
use crate::io::evidence::StageRecord;

/// Verification failures a caller may want to distinguish.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("unknown attestation schema: {0}")]
    UnknownSchema(String),
    #[error("hash mismatch for {0}")]
    HashMismatch(String),
    #[error("missing evidence file {0}")]
    MissingEvidence(String),
    #[error("claim mismatch: {0}")]
    ClaimMismatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaMode {
    Legacy,
    V0,
}

fn parse_schema_mode(schema: &str) -> Result<SchemaMode, VerifyError> {
    match schema {
        "" => Ok(SchemaMode::Legacy),
        SCHEMA_V0 => Ok(SchemaMode::V0),
        other => Err(VerifyError::UnknownSchema(other.to_string())),
    }
}

/// Verify an attestation: every referenced hash must match the file on
/// disk, and the claim must be reproducible from the stage record.
pub fn verify_attestation(attestation: &AttestationV0, run_dir: &Path) -> Result<()> {
    if run_dir.as_os_str().is_empty() {
        return Err(anyhow!("run directory is required"));
    }
    let mode = parse_schema_mode(&attestation.schema)?;

    for (rel, expected) in &attestation.hashes {
        let path = safe_join(run_dir, rel)
            .with_context(|| format!("invalid hash path {rel:?}"))?;
        let data = fs::read(&path)
            .map_err(|_| VerifyError::MissingEvidence(rel.clone()))?;
        let actual = hex::encode(Sha256::digest(&data));
        if actual != *expected {
            return Err(VerifyError::HashMismatch(rel.clone()).into());
        }
    }

    let stage_path = safe_join(run_dir, &attestation.evidence.stage_json)
        .context("invalid stage json path")?;
    let stage_raw = fs::read_to_string(&stage_path)
        .map_err(|_| VerifyError::MissingEvidence(attestation.evidence.stage_json.clone()))?;
    let stage_record: StageRecord =
        serde_json::from_str(&stage_raw).context("parse stage json")?;

    verify_claim(attestation, &stage_record, mode)
}

/// Verify an attestation file against a run directory.
pub fn verify_attestation_file(attestation_path: &Path, run_dir: &Path) -> Result<()> {
    let attestation = crate::attest::read_attestation(attestation_path)?;
    verify_attestation(&attestation, run_dir)
}

fn verify_claim(
    attestation: &AttestationV0,
    stage_record: &StageRecord,
    mode: SchemaMode,
) -> Result<()> {
    let expected_gate_count = stage_record.gate_results.len();
    let mut claim_passed = stage_record.gate_results.iter().all(|g| g.passed);

    match mode {
        SchemaMode::V0 => {
            let expected_gated = expected_gate_count > 0;
            if attestation.claim.gate_count != expected_gate_count
                || attestation.claim.gated != expected_gated
            {
                return Err(VerifyError::ClaimMismatch("gating".to_string()).into());
            }
            if !expected_gated {
                // Ungated stages pass vacuously.
                claim_passed = true;
            }
            if attestation.claim.passed != claim_passed {
                return Err(VerifyError::ClaimMismatch("claim.passed".to_string()).into());
            }
        }
        SchemaMode::Legacy => {
            let last_attempt_succeeded = match stage_record.attempts.last() {
                Some(last) => last.succeeded && last.apply_error.is_empty(),
                None => !stage_record.gate_results.is_empty(),
            };
            if !last_attempt_succeeded {
                claim_passed = false;
            }
            if attestation.claim.passed != claim_passed {
                return Err(VerifyError::ClaimMismatch("claim.passed".to_string()).into());
            }
        }
    }

    if attestation.claim.gates.len() != stage_record.gate_results.len() {
        return Err(VerifyError::ClaimMismatch("claim.gates".to_string()).into());
    }

    let mut attested = attestation.claim.gates.clone();
    let mut reconstructed: Vec<GateClaim> = stage_record
        .gate_results
        .iter()
        .map(|g| GateClaim {
            name: g.name.clone(),
            kind: g.kind.clone(),
            passed: g.passed,
            score: g.score,
        })
        .collect();
    sort_gate_claims(&mut attested);
    sort_gate_claims(&mut reconstructed);

    for (a, r) in attested.iter().zip(&reconstructed) {
        if a != r {
            return Err(VerifyError::ClaimMismatch(format!("gate {}", a.name)).into());
        }
    }

    Ok(())
}
