//! Evidence bundle writer: run/stage records, gate logs, and the
//! content-addressed blob store.
//!
//! The writer exclusively owns `base_dir/run_id` for the life of the run.
//! Directories are created 0700 and files written 0600 on POSIX
//! (best-effort elsewhere); no write escapes the run directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::cancel::CancelToken;
use crate::core::cost::RunCostReport;
use crate::core::types::Violation;

/// Run-level metadata (`run.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pipeline_file: String,
    #[serde(default)]
    pub input_hash: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub tool_versions: std::collections::BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_report: Option<RunCostReport>,
}

/// Evidence for a single stage (`stages/<stage>.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub adapter: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt_hash: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub prompt_len: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_hash: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub output_len: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_results: Vec<GateRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_result: Option<ApplyRecord>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Workspace apply summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRecord {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_files: Vec<String>,
    #[serde(default)]
    pub used_unified_diff: bool,
}

/// Persisted gate evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub score: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repair_hints: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub duration_ms: u64,
}

/// One generate → apply → gate pass for a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_hash: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub output_len: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace_used: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace_mode: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_results: Vec<GateRecord>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub apply_error: String,
    #[serde(default)]
    pub succeeded: bool,
    /// Set on the attempt whose failure triggered escalation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub escalated: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Writes one run's evidence bundle.
#[derive(Debug)]
pub struct EvidenceWriter {
    run_dir: PathBuf,
}

impl EvidenceWriter {
    /// Create `base_dir/run_id/{stages,gates,blobs}`.
    pub fn open(base_dir: &Path, run_id: &str) -> Result<Self> {
        if base_dir.as_os_str().is_empty() {
            bail!("base directory is required");
        }
        if run_id.is_empty() {
            bail!("run id is required");
        }

        let run_dir = base_dir.join(run_id);
        create_dir_private(base_dir)?;
        create_dir_private(&run_dir)?;
        for sub in ["stages", "gates", "blobs"] {
            create_dir_private(&run_dir.join(sub))?;
        }
        debug!(run_dir = %run_dir.display(), "opened evidence writer");

        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn write_run(&self, record: &RunRecord) -> Result<()> {
        write_json(&self.run_dir.join("run.json"), record)
    }

    pub fn write_stage(&self, record: &StageRecord) -> Result<()> {
        let path = self.run_dir.join("stages").join(format!("{}.json", record.name));
        write_json(&path, record)
    }

    /// Write gate diagnostics to `gates/<stage>-<gate>.log`.
    pub fn write_gate_log(&self, stage: &str, gate: &str, content: &str) -> Result<()> {
        if stage.is_empty() || gate.is_empty() {
            bail!("stage name and gate name are required");
        }
        let path = self.run_dir.join("gates").join(format!("{stage}-{gate}.log"));
        write_file_private(&path, content.as_bytes())
    }

    /// Store content in the blob store, returning `(relative ref, sha256)`.
    ///
    /// Content-addressed and idempotent: re-storing identical bytes is a
    /// no-op returning the existing reference. Cancellation is observed
    /// before any file is created.
    pub fn write_blob(
        &self,
        token: &CancelToken,
        kind: &str,
        content: &[u8],
    ) -> Result<(String, String)> {
        token.check()?;
        let sanitized = sanitize_kind(kind);
        let sha = hex::encode(Sha256::digest(content));
        let reference = format!("blobs/{sanitized}-{sha}.txt");
        let path = self.run_dir.join(&reference);

        if path.exists() {
            return Ok((reference, sha));
        }
        write_file_private(&path, content)?;
        Ok((reference, sha))
    }
}

/// Run id format: `YYYYMMDDThhmmssZ-<8 hex>`.
pub fn new_run_id() -> String {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        hex::encode(suffix)
    )
}

/// Keep `[a-z0-9_-]` (after ASCII lowercasing); empty results fall back
/// to `blob`.
fn sanitize_kind(kind: &str) -> String {
    let sanitized: String = kind
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
        .collect();
    if sanitized.is_empty() {
        "blob".to_string()
    } else {
        sanitized
    }
}

fn create_dir_private(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .with_context(|| format!("create directory {}", path.display()))
}

fn write_file_private(path: &Path, content: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(content)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    write_file_private(path, payload.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(temp: &tempfile::TempDir) -> EvidenceWriter {
        EvidenceWriter::open(&temp.path().join("runs"), "run-1").expect("open writer")
    }

    #[test]
    fn open_creates_run_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let w = writer(&temp);
        for sub in ["stages", "gates", "blobs"] {
            assert!(w.run_dir().join(sub).is_dir());
        }
    }

    #[cfg(unix)]
    #[test]
    fn directories_are_0700_and_files_0600() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let w = writer(&temp);
        w.write_run(&RunRecord::default()).expect("write run");
        let (reference, _) = w
            .write_blob(&CancelToken::new(), "prompt", b"hello")
            .expect("write blob");

        let dir_mode = fs::metadata(w.run_dir()).expect("meta").permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = fs::metadata(w.run_dir().join("run.json"))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let blob_mode = fs::metadata(w.run_dir().join(reference))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(blob_mode & 0o777, 0o600);
    }

    #[test]
    fn blob_refs_are_content_addressed_and_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let w = writer(&temp);
        let token = CancelToken::new();

        let (ref1, sha1) = w.write_blob(&token, "prompt", b"same bytes").expect("first");
        let (ref2, sha2) = w.write_blob(&token, "prompt", b"same bytes").expect("second");
        assert_eq!(ref1, ref2);
        assert_eq!(sha1, sha2);
        assert_eq!(ref1, format!("blobs/prompt-{sha1}.txt"));

        let expected = hex::encode(Sha256::digest(b"same bytes"));
        assert_eq!(sha1, expected);

        let entries: Vec<_> = fs::read_dir(w.run_dir().join("blobs"))
            .expect("read blobs")
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn blob_kind_is_sanitized() {
        let temp = tempfile::tempdir().expect("tempdir");
        let w = writer(&temp);
        let token = CancelToken::new();

        let (reference, _) = w
            .write_blob(&token, "Attempt Output!", b"x")
            .expect("blob");
        assert!(reference.starts_with("blobs/attemptoutput-"));

        let (reference, _) = w.write_blob(&token, "///", b"y").expect("blob");
        assert!(reference.starts_with("blobs/blob-"));
    }

    #[test]
    fn cancelled_token_aborts_blob_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let w = writer(&temp);
        let token = CancelToken::new();
        token.cancel();

        assert!(w.write_blob(&token, "prompt", b"never written").is_err());
        let entries: Vec<_> = fs::read_dir(w.run_dir().join("blobs"))
            .expect("read blobs")
            .collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn gate_log_requires_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let w = writer(&temp);
        assert!(w.write_gate_log("", "gate", "text").is_err());
        assert!(w.write_gate_log("stage", "", "text").is_err());
        w.write_gate_log("stage", "gate", "text").expect("write");
        assert!(w.run_dir().join("gates/stage-gate.log").is_file());
    }

    #[test]
    fn stage_record_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let w = writer(&temp);

        let record = StageRecord {
            name: "plan".to_string(),
            adapter: "mock".to_string(),
            model: "m1".to_string(),
            prompt_ref: "blobs/prompt-abc.txt".to_string(),
            output_hash: "deadbeef".to_string(),
            attempts: vec![AttemptRecord {
                attempt: 1,
                succeeded: true,
                workspace_mode: "temp".to_string(),
                ..AttemptRecord::default()
            }],
            ..StageRecord::default()
        };
        w.write_stage(&record).expect("write stage");

        let raw = fs::read_to_string(w.run_dir().join("stages/plan.json")).expect("read");
        let loaded: StageRecord = serde_json::from_str(&raw).expect("parse");
        assert_eq!(loaded, record);
        // 2-space indent.
        assert!(raw.contains("\n  \"name\""));
    }

    #[test]
    fn run_id_has_expected_shape() {
        let id = new_run_id();
        let (stamp, suffix) = id.split_once('-').expect("dash");
        assert_eq!(stamp.len(), 16);
        assert!(stamp.ends_with('Z'));
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
