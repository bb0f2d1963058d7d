//! Sandboxed application of model output to a workspace root.
//!
//! Output is parsed as a unified diff first, falling back to file blocks.
//! Every target path is joined under the apply root; absolute paths and
//! `..` segments are rejected before anything touches the filesystem.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::diff::{
    apply_hunks, normalize_diff_path, parse_file_blocks, parse_unified_diff, FilePatch,
};
use crate::core::policy::lexical_clean;

/// A target path that would escape the apply root.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid path {path}: {reason}")]
pub struct InvalidPath {
    pub path: String,
    pub reason: String,
}

/// Changes made under the apply root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub applied_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_files: Vec<String>,
    pub used_unified_diff: bool,
}

const DEFAULT_FILE_MODE: u32 = 0o644;

/// Apply either a unified diff or file-block output under `root`.
pub fn apply_output(root: &Path, output: &str) -> Result<ApplyResult> {
    match parse_unified_diff(output) {
        Ok(patches) => apply_patches(root, &patches),
        Err(diff_err) => {
            let files = parse_file_blocks(output);
            if files.is_empty() {
                return Err(diff_err
                    .context("unable to parse output as unified diff or file blocks"));
            }
            apply_file_blocks(root, &files)
        }
    }
}

fn apply_patches(root: &Path, patches: &[FilePatch]) -> Result<ApplyResult> {
    if patches.is_empty() {
        bail!("no patches to apply");
    }

    // Plan every file operation before touching the filesystem so a bad
    // path or context mismatch rejects the whole batch.
    let mut plans = Vec::with_capacity(patches.len());
    for patch in patches {
        plans.push(plan_patch(root, patch)?);
    }

    let mut result = ApplyResult {
        used_unified_diff: true,
        ..ApplyResult::default()
    };
    for plan in plans {
        match plan {
            FileOp::Delete { path, relative } => {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(err).with_context(|| format!("delete {}", path.display()))
                    }
                }
                result.deleted_files.push(relative);
            }
            FileOp::Write {
                path,
                relative,
                content,
                mode,
            } => {
                write_with_mode(&path, &content, mode)?;
                result.applied_files.push(relative);
            }
        }
    }

    Ok(result)
}

fn apply_file_blocks(root: &Path, files: &BTreeMap<String, String>) -> Result<ApplyResult> {
    let mut plans = Vec::with_capacity(files.len());
    for (relative, content) in files {
        let path = safe_join(root, relative)?;
        plans.push(FileOp::Write {
            mode: existing_mode(&path),
            path,
            relative: relative.clone(),
            content: content.clone(),
        });
    }

    let mut result = ApplyResult::default();
    for plan in plans {
        let FileOp::Write {
            path,
            relative,
            content,
            mode,
        } = plan
        else {
            unreachable!("file blocks never delete");
        };
        write_with_mode(&path, &content, mode)?;
        result.applied_files.push(relative);
    }

    Ok(result)
}

enum FileOp {
    Write {
        path: PathBuf,
        relative: String,
        content: String,
        mode: u32,
    },
    Delete {
        path: PathBuf,
        relative: String,
    },
}

fn plan_patch(root: &Path, patch: &FilePatch) -> Result<FileOp> {
    let old_path = normalize_diff_path(&patch.old_path);
    let new_path = normalize_diff_path(&patch.new_path);

    if new_path == "/dev/null" {
        if old_path == "/dev/null" {
            bail!("invalid patch with both paths /dev/null");
        }
        let path = safe_join(root, &old_path)?;
        return Ok(FileOp::Delete {
            path,
            relative: old_path,
        });
    }

    let path = safe_join(root, &new_path)?;
    let original = if old_path == "/dev/null" {
        String::new()
    } else {
        match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        }
    };

    let content = apply_hunks(&original, &patch.hunks)
        .with_context(|| format!("apply patch {new_path}"))?;

    Ok(FileOp::Write {
        mode: existing_mode(&path),
        path,
        relative: new_path,
        content,
    })
}

fn existing_mode(path: &Path) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            return meta.permissions().mode() & 0o777;
        }
    }
    let _ = path;
    DEFAULT_FILE_MODE
}

fn write_with_mode(path: &Path, content: &str, mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("set mode on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Join `rel` under `root`, rejecting anything that could resolve outside.
pub fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let reject = |reason: &str| -> anyhow::Error {
        anyhow!(InvalidPath {
            path: rel.to_string(),
            reason: reason.to_string(),
        })
    };

    if rel.is_empty() {
        return Err(reject("empty path"));
    }
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(reject("absolute paths are not allowed"));
    }
    if rel_path.components().any(|c| c == Component::ParentDir) {
        return Err(reject("path traversal detected"));
    }
    let cleaned = lexical_clean(rel_path);
    if cleaned.as_os_str().is_empty() {
        return Err(reject("invalid path"));
    }

    let root_clean = lexical_clean(root);
    let joined = lexical_clean(&root_clean.join(&cleaned));
    if joined != root_clean && !joined.starts_with(&root_clean) {
        return Err(reject("path escapes workspace"));
    }
    Ok(root.join(cleaned))
}
