//! Temp workspace clones for dry-run applies.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use crate::core::cancel::CancelToken;

/// Subtree skipped during cloning so evidence is never copied into
/// itself.
const EVIDENCE_SUBTREE: [&str; 2] = [".flowgate", "runs"];

/// An exclusively owned temp copy of a workspace.
///
/// The clone is removed when [`TempClone::release`] is called (or on
/// drop, as a backstop). Symlinks in the source become regular files
/// holding the link target's contents; link preservation is out of scope.
#[derive(Debug)]
pub struct TempClone {
    dir: TempDir,
}

impl TempClone {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Deterministically remove the clone.
    pub fn release(self) -> Result<()> {
        self.dir.close().context("remove temp clone")
    }
}

/// Copy every file under `root` into a fresh temp directory, preserving
/// file modes and skipping `<root>/.flowgate/runs`.
pub fn clone_to_temp(root: &Path, token: &CancelToken) -> Result<TempClone> {
    let info = fs::metadata(root)
        .with_context(|| format!("stat workspace {}", root.display()))?;
    if !info.is_dir() {
        bail!("workspace path is not a directory");
    }

    let dir = tempfile::Builder::new()
        .prefix("flowgate-workspace-")
        .tempdir()
        .context("create temp clone dir")?;

    for entry in WalkDir::new(root).follow_links(true) {
        token.check()?;
        let entry = entry.context("walk workspace")?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .context("relative clone path")?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        if should_skip(rel) {
            continue;
        }

        let dest = dir.path().join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("create clone dir {}", dest.display()))?;
            continue;
        }
        copy_file(entry.path(), &dest)?;
    }

    debug!(src = %root.display(), dest = %dir.path().display(), "cloned workspace");
    Ok(TempClone { dir })
}

fn should_skip(rel: &Path) -> bool {
    let mut components = rel.components().map(|c| c.as_os_str());
    components.next() == Some(EVIDENCE_SUBTREE[0].as_ref())
        && components.next() == Some(EVIDENCE_SUBTREE[1].as_ref())
}

fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create clone dir {}", parent.display()))?;
    }
    // fs::copy preserves the permission bits of the source; with
    // follow_links above, a symlinked source copies its resolved contents.
    fs::copy(src, dest)
        .with_context(|| format!("copy {} to {}", src.display(), dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_files_and_subdirectories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("a.txt"), "alpha").expect("write");
        fs::create_dir_all(root.join("sub/dir")).expect("mkdir");
        fs::write(root.join("sub/dir/b.txt"), "beta").expect("write");

        let clone = clone_to_temp(root, &CancelToken::new()).expect("clone");
        assert_eq!(
            fs::read_to_string(clone.path().join("a.txt")).expect("read"),
            "alpha"
        );
        assert_eq!(
            fs::read_to_string(clone.path().join("sub/dir/b.txt")).expect("read"),
            "beta"
        );

        let path = clone.path().to_path_buf();
        clone.release().expect("release");
        assert!(!path.exists());
    }

    #[test]
    fn skips_evidence_subtree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join(".flowgate/runs/run-1")).expect("mkdir");
        fs::write(root.join(".flowgate/runs/run-1/run.json"), "{}").expect("write");
        fs::write(root.join(".flowgate/config.yaml"), "x").expect("write");
        fs::write(root.join("keep.txt"), "keep").expect("write");

        let clone = clone_to_temp(root, &CancelToken::new()).expect("clone");
        assert!(clone.path().join("keep.txt").exists());
        assert!(clone.path().join(".flowgate/config.yaml").exists());
        assert!(!clone.path().join(".flowgate/runs").exists());
    }

    #[cfg(unix)]
    #[test]
    fn preserves_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let script = root.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").expect("write");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");

        let clone = clone_to_temp(root, &CancelToken::new()).expect("clone");
        let mode = fs::metadata(clone.path().join("run.sh"))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_become_regular_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("target.txt"), "contents").expect("write");
        std::os::unix::fs::symlink(root.join("target.txt"), root.join("link.txt"))
            .expect("symlink");

        let clone = clone_to_temp(root, &CancelToken::new()).expect("clone");
        let link = clone.path().join("link.txt");
        assert!(!link.symlink_metadata().expect("meta").file_type().is_symlink());
        assert_eq!(fs::read_to_string(link).expect("read"), "contents");
    }

    #[test]
    fn non_directory_root_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("file.txt");
        fs::write(&file, "x").expect("write");
        assert!(clone_to_temp(&file, &CancelToken::new()).is_err());
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "x").expect("write");
        let token = CancelToken::new();
        token.cancel();
        assert!(clone_to_temp(temp.path(), &token).is_err());
    }
}
