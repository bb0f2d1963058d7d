//! Command execution policy for command gates.
//!
//! A gate command runs only when it matches the resolved policy: a named
//! capability from the read-only registry, an inline template list, or a
//! legacy exact-command list (compiled to literal templates). Shell
//! invocations are denied unless explicitly approved at runtime, and
//! `{path}` arguments must stay inside the workspace root.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unknown capability {0}")]
    UnknownCapability(String),
}

/// An allowed command shape: a literal exec token plus positional args,
/// where each arg is a literal or one of the closed placeholders
/// `{path}` / `{pkg}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub exec: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(exec: &str, args: &[&str]) -> Self {
        Self {
            exec: exec.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// How the active template set was resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Capability,
    Templates,
    Legacy,
    #[default]
    None,
}

const PKG_WHITELIST: [&str; 3] = ["./...", "./pkg/...", "./cmd/..."];

/// Resolve a capability name against the process-wide registry.
///
/// The registry is a closed, read-only table; gates cannot extend it.
pub fn templates_for_capability(name: &str) -> Result<Vec<CommandTemplate>, PolicyError> {
    let templates = match name {
        "go_test" => vec![
            CommandTemplate::new("go", &["test", "./..."]),
            CommandTemplate::new("go", &["test", "./pkg/..."]),
            CommandTemplate::new("go", &["test", "./cmd/..."]),
        ],
        "go_vet" => vec![CommandTemplate::new("go", &["vet", "./..."])],
        "gofmt" => vec![CommandTemplate::new("gofmt", &["-w", "{path}"])],
        "cargo_test" => vec![
            CommandTemplate::new("cargo", &["test"]),
            CommandTemplate::new("cargo", &["test", "--workspace"]),
        ],
        "cargo_check" => vec![CommandTemplate::new("cargo", &["check"])],
        "rustfmt" => vec![CommandTemplate::new("rustfmt", &["{path}"])],
        _ => return Err(PolicyError::UnknownCapability(name.to_string())),
    };
    Ok(templates)
}

/// The resolved policy a command gate evaluates against.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    pub mode: PolicyMode,
    pub capability: Option<String>,
    pub templates: Vec<CommandTemplate>,
    pub deny_shell: bool,
    pub shell_approved: bool,
    pub workspace_root: PathBuf,
    pub workdir: Option<PathBuf>,
}

impl CommandPolicy {
    /// Return the reason the command must not run, or `None` when allowed.
    ///
    /// Blocked commands never reach the kernel.
    pub fn block_reason(&self, argv: &[String]) -> Option<String> {
        if !self.deny_shell && !self.shell_approved {
            return Some("shell execution requires explicit approval".to_string());
        }
        if self.deny_shell && is_shell_command(argv) {
            return Some("shell execution is denied by policy".to_string());
        }
        if !self.templates.is_empty() {
            return match_templates(
                argv,
                &self.templates,
                &self.workspace_root,
                self.workdir.as_deref(),
            )
            .err();
        }
        None
    }
}

/// `sh -c`, `bash -c`, and `zsh -c` count as shell invocations.
pub fn is_shell_command(argv: &[String]) -> bool {
    if argv.len() < 2 {
        return false;
    }
    matches!(argv[0].as_str(), "sh" | "bash" | "zsh") && argv[1] == "-c"
}

fn match_templates(
    argv: &[String],
    templates: &[CommandTemplate],
    workspace_root: &Path,
    workdir: Option<&Path>,
) -> Result<(), String> {
    let mut last_reason: Option<String> = None;

    'templates: for template in templates {
        if template.exec.is_empty() {
            continue;
        }
        if argv.first().map(String::as_str) != Some(template.exec.as_str()) {
            continue;
        }
        if argv.len() - 1 != template.args.len() {
            continue;
        }
        for (arg, value) in template.args.iter().zip(&argv[1..]) {
            match arg.as_str() {
                "{path}" => {
                    if let Err(reason) = check_path_confined(workdir, workspace_root, value) {
                        last_reason = Some(reason);
                        continue 'templates;
                    }
                }
                "{pkg}" => {
                    if !PKG_WHITELIST.contains(&value.as_str()) {
                        last_reason = Some("package argument not allowed".to_string());
                        continue 'templates;
                    }
                }
                literal => {
                    if value != literal {
                        continue 'templates;
                    }
                }
            }
        }
        return Ok(());
    }

    Err(last_reason.unwrap_or_else(|| "command does not match any allowed template".to_string()))
}

/// Validate a `{path}` argument: relative, no `..`, and resolving inside
/// the workspace root (relative to the gate workdir when one is set).
fn check_path_confined(
    workdir: Option<&Path>,
    workspace_root: &Path,
    arg: &str,
) -> Result<(), String> {
    if workspace_root.as_os_str().is_empty() {
        return Err("workspace root not set".to_string());
    }
    let arg_path = Path::new(arg);
    if arg_path.is_absolute() {
        return Err("absolute paths are not allowed".to_string());
    }
    let cleaned = lexical_clean(arg_path);
    if cleaned.as_os_str().is_empty() {
        return Err("invalid path".to_string());
    }
    if arg_path.components().any(|c| c == Component::ParentDir) {
        return Err("path traversal detected".to_string());
    }

    let root = lexical_clean(workspace_root);
    let base = match workdir {
        Some(dir) => {
            let candidate = if dir.is_absolute() {
                lexical_clean(dir)
            } else {
                lexical_clean(&workspace_root.join(dir))
            };
            if !is_under(&root, &candidate) {
                return Err("workdir not confined: path escapes workspace".to_string());
            }
            candidate
        }
        None => root.clone(),
    };

    let candidate = lexical_clean(&base.join(&cleaned));
    if !is_under(&root, &candidate) {
        return Err("path not confined: path escapes workspace".to_string());
    }
    Ok(())
}

/// Check that `candidate` is `root` or a descendant of it.
pub fn is_under(root: &Path, candidate: &Path) -> bool {
    candidate == root || candidate.starts_with(root)
}

/// Normalize a path lexically: drop `.`, resolve `..` against preceding
/// components. `..` escaping past the start is preserved so confinement
/// checks still see it.
pub fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Compile legacy exact-command entries into literal templates.
///
/// Each entry is whitespace-split; the first field is the exec token.
pub fn templates_from_exact(entries: &[String]) -> Vec<CommandTemplate> {
    entries
        .iter()
        .filter_map(|entry| {
            let mut fields = entry.split_whitespace();
            let exec = fields.next()?;
            Some(CommandTemplate {
                exec: exec.to_string(),
                args: fields.map(|s| s.to_string()).collect(),
            })
        })
        .collect()
}
