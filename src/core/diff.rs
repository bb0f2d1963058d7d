//! Unified diff parsing and file-block extraction.
//!
//! Parsing and hunk application are pure string transforms; writing the
//! results into a workspace lives in `io::apply`.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};

/// A unified diff for a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<Hunk>,
}

/// One `@@`-delimited hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
    pub lines: Vec<String>,
}

/// Parse a unified diff into per-file patches.
///
/// Consumes `--- old` / `+++ new` pairs followed by `@@` hunks. Lines
/// starting with `\` (no-newline markers) are dropped. Errors when the
/// input contains no diff content at all.
pub fn parse_unified_diff(input: &str) -> Result<Vec<FilePatch>> {
    let lines: Vec<&str> = input.split('\n').collect();
    let mut patches = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        if !lines[i].starts_with("--- ") {
            i += 1;
            continue;
        }

        let old_path = parse_diff_path(lines[i]);
        i += 1;
        if i >= lines.len() || !lines[i].starts_with("+++ ") {
            bail!("expected +++ after --- for {old_path}");
        }
        let new_path = parse_diff_path(lines[i]);
        i += 1;

        let mut patch = FilePatch {
            old_path,
            new_path,
            hunks: Vec::new(),
        };
        while i < lines.len() && lines[i].starts_with("@@") {
            let (hunk, next) = parse_hunk(&lines, i)?;
            patch.hunks.push(hunk);
            i = next;
        }

        patches.push(patch);
    }

    if patches.is_empty() {
        bail!("no unified diff content found");
    }
    Ok(patches)
}

fn parse_diff_path(line: &str) -> String {
    let trimmed = line
        .trim_start_matches("---")
        .trim_start_matches("+++")
        .trim();
    trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Strip the `a/` / `b/` prefixes git puts on diff paths.
pub fn normalize_diff_path(path: &str) -> String {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix("a/").unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix("b/").unwrap_or(trimmed);
    trimmed.to_string()
}

fn parse_hunk(lines: &[&str], start: usize) -> Result<(Hunk, usize)> {
    let (old_start, old_lines, new_start, new_lines) = parse_hunk_header(lines[start])?;
    let mut hunk = Hunk {
        old_start,
        old_lines,
        new_start,
        new_lines,
        lines: Vec::new(),
    };

    let mut i = start + 1;
    while i < lines.len() {
        if lines[i].starts_with("@@") || lines[i].starts_with("--- ") {
            break;
        }
        if lines[i].starts_with('\\') {
            i += 1;
            continue;
        }
        hunk.lines.push(lines[i].to_string());
        i += 1;
    }

    Ok((hunk, i))
}

fn parse_hunk_header(line: &str) -> Result<(usize, usize, usize, usize)> {
    let body = line
        .strip_prefix("@@")
        .ok_or_else(|| anyhow!("invalid hunk header: {line}"))?;
    let body = body.trim().trim_end_matches("@@").trim();
    let mut fields = body.split_whitespace();
    let old = fields
        .next()
        .ok_or_else(|| anyhow!("invalid hunk header: {line}"))?;
    let new = fields
        .next()
        .ok_or_else(|| anyhow!("invalid hunk header: {line}"))?;

    let (old_start, old_lines) = parse_hunk_range(old, '-')?;
    let (new_start, new_lines) = parse_hunk_range(new, '+')?;
    Ok((old_start, old_lines, new_start, new_lines))
}

fn parse_hunk_range(value: &str, prefix: char) -> Result<(usize, usize)> {
    let body = value
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow!("invalid hunk range: {value}"))?;
    let mut parts = body.splitn(2, ',');
    let start: usize = parts
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|_| anyhow!("invalid hunk start: {value}"))?;
    let lines = match parts.next() {
        Some(count) => count
            .parse()
            .map_err(|_| anyhow!("invalid hunk length: {value}"))?,
        None => 1,
    };
    Ok((start, lines))
}

/// Apply hunks in order to the original content.
///
/// Context and deletion lines must match the original exactly; a mismatch
/// is an error rather than a fuzzy re-anchor. A literal-empty hunk line is
/// never an insertion: it matches (and consumes) an empty original line
/// when one is at the cursor, and is otherwise dropped. LLM-emitted diffs
/// produce such lines both as blank context with the leading space
/// trimmed and as split artifacts after the final hunk; unconditionally
/// inserting them would push blank lines into the middle of files. A
/// trailing newline on the original is preserved, so a context-only diff
/// is byte-identical.
pub fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String> {
    let old_lines = split_lines(original);
    let mut new_lines: Vec<String> = Vec::new();

    let mut index = 0usize;
    for hunk in hunks {
        let target = hunk.old_start.saturating_sub(1);
        if target > old_lines.len() {
            bail!("hunk starts beyond file length");
        }
        if target < index {
            bail!("hunk overlaps previously applied hunk");
        }
        new_lines.extend(old_lines[index..target].iter().cloned());
        index = target;

        for line in &hunk.lines {
            let mut chars = line.chars();
            let Some(marker) = chars.next() else {
                if index < old_lines.len() && old_lines[index].is_empty() {
                    new_lines.push(String::new());
                    index += 1;
                }
                continue;
            };
            let text = chars.as_str();
            match marker {
                ' ' => {
                    if index >= old_lines.len() || old_lines[index] != text {
                        bail!("context mismatch: {text}");
                    }
                    new_lines.push(text.to_string());
                    index += 1;
                }
                '-' => {
                    if index >= old_lines.len() || old_lines[index] != text {
                        bail!("delete mismatch: {text}");
                    }
                    index += 1;
                }
                '+' => new_lines.push(text.to_string()),
                _ => bail!("invalid hunk line: {line}"),
            }
        }
    }

    new_lines.extend(old_lines[index..].iter().cloned());
    let mut updated = new_lines.join("\n");
    if original.ends_with('\n') && !updated.is_empty() {
        updated.push('\n');
    }
    Ok(updated)
}

fn split_lines(content: &str) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    let trimmed = content.strip_suffix('\n').unwrap_or(content);
    trimmed.split('\n').map(|s| s.to_string()).collect()
}

/// Extract `// file: path`-style blocks from model output.
///
/// Recognized markers: `// file:`, `// File:`, `# file:`, `# File:`,
/// `/* file: ... */`, `<!-- file: ... -->`. Content between markers is
/// the file body, trimmed of one trailing newline. Returns an ordered
/// map so application order is deterministic.
pub fn parse_file_blocks(content: &str) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    let mut current_file: Option<String> = None;
    let mut current_content = String::new();

    for line in content.split('\n') {
        if let Some(path) = extract_file_path(line) {
            if let Some(file) = current_file.take() {
                files.insert(file, take_body(&mut current_content));
            }
            current_file = Some(path);
            current_content.clear();
            continue;
        }
        if current_file.is_some() {
            current_content.push_str(line);
            current_content.push('\n');
        }
    }

    if let Some(file) = current_file {
        files.insert(file, take_body(&mut current_content));
    }

    files
}

fn take_body(content: &mut String) -> String {
    let body = content.strip_suffix('\n').unwrap_or(content).to_string();
    content.clear();
    body
}

fn extract_file_path(line: &str) -> Option<String> {
    const PREFIXES: [&str; 6] = [
        "// file:", "// File:", "# file:", "# File:", "/* file:", "<!-- file:",
    ];
    let line = line.trim();
    for prefix in PREFIXES {
        if let Some(rest) = line.strip_prefix(prefix) {
            let path = rest
                .trim()
                .trim_end_matches("*/")
                .trim_end_matches("-->")
                .trim();
            if path.is_empty() {
                return None;
            }
            return Some(path.to_string());
        }
    }
    None
}
