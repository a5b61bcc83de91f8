/// Per-file added/removed line counts from a unified diff. The comparison
/// engine uses them to describe how much each changed file moved.
///
/// Also provides a [`DiffSource`] trait that abstracts over different
/// ways to obtain a diff (a file, stdin, git).
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Diff sources
// ---------------------------------------------------------------------------

/// A source for obtaining a unified diff.
pub trait DiffSource {
    /// Fetch the diff text.
    fn fetch_diff(&self) -> Result<String>;
}

/// Diff read from a file on disk.
pub struct FileDiff {
    pub path: PathBuf,
}

impl DiffSource for FileDiff {
    fn fetch_diff(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read diff from {}", self.path.display()))
    }
}

/// Diff from stdin.
pub struct StdinDiff;

impl DiffSource for StdinDiff {
    fn fetch_diff(&self) -> Result<String> {
        std::io::read_to_string(std::io::stdin()).context("Failed to read diff from stdin")
    }
}

/// Diff from a git command (e.g., `git diff HEAD~1`).
pub struct GitDiff {
    /// Arguments to pass to `git diff`.
    pub args: String,
}

impl DiffSource for GitDiff {
    fn fetch_diff(&self) -> Result<String> {
        let diff_args: Vec<&str> = self.args.split_whitespace().collect();
        let output = Command::new("git")
            .arg("diff")
            .args(&diff_args)
            .output()
            .context("Failed to run git diff")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git diff failed: {stderr}");
        }

        String::from_utf8(output.stdout).context("git diff output not valid UTF-8")
    }
}

// ---------------------------------------------------------------------------
// Diff parsing
// ---------------------------------------------------------------------------

/// Lines added and removed in one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDiff {
    pub added: u64,
    pub removed: u64,
}

/// File path -> line counts, as reported by the diff.
pub type LineDiffs = BTreeMap<String, LineDiff>;

/// Parse a unified diff (e.g., `git diff`) into per-file line counts.
/// Deleted files are keyed by their old path.
pub fn line_counts(diff_text: &str) -> LineDiffs {
    let mut result = LineDiffs::new();
    let mut old_path: Option<String> = None;
    let mut current_file: Option<String> = None;
    // Lines still expected in the current hunk, old side and new side.
    // Tracking them keeps "--- "/"+++ " content lines from being read as
    // file headers.
    let mut old_remaining: u32 = 0;
    let mut new_remaining: u32 = 0;

    for line in diff_text.lines() {
        if old_remaining > 0 || new_remaining > 0 {
            let counts = current_file
                .as_ref()
                .map(|file| result.entry(file.clone()).or_default());
            if line.starts_with('\\') {
                // "\ No newline at end of file" is metadata, not a line
            } else if line.starts_with('+') {
                new_remaining = new_remaining.saturating_sub(1);
                if let Some(c) = counts {
                    c.added += 1;
                }
            } else if line.starts_with('-') {
                old_remaining = old_remaining.saturating_sub(1);
                if let Some(c) = counts {
                    c.removed += 1;
                }
            } else {
                // Context line
                old_remaining = old_remaining.saturating_sub(1);
                new_remaining = new_remaining.saturating_sub(1);
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            old_path = header_path(rest);
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            current_file = header_path(rest).or_else(|| old_path.clone());
            if let Some(ref file) = current_file {
                result.entry(file.clone()).or_default();
            }
        } else if line.starts_with("@@ ") {
            if let Some((old_count, new_count)) = parse_hunk_header(line) {
                old_remaining = old_count;
                new_remaining = new_count;
            }
        } else if line.starts_with("diff ") {
            old_path = None;
            current_file = None;
        }
    }

    result
}

/// Path from a `---`/`+++` header, or `None` for `/dev/null`.
fn header_path(rest: &str) -> Option<String> {
    // Some tools append a tab and a timestamp.
    let rest = rest.split('\t').next().unwrap_or(rest).trim_end();
    if rest == "/dev/null" {
        return None;
    }
    // Strip common VCS prefixes: "b/" (default git), "a/" (old side).
    // Also handles --no-prefix diffs where no prefix is present.
    let path = rest
        .strip_prefix("b/")
        .or_else(|| rest.strip_prefix("a/"))
        .unwrap_or(rest);
    Some(path.to_string())
}

/// Parse old and new line counts from a hunk header like "@@ -10,5 +20,8 @@".
/// A missing count means one line.
fn parse_hunk_header(line: &str) -> Option<(u32, u32)> {
    let after_at = line.strip_prefix("@@ ")?;
    let mut parts = after_at.split(' ');
    let old_part = parts.next()?.strip_prefix('-')?;
    let new_part = parts.next()?.strip_prefix('+')?;
    Some((range_count(old_part)?, range_count(new_part)?))
}

fn range_count(range: &str) -> Option<u32> {
    match range.split_once(',') {
        Some((_, count)) => count.parse().ok(),
        None => range.parse::<u32>().ok().map(|_| 1),
    }
}
