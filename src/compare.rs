//! Structured diff between a base and a head coverage snapshot, used to gate
//! merges and to drive pull-request reports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CompareConfig;
use crate::diff::{LineDiff, LineDiffs};
use crate::model::{percentage, CoverageSnapshot};
use crate::paths::{is_segment_suffix, PathNormalizer};
use crate::trend::Direction;

/// Differences within this many points are float noise.
pub const STABLE_EPSILON: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Magnitude {
    Minor,
    Moderate,
    Major,
}

impl Magnitude {
    pub fn as_str(&self) -> &'static str {
        match self {
            Magnitude::Minor => "minor",
            Magnitude::Moderate => "moderate",
            Magnitude::Major => "major",
        }
    }
}

impl std::fmt::Display for Magnitude {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendLabel {
    pub direction: Direction,
    pub magnitude: Magnitude,
}

/// Label an overall coverage difference.
#[must_use]
pub fn classify(difference: f64) -> TrendLabel {
    let direction = if difference > STABLE_EPSILON {
        Direction::Up
    } else if difference < -STABLE_EPSILON {
        Direction::Down
    } else {
        Direction::Stable
    };
    let size = difference.abs();
    let magnitude = if size < 1.0 {
        Magnitude::Minor
    } else if size <= 5.0 {
        Magnitude::Moderate
    } else {
        Magnitude::Major
    };
    TrendLabel {
        direction,
        magnitude,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Present on both sides.
    Modified,
    /// Only in head.
    Added,
    /// Only in base. Listed for visibility, never a regression.
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Baseline {
    Available,
    /// No base snapshot was supplied; base figures are zero placeholders.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub filename: String,
    pub base_coverage: f64,
    pub head_coverage: f64,
    pub difference: f64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub is_significant: bool,
    pub status: FileStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub base_coverage: CoverageSnapshot,
    pub head_coverage: CoverageSnapshot,
    /// `head - base` in percentage points; 0 without a baseline.
    pub difference: f64,
    /// Ordered by filename.
    pub file_changes: Vec<FileChange>,
    /// Largest movers first.
    pub significant_files: Vec<String>,
    pub trend: TrendLabel,
    pub baseline: Baseline,
}

impl ComparisonResult {
    /// Whether coverage dropped by at least `threshold` points overall or in
    /// any file present on both sides. Always false without a baseline.
    #[must_use]
    pub fn has_regression(&self, threshold: f64) -> bool {
        if self.baseline == Baseline::Unavailable {
            return false;
        }
        let dropped = |d: f64| d < -STABLE_EPSILON && -d >= threshold;
        dropped(self.difference)
            || self
                .file_changes
                .iter()
                .any(|f| f.status == FileStatus::Modified && dropped(f.difference))
    }

    #[must_use]
    pub fn file(&self, filename: &str) -> Option<&FileChange> {
        self.file_changes.iter().find(|f| f.filename == filename)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    total: u64,
    covered: u64,
}

impl Counts {
    fn percentage(self) -> f64 {
        percentage(self.covered, self.total)
    }
}

/// Compares snapshots under one set of thresholds.
#[derive(Debug, Clone)]
pub struct Comparator {
    config: CompareConfig,
    normalizer: PathNormalizer,
}

impl Comparator {
    pub fn new(config: CompareConfig) -> Self {
        let normalizer = PathNormalizer::new(&config.strip_prefixes);
        Self { config, normalizer }
    }

    pub fn config(&self) -> &CompareConfig {
        &self.config
    }

    /// Compare `head` against `base`. A missing base yields a result marked
    /// [`Baseline::Unavailable`] rather than a misleading jump from zero.
    #[must_use]
    pub fn compare(
        &self,
        base: Option<&CoverageSnapshot>,
        head: &CoverageSnapshot,
        line_diffs: Option<&LineDiffs>,
    ) -> ComparisonResult {
        let (base_snapshot, baseline) = match base {
            Some(b) => (b.clone(), Baseline::Available),
            None => (CoverageSnapshot::empty_baseline(), Baseline::Unavailable),
        };
        let difference = match baseline {
            Baseline::Available => head.percentage - base_snapshot.percentage,
            Baseline::Unavailable => 0.0,
        };

        let mut base_files = self.file_map(&base_snapshot);
        let mut head_files = self.file_map(head);
        reconcile_keys(&mut base_files, &mut head_files);

        let line_diffs: BTreeMap<String, LineDiff> = line_diffs
            .map(|diffs| {
                let keys = self.normalizer.normalize_all(diffs.keys().map(String::as_str));
                keys.into_iter().zip(diffs.values().copied()).collect()
            })
            .unwrap_or_default();

        let mut file_changes = Vec::with_capacity(head_files.len());
        for (name, &h) in &head_files {
            let line_diff = lookup_line_diff(&line_diffs, name);
            let change = match base_files.get(name) {
                Some(&b) => {
                    let d = line_diff.unwrap_or_default();
                    self.file_change(name, FileStatus::Modified, b.percentage(), h.percentage(), d, baseline)
                }
                None => {
                    let d = LineDiff {
                        added: line_diff.map_or(h.total, |d| d.added),
                        removed: 0,
                    };
                    self.file_change(name, FileStatus::Added, 0.0, h.percentage(), d, baseline)
                }
            };
            file_changes.push(change);
        }
        for (name, &b) in base_files.iter().filter(|(k, _)| !head_files.contains_key(*k)) {
            let line_diff = lookup_line_diff(&line_diffs, name);
            let d = LineDiff {
                added: 0,
                removed: line_diff.map_or(b.total, |d| d.removed),
            };
            file_changes.push(self.file_change(name, FileStatus::Removed, b.percentage(), 0.0, d, baseline));
        }
        file_changes.sort_by(|a, b| a.filename.cmp(&b.filename));

        let significant_files = self.significant_files(&file_changes);

        ComparisonResult {
            base_coverage: base_snapshot,
            head_coverage: head.clone(),
            difference,
            file_changes,
            significant_files,
            trend: classify(difference),
            baseline,
        }
    }

    fn file_change(
        &self,
        filename: &str,
        status: FileStatus,
        base_coverage: f64,
        head_coverage: f64,
        lines: LineDiff,
        baseline: Baseline,
    ) -> FileChange {
        let difference = match baseline {
            Baseline::Available => head_coverage - base_coverage,
            Baseline::Unavailable => 0.0,
        };
        let is_significant = difference.abs() >= self.config.significant_threshold
            || (status == FileStatus::Added && head_coverage < self.config.acceptable_threshold)
            || (status == FileStatus::Removed && base_coverage > 0.0);

        FileChange {
            filename: filename.to_string(),
            base_coverage,
            head_coverage,
            difference,
            lines_added: lines.added,
            lines_removed: lines.removed,
            is_significant,
            status,
        }
    }

    fn significant_files(&self, changes: &[FileChange]) -> Vec<String> {
        let mut significant: Vec<&FileChange> = changes.iter().filter(|f| f.is_significant).collect();
        significant.sort_by(|a, b| {
            b.difference
                .abs()
                .total_cmp(&a.difference.abs())
                .then_with(|| a.filename.cmp(&b.filename))
        });
        if self.config.max_significant_files > 0 {
            significant.truncate(self.config.max_significant_files);
        }
        significant.into_iter().map(|f| f.filename.clone()).collect()
    }

    /// Per-file counts keyed by normalized path. Entries that normalize to
    /// the same key are summed.
    fn file_map(&self, snapshot: &CoverageSnapshot) -> BTreeMap<String, Counts> {
        let keys = self
            .normalizer
            .normalize_all(snapshot.files.iter().map(|f| f.path.as_str()));
        let mut files: BTreeMap<String, Counts> = BTreeMap::new();
        for (file, key) in snapshot.files.iter().zip(keys) {
            if key.is_empty() {
                continue;
            }
            let counts = files.entry(key).or_default();
            if counts.total > 0 {
                debug!(path = %file.path, "Combining coverage entries with the same normalized path");
            }
            counts.total += file.total_statements;
            counts.covered += file.covered_statements;
        }
        files
    }
}

/// Pair up keys that exist on only one side when exactly one candidate on
/// the other side shares a whole-segment suffix with it, e.g. an absolute
/// runner path against a repository-relative one. The shorter key is kept.
fn reconcile_keys(base: &mut BTreeMap<String, Counts>, head: &mut BTreeMap<String, Counts>) {
    let base_only: Vec<String> = base.keys().filter(|k| !head.contains_key(*k)).cloned().collect();
    let head_only: Vec<String> = head.keys().filter(|k| !base.contains_key(*k)).cloned().collect();
    if base_only.is_empty() || head_only.is_empty() {
        return;
    }

    let related = |a: &str, b: &str| is_segment_suffix(a, b) || is_segment_suffix(b, a);

    for b in &base_only {
        let mut candidates = head_only.iter().filter(|h| related(b, h));
        let (Some(h), None) = (candidates.next(), candidates.next()) else {
            continue;
        };
        if base_only.iter().filter(|other| related(other, h)).count() != 1 {
            continue;
        }

        if b.len() <= h.len() {
            if let Some(counts) = head.remove(h) {
                head.insert(b.clone(), counts);
            }
        } else if let Some(counts) = base.remove(b) {
            base.insert(h.clone(), counts);
        }
        debug!(base = %b, head = %h, "Matched file paths by suffix");
    }
}

fn lookup_line_diff(diffs: &BTreeMap<String, LineDiff>, name: &str) -> Option<LineDiff> {
    if let Some(d) = diffs.get(name) {
        return Some(*d);
    }
    let mut matches = diffs
        .iter()
        .filter(|(path, _)| is_segment_suffix(path, name) || is_segment_suffix(name, path));
    match (matches.next(), matches.next()) {
        (Some((_, d)), None) => Some(*d),
        _ => None,
    }
}
