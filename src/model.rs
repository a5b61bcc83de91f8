//! Uniform in-memory representation of coverage measurements. The upstream
//! parser produces a `CoverageSnapshot`; the store persists it as a
//! `HistoryRecord` keyed by `(branch, commit_sha)`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CovtrendError, Result};

/// Allowed drift between a reported percentage and the one implied by the
/// statement counts.
const PERCENTAGE_TOLERANCE: f64 = 0.01;

/// Compute a coverage rate, returning 0.0 when the total is zero.
#[must_use]
pub fn rate(covered: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64
    }
}

/// Same as [`rate`], scaled to 0–100.
#[must_use]
pub fn percentage(covered: u64, total: u64) -> f64 {
    rate(covered, total) * 100.0
}

/// Statement coverage for a single source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCoverage {
    pub path: String,
    pub total_statements: u64,
    pub covered_statements: u64,
}

impl FileCoverage {
    pub fn new(path: impl Into<String>, total_statements: u64, covered_statements: u64) -> Self {
        Self {
            path: path.into(),
            total_statements,
            covered_statements,
        }
    }

    #[must_use]
    pub fn percentage(&self) -> f64 {
        percentage(self.covered_statements, self.total_statements)
    }
}

/// One coverage measurement for a commit on a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    pub percentage: f64,
    pub total_statements: u64,
    pub covered_statements: u64,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub commit_url: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Per-file breakdown. Empty when the producer only reported totals.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileCoverage>,
}

impl CoverageSnapshot {
    /// Snapshot from statement counts, stamped with the current time.
    pub fn new(covered_statements: u64, total_statements: u64) -> Self {
        Self {
            percentage: percentage(covered_statements, total_statements),
            total_statements,
            covered_statements,
            branch: String::new(),
            commit_sha: String::new(),
            commit_url: String::new(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            files: Vec::new(),
        }
    }

    /// Snapshot whose totals are the sum of the given files.
    pub fn from_files(files: Vec<FileCoverage>) -> Self {
        let total = files.iter().map(|f| f.total_statements).sum();
        let covered = files.iter().map(|f| f.covered_statements).sum();
        Self {
            files,
            ..Self::new(covered, total)
        }
    }

    /// The zero-valued stand-in used when a comparison has no baseline.
    pub fn empty_baseline() -> Self {
        Self {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            ..Self::new(0, 0)
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_commit(mut self, commit_sha: impl Into<String>) -> Self {
        self.commit_sha = commit_sha.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            branch: self.branch.clone(),
            commit_sha: self.commit_sha.clone(),
        }
    }

    /// Reject snapshots that break the statement-count invariants or lack
    /// the identity needed to persist them.
    pub fn validate(&self) -> Result<()> {
        if self.branch.trim().is_empty() {
            return Err(CovtrendError::Validation("branch is required".into()));
        }
        if self.commit_sha.trim().is_empty() {
            return Err(CovtrendError::Validation("commit SHA is required".into()));
        }
        if self.covered_statements > self.total_statements {
            return Err(CovtrendError::Validation(format!(
                "covered statements ({}) exceed total statements ({})",
                self.covered_statements, self.total_statements
            )));
        }
        if !self.percentage.is_finite() || !(0.0..=100.0).contains(&self.percentage) {
            return Err(CovtrendError::Validation(format!(
                "percentage {} is outside 0-100",
                self.percentage
            )));
        }
        let expected = percentage(self.covered_statements, self.total_statements);
        if (self.percentage - expected).abs() > PERCENTAGE_TOLERANCE {
            return Err(CovtrendError::Validation(format!(
                "percentage {:.2} does not match {}/{} statements ({:.2})",
                self.percentage, self.covered_statements, self.total_statements, expected
            )));
        }
        if let Some(f) = self
            .files
            .iter()
            .find(|f| f.covered_statements > f.total_statements)
        {
            return Err(CovtrendError::Validation(format!(
                "file '{}': covered statements ({}) exceed total ({})",
                f.path, f.covered_statements, f.total_statements
            )));
        }
        Ok(())
    }
}

/// Identity of a record: two records with the same key describe the same
/// logical measurement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub branch: String,
    pub commit_sha: String,
}

/// A snapshot as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(flatten)]
    pub snapshot: CoverageSnapshot,
    /// Wall-clock time the record unit was written.
    pub recorded_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(snapshot: CoverageSnapshot, recorded_at: DateTime<Utc>) -> Self {
        Self {
            snapshot,
            recorded_at,
        }
    }

    #[must_use]
    pub fn key(&self) -> RecordKey {
        self.snapshot.key()
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.snapshot.timestamp
    }

    #[must_use]
    pub fn percentage(&self) -> f64 {
        self.snapshot.percentage
    }

    /// Total order deciding which of two records for the same key wins.
    /// The newer timestamp wins; the remaining fields only break exact ties
    /// so the choice never depends on which side a record came from.
    #[must_use]
    pub fn precedence(&self, other: &Self) -> Ordering {
        let a = &self.snapshot;
        let b = &other.snapshot;
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| self.recorded_at.cmp(&other.recorded_at))
            .then_with(|| a.percentage.total_cmp(&b.percentage))
            .then_with(|| a.covered_statements.cmp(&b.covered_statements))
            .then_with(|| a.total_statements.cmp(&b.total_statements))
            .then_with(|| a.commit_url.cmp(&b.commit_url))
            .then_with(|| a.metadata.cmp(&b.metadata))
            .then_with(|| a.files.iter().map(file_key).cmp(b.files.iter().map(file_key)))
    }
}

fn file_key(f: &FileCoverage) -> (&str, u64, u64) {
    (&f.path, f.total_statements, f.covered_statements)
}
