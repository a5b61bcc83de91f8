//! Append-only history store: one JSON unit per record, grouped into a
//! directory per branch.
//!
//! Layout:
//!
//! ```text
//! <root>/branches/<slug>-<hash>/meta.json
//! <root>/branches/<slug>-<hash>/records/<millis>-<commit-hash>.json
//! ```
//!
//! Writers never touch each other's files, so independent processes can
//! record into the same root without locking. Unit names are derived from
//! `(branch, commit, timestamp)` and created with no-clobber semantics, which
//! makes a duplicate concurrent write a no-op. `meta.json` is a cache and is
//! never trusted over a re-scan of `records/`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::HistoryConfig;
use crate::error::{CovtrendError, Result};
use crate::model::{CoverageSnapshot, HistoryRecord};
use crate::retention::{days_before, select_expired, RetentionPolicy};

const BRANCHES_DIR: &str = "branches";
const RECORDS_DIR: &str = "records";
const META_FILE: &str = "meta.json";
const UNIT_EXT: &str = "json";

/// Hex digits of SHA-256 kept in namespace and unit names.
const HASH_LEN: usize = 16;
const MAX_SLUG_LEN: usize = 48;

/// Metadata key used to group statistics by project.
pub const PROJECT_METADATA_KEY: &str = "project";

/// Overrides applied to a snapshot before it is recorded.
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub commit_url: Option<String>,
    /// Merged over the snapshot's own metadata.
    pub metadata: BTreeMap<String, String>,
}

/// Cached aggregate for one branch namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NamespaceMeta {
    branch: String,
    record_count: usize,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Aggregate view over every branch in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub total_entries: usize,
    /// Bytes on disk across record units and namespace metadata.
    pub storage_size: u64,
    pub branches: BTreeMap<String, usize>,
    pub projects: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub by_branch: BTreeMap<String, usize>,
}

/// A record unit located by directory listing, before it is read.
#[derive(Debug, Clone)]
struct Unit {
    path: PathBuf,
    millis: i64,
    commit_hash: String,
}

impl Unit {
    fn timestamp(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Directory-backed history store.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    root: PathBuf,
    config: HistoryConfig,
}

impl HistoryStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, config: HistoryConfig) -> Result<Self> {
        let root = root.into();
        let branches = root.join(BRANCHES_DIR);
        fs::create_dir_all(&branches).map_err(|e| CovtrendError::storage(&branches, e))?;
        Ok(Self { root, config })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Persist one snapshot as a new record unit.
    pub fn record(
        &self,
        mut snapshot: CoverageSnapshot,
        options: RecordOptions,
        cancel: &CancellationToken,
    ) -> Result<HistoryRecord> {
        cancel.checkpoint()?;

        if let Some(branch) = options.branch {
            snapshot.branch = branch;
        }
        if let Some(sha) = options.commit_sha {
            snapshot.commit_sha = sha;
        }
        if let Some(url) = options.commit_url {
            snapshot.commit_url = url;
        }
        snapshot.metadata.extend(options.metadata);
        snapshot.validate()?;

        let record = HistoryRecord::new(snapshot, Utc::now());
        self.write_unit(&record, cancel)?;

        if self.config.auto_cleanup {
            if let Err(e) = self.cleanup_branch(&record.snapshot.branch, cancel) {
                warn!(branch = %record.snapshot.branch, error = %e, "Automatic cleanup failed");
            }
        }

        Ok(record)
    }

    /// Persist a record that already exists elsewhere (e.g. restored from a
    /// previous run), keeping its original `recorded_at`. Returns `false` if
    /// an identical unit was already present. Never triggers cleanup.
    pub fn import(&self, record: &HistoryRecord, cancel: &CancellationToken) -> Result<bool> {
        cancel.checkpoint()?;
        record.snapshot.validate()?;
        self.write_unit(record, cancel)
    }

    /// Write one record unit with create-if-absent semantics.
    fn write_unit(&self, record: &HistoryRecord, cancel: &CancellationToken) -> Result<bool> {
        let branch = &record.snapshot.branch;
        let namespace = self.namespace_dir(branch);
        let records_dir = namespace.join(RECORDS_DIR);
        fs::create_dir_all(&records_dir).map_err(|e| CovtrendError::storage(&records_dir, e))?;

        let path = records_dir.join(unit_name(&record.snapshot));
        let bytes = serde_json::to_vec_pretty(record)?;

        let mut tmp = NamedTempFile::new_in(&records_dir)
            .map_err(|e| CovtrendError::storage(&records_dir, e))?;
        tmp.write_all(&bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| CovtrendError::storage(tmp.path(), e))?;

        // Last chance to back out; dropping `tmp` removes the partial file.
        cancel.checkpoint()?;

        let created = match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!(path = %path.display(), "Recorded history unit");
                true
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "History unit already present");
                false
            }
            Err(e) => return Err(CovtrendError::storage(&path, e.error)),
        };

        if created {
            if let Err(e) = self.refresh_meta(&namespace, branch) {
                warn!(branch = %branch, error = %e, "Failed to update namespace metadata");
            }
        }
        Ok(created)
    }

    /// The record with the greatest timestamp on `branch`.
    pub fn get_latest_entry(
        &self,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<HistoryRecord> {
        cancel.checkpoint()?;
        let mut units = list_units(&self.namespace_dir(branch))?;
        units.sort_by(|a, b| (b.millis, &b.path).cmp(&(a.millis, &a.path)));

        for unit in &units {
            cancel.checkpoint()?;
            match read_unit(&unit.path, branch) {
                Ok(record) => return Ok(record),
                Err(e) => warn!(path = %unit.path.display(), error = %e, "Skipping unreadable history unit"),
            }
        }
        Err(CovtrendError::NotFound(format!(
            "no history for branch '{branch}'"
        )))
    }

    /// Records on `branch` from the last `since_days` days (0 = all), oldest
    /// first. Records superseded by a newer one for the same commit are left
    /// out. Units are read lazily while iterating.
    pub fn query(
        &self,
        branch: &str,
        since_days: u32,
        cancel: &CancellationToken,
    ) -> Result<Query> {
        cancel.checkpoint()?;
        let units = list_units(&self.namespace_dir(branch))?;

        let cutoff = days_before(Utc::now(), since_days).map(|c| c.timestamp_millis());

        let mut latest: HashMap<String, Unit> = HashMap::new();
        for unit in units {
            if cutoff.is_some_and(|c| unit.millis < c) {
                continue;
            }
            let newer = latest
                .get(&unit.commit_hash)
                .map_or(true, |existing| unit.millis > existing.millis);
            if newer {
                latest.insert(unit.commit_hash.clone(), unit);
            }
        }

        let mut units: Vec<Unit> = latest.into_values().collect();
        units.sort_by(|a, b| (a.millis, &a.path).cmp(&(b.millis, &b.path)));

        Ok(Query {
            branch: branch.to_string(),
            paths: units.into_iter().map(|u| u.path).collect(),
            cancel: cancel.clone(),
        })
    }

    /// Names of all branches with a namespace in the store.
    pub fn branches(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for dir in self.namespaces()? {
            cancel.checkpoint()?;
            if let Some(name) = namespace_branch(&dir) {
                names.push(name);
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Re-scan every namespace and aggregate counts, sizes and time bounds.
    pub fn get_statistics(&self, cancel: &CancellationToken) -> Result<StoreStatistics> {
        let mut stats = StoreStatistics::default();

        for dir in self.namespaces()? {
            cancel.checkpoint()?;
            if let Ok(meta) = fs::metadata(dir.join(META_FILE)) {
                stats.storage_size += meta.len();
            }

            for unit in list_units(&dir)? {
                cancel.checkpoint()?;
                match fs::metadata(&unit.path) {
                    Ok(meta) => stats.storage_size += meta.len(),
                    // Removed by a concurrent cleanup.
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(CovtrendError::storage(&unit.path, e)),
                }

                let record = match read_record(&unit.path) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(path = %unit.path.display(), error = %e, "Skipping unreadable history unit");
                        continue;
                    }
                };

                let snapshot = &record.snapshot;
                stats.total_entries += 1;
                *stats.branches.entry(snapshot.branch.clone()).or_default() += 1;
                if let Some(project) = snapshot.metadata.get(PROJECT_METADATA_KEY) {
                    *stats.projects.entry(project.clone()).or_default() += 1;
                }
                let ts = snapshot.timestamp;
                stats.oldest = Some(stats.oldest.map_or(ts, |o| o.min(ts)));
                stats.newest = Some(stats.newest.map_or(ts, |n| n.max(ts)));
            }
        }

        Ok(stats)
    }

    /// Apply the retention policy to every branch.
    pub fn cleanup(&self, cancel: &CancellationToken) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for dir in self.namespaces()? {
            let branch = namespace_branch(&dir);
            let removed = self.cleanup_namespace(&dir, branch.as_deref(), cancel)?;
            if removed > 0 {
                let name = branch.unwrap_or_else(|| dir_name(&dir));
                *report.by_branch.entry(name).or_default() += removed;
                report.removed += removed;
            }
        }
        if report.removed > 0 {
            info!(removed = report.removed, "Cleanup complete");
        }
        Ok(report)
    }

    /// Apply the retention policy to a single branch.
    pub fn cleanup_branch(&self, branch: &str, cancel: &CancellationToken) -> Result<CleanupReport> {
        let dir = self.namespace_dir(branch);
        let removed = self.cleanup_namespace(&dir, Some(branch), cancel)?;
        let mut report = CleanupReport::default();
        if removed > 0 {
            report.removed = removed;
            report.by_branch.insert(branch.to_string(), removed);
        }
        Ok(report)
    }

    fn cleanup_namespace(
        &self,
        dir: &Path,
        branch: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        cancel.checkpoint()?;
        let units = list_units(dir)?;
        if units.is_empty() {
            return Ok(0);
        }

        let timestamps: Vec<DateTime<Utc>> = units.iter().map(Unit::timestamp).collect();
        let policy = RetentionPolicy::from(&self.config);
        let expired = select_expired(&timestamps, &policy, Utc::now());

        let mut removed = 0;
        for i in expired {
            cancel.checkpoint()?;
            let path = &units[i].path;
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed expired history unit");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CovtrendError::storage(path, e)),
            }
        }

        if removed > 0 {
            if let Some(branch) = branch {
                if let Err(e) = self.refresh_meta(dir, branch) {
                    warn!(branch = %branch, error = %e, "Failed to update namespace metadata");
                }
            }
        }
        Ok(removed)
    }

    fn namespace_dir(&self, branch: &str) -> PathBuf {
        self.root.join(BRANCHES_DIR).join(namespace_name(branch))
    }

    fn namespaces(&self) -> Result<Vec<PathBuf>> {
        let dir = self.root.join(BRANCHES_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CovtrendError::storage(&dir, e)),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CovtrendError::storage(&dir, e))?;
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Rewrite the cached aggregate for a namespace from a fresh listing.
    fn refresh_meta(&self, dir: &Path, branch: &str) -> Result<()> {
        let path = dir.join(META_FILE);
        let now = Utc::now();
        let created_at = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<NamespaceMeta>(&bytes).ok())
            .map_or(now, |m| m.created_at);

        let meta = NamespaceMeta {
            branch: branch.to_string(),
            record_count: list_units(dir)?.len(),
            created_at,
            updated_at: now,
        };

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| CovtrendError::storage(dir, e))?;
        serde_json::to_writer_pretty(&mut tmp, &meta)?;
        tmp.persist(&path)
            .map_err(|e| CovtrendError::storage(&path, e.error))?;
        Ok(())
    }
}

/// A finite, restartable view over the records matched by
/// [`HistoryStore::query`]. Each call to [`Query::iter`] re-reads the units.
#[derive(Debug, Clone)]
pub struct Query {
    branch: String,
    paths: Vec<PathBuf>,
    cancel: CancellationToken,
}

impl Query {
    /// Number of units matched; unreadable ones are skipped while iterating.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> QueryIter<'_> {
        QueryIter {
            query: self,
            pos: 0,
            done: false,
        }
    }

    /// Read every record, failing only on cancellation.
    pub fn collect_records(&self) -> Result<Vec<HistoryRecord>> {
        self.iter().collect()
    }
}

impl<'a> IntoIterator for &'a Query {
    type Item = Result<HistoryRecord>;
    type IntoIter = QueryIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [`Query`]. Yields `Err(Cancelled)` once and stops if the
/// token trips; unreadable units are logged and skipped.
#[derive(Debug)]
pub struct QueryIter<'a> {
    query: &'a Query,
    pos: usize,
    done: bool,
}

impl Iterator for QueryIter<'_> {
    type Item = Result<HistoryRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let path = self.query.paths.get(self.pos)?;
            self.pos += 1;

            if let Err(e) = self.query.cancel.checkpoint() {
                self.done = true;
                return Some(Err(e));
            }

            match read_unit(path, &self.query.branch) {
                Ok(record) => return Some(Ok(record)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable history unit");
                }
            }
        }
        None
    }
}

/// Directory name for a branch: a readable slug plus a hash of the exact
/// name, so branches like `feature/x` and `feature-x` never share a
/// directory and separators never become path structure.
#[must_use]
pub fn namespace_name(branch: &str) -> String {
    let slug: String = branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_SLUG_LEN)
        .collect();
    let slug = slug.trim_start_matches('.');
    let slug = if slug.is_empty() { "branch" } else { slug };
    format!("{slug}-{}", short_hash(branch))
}

/// File name for a record unit, derived from its commit and timestamp.
#[must_use]
pub fn unit_name(snapshot: &CoverageSnapshot) -> String {
    format!(
        "{:013}-{}.{UNIT_EXT}",
        snapshot.timestamp.timestamp_millis().max(0),
        short_hash(&snapshot.commit_sha)
    )
}

fn short_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    hex
}

fn parse_unit_name(name: &str) -> Option<(i64, String)> {
    let stem = name.strip_suffix(UNIT_EXT)?.strip_suffix('.')?;
    let (millis, hash) = stem.split_once('-')?;
    if hash.len() != HASH_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some((millis.parse().ok()?, hash.to_string()))
}

/// List record units in a namespace. A missing namespace has no units.
fn list_units(namespace: &Path) -> Result<Vec<Unit>> {
    let dir = namespace.join(RECORDS_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CovtrendError::storage(&dir, e)),
    };

    let mut units = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CovtrendError::storage(&dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        // In-flight temp files from concurrent writers.
        if name.starts_with('.') {
            continue;
        }
        match parse_unit_name(name) {
            Some((millis, commit_hash)) => units.push(Unit {
                path: entry.path(),
                millis,
                commit_hash,
            }),
            None => warn!(path = %entry.path().display(), "Ignoring unrecognized file in history store"),
        }
    }
    Ok(units)
}

fn read_record(path: &Path) -> Result<HistoryRecord> {
    let bytes = fs::read(path).map_err(|e| CovtrendError::storage(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| CovtrendError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a unit and check it belongs to `branch`.
fn read_unit(path: &Path, branch: &str) -> Result<HistoryRecord> {
    let record = read_record(path)?;
    if record.snapshot.branch != branch {
        return Err(CovtrendError::Validation(format!(
            "unit belongs to branch '{}', expected '{branch}'",
            record.snapshot.branch
        )));
    }
    Ok(record)
}

/// Branch name for a namespace directory: from the cached metadata when
/// readable, otherwise from the first readable record.
fn namespace_branch(dir: &Path) -> Option<String> {
    let from_meta = fs::read(dir.join(META_FILE))
        .ok()
        .and_then(|bytes| serde_json::from_slice::<NamespaceMeta>(&bytes).ok())
        .map(|m| m.branch);
    from_meta.or_else(|| {
        list_units(dir)
            .ok()?
            .iter()
            .find_map(|u| read_record(&u.path).ok())
            .map(|r| r.snapshot.branch)
    })
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_name_separates_lookalike_branches() {
        let a = namespace_name("feature/x");
        let b = namespace_name("feature-x");
        assert_ne!(a, b);
        assert!(a.starts_with("feature-x-"));
        assert!(!a.contains('/'));
    }

    #[test]
    fn test_namespace_name_handles_dot_and_empty_slugs() {
        assert!(namespace_name("..").starts_with("branch-"));
        assert!(namespace_name("").starts_with("branch-"));
        assert!(!namespace_name("../../etc").contains('/'));
    }

    #[test]
    fn test_unit_name_round_trips_through_parser() {
        let ts = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap();
        let snapshot = CoverageSnapshot::new(1, 2)
            .with_branch("main")
            .with_commit("abc")
            .with_timestamp(ts);
        let name = unit_name(&snapshot);
        let (millis, hash) = parse_unit_name(&name).unwrap();
        assert_eq!(millis, 1_700_000_000_123);
        assert_eq!(hash.len(), HASH_LEN);
    }

    #[test]
    fn test_parse_unit_name_rejects_foreign_files() {
        assert!(parse_unit_name("meta.json").is_none());
        assert!(parse_unit_name("notes.txt").is_none());
        assert!(parse_unit_name("123-zzzz.json").is_none());
    }
}
