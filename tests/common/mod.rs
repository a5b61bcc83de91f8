#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use covtrend::config::HistoryConfig;
use covtrend::model::CoverageSnapshot;
use covtrend::store::HistoryStore;
use tempfile::TempDir;

/// Create a fresh store in a temporary directory with default settings.
/// The caller must hold onto `TempDir` to keep the temp directory alive.
pub fn setup_store() -> (HistoryStore, TempDir) {
    setup_store_with(HistoryConfig::default())
}

pub fn setup_store_with(config: HistoryConfig) -> (HistoryStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoryStore::open(dir.path().join("history"), config).unwrap();
    (store, dir)
}

/// Settings with automatic cleanup off, so tests control when it runs.
pub fn manual_cleanup(retention_days: u32, max_entries: usize) -> HistoryConfig {
    HistoryConfig {
        retention_days,
        max_entries,
        auto_cleanup: false,
    }
}

/// A valid snapshot of `covered` out of 100 statements.
pub fn snapshot(branch: &str, commit: &str, covered: u64, timestamp: DateTime<Utc>) -> CoverageSnapshot {
    CoverageSnapshot::new(covered, 100)
        .with_branch(branch)
        .with_commit(commit)
        .with_timestamp(timestamp)
}

pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}
