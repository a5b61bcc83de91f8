//! Command handler functions for the covtrend CLI.
//!
//! Each `cmd_*` function returns its output as a `String`, making them easy
//! to test without capturing stdout.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::ValueEnum;
use serde::Serialize;
use tracing::warn;

use crate::cancel::CancellationToken;
use crate::compare::Comparator;
use crate::config::MergeConfig;
use crate::diff;
use crate::merge::{self, HistoryBundle, HistorySync};
use crate::model::CoverageSnapshot;
use crate::report::{self, MarkdownFormatter, ReportFormatter, TextFormatter};
use crate::store::{HistoryStore, RecordOptions};
use crate::transport::ArtifactTransport;
use crate::trend::TrendAnalyzer;

/// Output style for the `compare` command.
#[derive(Clone, ValueEnum)]
pub enum Style {
    Text,
    Markdown,
    Json,
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let mut out = serde_json::to_string_pretty(value)?;
    out.push('\n');
    Ok(out)
}

/// Read a coverage snapshot produced by the upstream parser.
pub fn load_snapshot(path: &Path) -> Result<CoverageSnapshot> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid snapshot JSON in {}", path.display()))
}

fn load_bundle(path: &Path) -> Result<HistoryBundle> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read history {}", path.display()))?;
    HistoryBundle::from_slice(&bytes)
        .with_context(|| format!("Invalid history JSON in {}", path.display()))
}

/// Parse `key=value` pairs given on the command line.
pub fn parse_metadata(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Metadata '{pair}' is not in key=value form"))?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn cmd_record(
    store: &HistoryStore,
    snapshot: CoverageSnapshot,
    options: RecordOptions,
    cancel: &CancellationToken,
) -> Result<String> {
    let record = store.record(snapshot, options, cancel)?;
    let s = &record.snapshot;
    Ok(format!(
        "Recorded {:.1}% ({}/{}) for {}@{}\n",
        s.percentage,
        s.covered_statements,
        s.total_statements,
        s.branch,
        s.commit_sha,
    ))
}

pub fn cmd_latest(
    store: &HistoryStore,
    branch: &str,
    json: bool,
    cancel: &CancellationToken,
) -> Result<String> {
    let record = store.get_latest_entry(branch, cancel)?;
    if json {
        return to_json(&record);
    }
    let s = &record.snapshot;
    let mut out = String::new();
    writeln!(out, "Branch:     {}", s.branch).unwrap();
    writeln!(out, "Commit:     {}", s.commit_sha).unwrap();
    writeln!(out, "Timestamp:  {}", s.timestamp.to_rfc3339()).unwrap();
    writeln!(
        out,
        "Coverage:   {:.1}% ({}/{})",
        s.percentage, s.covered_statements, s.total_statements
    )
    .unwrap();
    Ok(out)
}

pub fn cmd_history(
    store: &HistoryStore,
    branch: &str,
    days: u32,
    json: bool,
    cancel: &CancellationToken,
) -> Result<String> {
    let records = store.query(branch, days, cancel)?.collect_records()?;
    if json {
        return to_json(&records);
    }
    if records.is_empty() {
        return Ok(format!("No history for branch '{branch}'.\n"));
    }
    let mut out = String::new();
    writeln!(out, "{:<26} {:<12} {:>8}", "TIMESTAMP", "COMMIT", "COVERAGE").unwrap();
    writeln!(out, "{}", "-".repeat(48)).unwrap();
    for r in &records {
        let s = &r.snapshot;
        let commit = s.commit_sha.get(..12).unwrap_or(&s.commit_sha);
        writeln!(
            out,
            "{:<26} {:<12} {:>7.1}%",
            s.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            commit,
            s.percentage
        )
        .unwrap();
    }
    Ok(out)
}

pub fn cmd_trend(
    store: &HistoryStore,
    branch: &str,
    days: u32,
    json: bool,
    cancel: &CancellationToken,
) -> Result<String> {
    let trend = TrendAnalyzer::new(store).get_trend(branch, days, cancel)?;
    if json {
        return to_json(&trend);
    }
    Ok(report::format_trend(branch, &trend))
}

pub fn cmd_stats(store: &HistoryStore, json: bool, cancel: &CancellationToken) -> Result<String> {
    let stats = store.get_statistics(cancel)?;
    if json {
        return to_json(&stats);
    }

    let mut out = String::new();
    writeln!(out, "Entries:    {}", stats.total_entries).unwrap();
    writeln!(out, "Size:       {} bytes", stats.storage_size).unwrap();
    if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
        writeln!(out, "Oldest:     {}", oldest.to_rfc3339()).unwrap();
        writeln!(out, "Newest:     {}", newest.to_rfc3339()).unwrap();
    }
    if !stats.branches.is_empty() {
        writeln!(out, "\n{:<40} {:>8}", "BRANCH", "ENTRIES").unwrap();
        writeln!(out, "{}", "-".repeat(49)).unwrap();
        for (branch, count) in &stats.branches {
            writeln!(out, "{branch:<40} {count:>8}").unwrap();
        }
    }
    if !stats.projects.is_empty() {
        writeln!(out, "\n{:<40} {:>8}", "PROJECT", "ENTRIES").unwrap();
        writeln!(out, "{}", "-".repeat(49)).unwrap();
        for (project, count) in &stats.projects {
            writeln!(out, "{project:<40} {count:>8}").unwrap();
        }
    }
    Ok(out)
}

pub fn cmd_cleanup(
    store: &HistoryStore,
    branch: Option<&str>,
    cancel: &CancellationToken,
) -> Result<String> {
    let report = match branch {
        Some(branch) => store.cleanup_branch(branch, cancel)?,
        None => store.cleanup(cancel)?,
    };
    if report.removed == 0 {
        return Ok("Nothing to clean up.\n".to_string());
    }
    let mut out = String::new();
    writeln!(out, "Removed {} expired entries", report.removed).unwrap();
    for (branch, removed) in &report.by_branch {
        writeln!(out, "  {branch}: {removed}").unwrap();
    }
    Ok(out)
}

/// Latest record on `branch` as a baseline, or `None` if the branch has no
/// history yet.
pub fn baseline_from_store(
    store: &HistoryStore,
    branch: &str,
    cancel: &CancellationToken,
) -> Result<Option<CoverageSnapshot>> {
    match store.get_latest_entry(branch, cancel) {
        Ok(record) => Ok(Some(record.snapshot)),
        Err(e) if e.is_not_found() => {
            warn!(branch = %branch, "No baseline history for branch");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Compare `head` against `base`. Returns the formatted output and whether
/// coverage regressed by at least `fail_threshold` points.
pub fn cmd_compare(
    comparator: &Comparator,
    base: Option<&CoverageSnapshot>,
    head: &CoverageSnapshot,
    diff_text: Option<&str>,
    style: &Style,
    fail_threshold: Option<f64>,
) -> Result<(String, bool)> {
    let line_diffs = diff_text.map(diff::line_counts);
    let result = comparator.compare(base, head, line_diffs.as_ref());
    let regressed = fail_threshold.is_some_and(|t| result.has_regression(t));

    let output = match style {
        Style::Text => TextFormatter.format(&result),
        Style::Markdown => MarkdownFormatter.format(&result),
        Style::Json => to_json(&result)?,
    };
    Ok((output, regressed))
}

/// Merge two history files offline. Returns the merged history as JSON.
pub fn cmd_merge(local: &Path, external: &Path, max_runs: usize) -> Result<String> {
    let local = load_bundle(local)?;
    let external = load_bundle(external)?;
    let merged = merge::merge(&local, &external, max_runs, Utc::now());
    let bytes = merged.to_vec()?;
    let mut out = String::from_utf8(bytes).context("Merged history is not valid UTF-8")?;
    out.push('\n');
    Ok(out)
}

/// Local history for `branch` in the exchange format.
pub fn cmd_export(
    store: &HistoryStore,
    branch: &str,
    max_runs: usize,
    cancel: &CancellationToken,
) -> Result<String> {
    let records = store.query(branch, 0, cancel)?.collect_records()?;
    let mut bundle = HistoryBundle::new(branch, records, Utc::now());
    if max_runs > 0 {
        bundle.records.truncate(max_runs);
        bundle.record_count = bundle.records.len();
    }
    to_json(&bundle)
}

pub fn cmd_sync(
    store: &HistoryStore,
    transport: &dyn ArtifactTransport,
    config: MergeConfig,
    branch: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    let outcome = HistorySync::new(store, transport, config).sync(branch, cancel)?;
    let mut out = String::new();
    writeln!(
        out,
        "Synced '{branch}': {} local, {} fetched, {} imported, {} merged",
        outcome.local, outcome.fetched, outcome.imported, outcome.merged
    )
    .unwrap();
    if outcome.used_fallback {
        writeln!(out, "  (history taken from fallback branch)").unwrap();
    }
    if !outcome.pushed {
        writeln!(out, "  warning: merged history was not pushed").unwrap();
    }
    Ok(out)
}
