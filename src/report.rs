//! Output formatting for comparison and trend results.

use std::fmt::Write;

use crate::compare::{Baseline, ComparisonResult, FileChange, FileStatus};
use crate::trend::Trend;

/// Trait for formatting comparison results.
pub trait ReportFormatter {
    /// Format the result to a string.
    fn format(&self, result: &ComparisonResult) -> String;
}

/// Plain text formatter.
pub struct TextFormatter;

impl ReportFormatter for TextFormatter {
    fn format(&self, result: &ComparisonResult) -> String {
        let mut out = String::new();
        let head = result.head_coverage.percentage;

        match result.baseline {
            Baseline::Available => {
                let base = result.base_coverage.percentage;
                let diff = result.difference;
                let label = &result.trend;
                writeln!(
                    out,
                    "Coverage: {head:.1}% (base {base:.1}%, {diff:+.2} points, {} {})",
                    label.direction, label.magnitude
                )
                .unwrap();
            }
            Baseline::Unavailable => {
                writeln!(out, "Coverage: {head:.1}% (no baseline available)").unwrap();
            }
        }

        let significant = significant_changes(result);
        if significant.is_empty() {
            return out;
        }

        out.push('\n');
        writeln!(out, "Significant files:").unwrap();
        for f in significant {
            let path = &f.filename;
            let (base, head, diff) = (f.base_coverage, f.head_coverage, f.difference);
            write!(out, "  {path}  {base:.1}% -> {head:.1}% ({diff:+.1})").unwrap();
            if f.status != FileStatus::Modified {
                write!(out, " [{}]", status_label(f.status)).unwrap();
            }
            if f.lines_added > 0 || f.lines_removed > 0 {
                write!(out, "  +{}/-{}", f.lines_added, f.lines_removed).unwrap();
            }
            out.push('\n');
        }

        out
    }
}

/// Markdown formatter, suitable for a pull-request comment body.
pub struct MarkdownFormatter;

impl ReportFormatter for MarkdownFormatter {
    fn format(&self, result: &ComparisonResult) -> String {
        let mut md = String::new();
        let head = result.head_coverage.percentage;

        writeln!(md, "### Coverage: {head:.1}%\n").unwrap();

        match result.baseline {
            Baseline::Available => {
                let base = result.base_coverage.percentage;
                let diff = result.difference;
                write!(md, "**{diff:+.2}** points against base **{base:.1}%**").unwrap();
                write!(md, " ({} {})", result.trend.direction, result.trend.magnitude).unwrap();
            }
            Baseline::Unavailable => {
                md.push_str("No baseline coverage available for comparison");
            }
        }
        let sha = &result.head_coverage.commit_sha;
        if !sha.is_empty() {
            write!(md, " at `{}`", short_sha(sha)).unwrap();
        }
        md.push('\n');

        let significant = significant_changes(result);
        if significant.is_empty() {
            md.push_str("\nNo significant file changes.\n");
        } else {
            md.push_str("\n| File | Base | Head | Change | Lines |\n");
            md.push_str("|:-----|-----:|-----:|-------:|------:|\n");
            for f in significant {
                let path = &f.filename;
                let (base, head, diff) = (f.base_coverage, f.head_coverage, f.difference);
                let (added, removed) = (f.lines_added, f.lines_removed);
                let marker = match f.status {
                    FileStatus::Modified => "",
                    FileStatus::Added => " (new)",
                    FileStatus::Removed => " (removed)",
                };
                writeln!(
                    md,
                    "| `{path}`{marker} | {base:.1}% | {head:.1}% | {diff:+.1} | +{added}/-{removed} |"
                )
                .unwrap();
            }
        }

        md.push_str("\n<sub>covtrend</sub>\n");
        md
    }
}

/// Significant changes in the order of `significant_files`.
fn significant_changes(result: &ComparisonResult) -> Vec<&FileChange> {
    result
        .significant_files
        .iter()
        .filter_map(|name| result.file(name))
        .collect()
}

fn status_label(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Modified => "modified",
        FileStatus::Added => "new",
        FileStatus::Removed => "removed",
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

/// Plain text rendering of a trend.
#[must_use]
pub fn format_trend(branch: &str, trend: &Trend) -> String {
    let mut out = String::new();
    let s = &trend.summary;
    let a = &trend.analysis;

    writeln!(out, "Branch:      {branch} (last {} days)", trend.window_days).unwrap();
    if s.total_entries == 0 {
        writeln!(out, "No history entries in this window.").unwrap();
        return out;
    }

    writeln!(out, "Entries:     {}", s.total_entries).unwrap();
    writeln!(
        out,
        "Coverage:    avg {:.1}%, min {:.1}%, max {:.1}%",
        s.average_percentage, s.min_percentage, s.max_percentage
    )
    .unwrap();
    writeln!(out, "Latest:      {}", s.current_trend).unwrap();
    writeln!(
        out,
        "Short term:  {} ({:+.2} points)",
        a.short_term_trend.direction, a.short_term_trend.change_percent
    )
    .unwrap();
    writeln!(out, "Volatility:  {:.2}", a.volatility).unwrap();
    writeln!(out, "Momentum:    {:+.2}", a.momentum).unwrap();

    match a.prediction {
        Some(ref p) => {
            for (label, f) in [("Next week:", &p.next_week), ("Next month:", &p.next_month)] {
                writeln!(
                    out,
                    "{label:<12} {:.1}% ({:.1}-{:.1}%)",
                    f.percentage, f.range.min, f.range.max
                )
                .unwrap();
            }
            writeln!(out, "Confidence:  {:.0}%", a.confidence).unwrap();
        }
        None => {
            writeln!(out, "Forecast:    insufficient data").unwrap();
        }
    }

    out
}
