mod common;

use common::{hours_ago, setup_store};
use covtrend::cancel::CancellationToken;
use covtrend::compare::{Baseline, Comparator, FileStatus, Magnitude};
use covtrend::config::CompareConfig;
use covtrend::diff::line_counts;
use covtrend::model::{CoverageSnapshot, FileCoverage};
use covtrend::store::RecordOptions;
use covtrend::trend::Direction;
use proptest::prelude::*;

fn comparator() -> Comparator {
    Comparator::new(CompareConfig::default())
}

fn files(entries: &[(&str, u64, u64)]) -> CoverageSnapshot {
    CoverageSnapshot::from_files(
        entries
            .iter()
            .map(|(path, total, covered)| FileCoverage::new(*path, *total, *covered))
            .collect(),
    )
    .with_branch("main")
    .with_commit("abc")
}

#[test]
fn overall_drop_of_five_points() {
    let base = CoverageSnapshot::new(80, 100);
    let head = CoverageSnapshot::new(75, 100);
    let result = comparator().compare(Some(&base), &head, None);
    assert_eq!(result.difference, -5.0);
    assert_eq!(result.trend.direction, Direction::Down);
    assert_eq!(result.trend.magnitude, Magnitude::Moderate);
}

#[test]
fn new_poorly_covered_file_is_significant() {
    let base = files(&[("main.go", 10, 10)]);
    let head = files(&[("main.go", 10, 10), ("new.go", 10, 4)]);
    let result = comparator().compare(Some(&base), &head, None);

    let new = result.file("new.go").unwrap();
    assert_eq!(new.status, FileStatus::Added);
    assert_eq!(new.base_coverage, 0.0);
    assert!((new.head_coverage - 40.0).abs() < 1e-9);
    assert!(new.is_significant);
    assert!(result.significant_files.contains(&"new.go".to_string()));
}

#[test]
fn module_prefixed_paths_resolve_to_one_change() {
    let base = files(&[("cli/internal/cli/x.go", 20, 10)]);
    let head = files(&[("internal/cli/x.go", 20, 12)]);
    let result = comparator().compare(Some(&base), &head, None);
    let names: Vec<&str> = result.file_changes.iter().map(|f| f.filename.as_str()).collect();
    assert_eq!(names, ["internal/cli/x.go"]);
    assert_eq!(result.file_changes[0].status, FileStatus::Modified);
}

#[test]
fn distinct_files_are_not_merged_by_path_collapse() {
    let x = files(&[("api/v1/api/h.go", 10, 10), ("v1/api/h.go", 10, 0)]);
    let result = comparator().compare(Some(&x), &x, None);

    let names: Vec<&str> = result.file_changes.iter().map(|f| f.filename.as_str()).collect();
    assert_eq!(names, ["api/v1/api/h.go", "v1/api/h.go"]);
    assert!((result.file("api/v1/api/h.go").unwrap().head_coverage - 100.0).abs() < 1e-9);
    assert_eq!(result.file("v1/api/h.go").unwrap().head_coverage, 0.0);
    assert!(result.significant_files.is_empty());
}

#[test]
fn baseline_from_store_and_diff_counts() {
    let (store, _dir) = setup_store();
    let cancel = CancellationToken::new();
    store
        .record(
            files(&[("src/a.rs", 10, 9), ("src/b.rs", 10, 5)]).with_timestamp(hours_ago(2)),
            RecordOptions::default(),
            &cancel,
        )
        .unwrap();
    let base = store.get_latest_entry("main", &cancel).unwrap().snapshot;

    let head = files(&[("src/a.rs", 12, 6), ("src/b.rs", 10, 5)]);
    let diff = "\
diff --git a/src/a.rs b/src/a.rs
--- a/src/a.rs
+++ b/src/a.rs
@@ -1,3 +1,5 @@
 fn a() {}
+fn b() {}
+fn c() {}
-fn d() {}
+fn e() {}
 fn f() {}
";
    let diffs = line_counts(diff);
    let result = comparator().compare(Some(&base), &head, Some(&diffs));

    let a = result.file("src/a.rs").unwrap();
    assert_eq!((a.lines_added, a.lines_removed), (3, 1));
    assert!((a.difference - -40.0).abs() < 1e-9);
    let b = result.file("src/b.rs").unwrap();
    assert_eq!((b.lines_added, b.lines_removed), (0, 0));
    assert!(!b.is_significant);

    assert_eq!(result.significant_files, ["src/a.rs"]);
    assert!(result.has_regression(5.0));
}

#[test]
fn missing_baseline_is_reported_not_a_jump() {
    let head = files(&[("a.go", 10, 9)]);
    let result = comparator().compare(None, &head, None);
    assert_eq!(result.baseline, Baseline::Unavailable);
    assert_eq!(result.difference, 0.0);
    assert_eq!(result.trend.direction, Direction::Stable);
    assert_eq!(result.base_coverage.percentage, 0.0);
    assert!(!result.has_regression(0.0));
}

#[test]
fn thresholds_come_from_config() {
    let base = files(&[("a.go", 100, 90)]);
    let head = files(&[("a.go", 100, 87), ("b.go", 10, 6)]);

    let strict = Comparator::new(CompareConfig {
        significant_threshold: 2.0,
        ..CompareConfig::default()
    });
    let result = strict.compare(Some(&base), &head, None);
    assert!(result.file("a.go").unwrap().is_significant);

    let result = comparator().compare(Some(&base), &head, None);
    assert!(!result.file("a.go").unwrap().is_significant);

    // With the delta rule out of reach only the acceptable threshold
    // decides whether the 60% new file is flagged.
    let lenient = |acceptable_threshold| {
        Comparator::new(CompareConfig {
            significant_threshold: 100.0,
            acceptable_threshold,
            ..CompareConfig::default()
        })
    };
    let result = lenient(50.0).compare(Some(&base), &head, None);
    assert!(!result.file("b.go").unwrap().is_significant);
    let result = lenient(75.0).compare(Some(&base), &head, None);
    assert!(result.file("b.go").unwrap().is_significant);
}

#[test]
fn configured_prefix_is_stripped() {
    let config = CompareConfig {
        strip_prefixes: vec!["/builds/acme/app".to_string()],
        ..CompareConfig::default()
    };
    let base = files(&[("/builds/acme/app/src/x.py", 10, 5)]);
    let head = files(&[("src/x.py", 10, 5)]);
    let result = Comparator::new(config).compare(Some(&base), &head, None);
    assert_eq!(result.file_changes.len(), 1);
    assert_eq!(result.file_changes[0].filename, "src/x.py");
}

fn arb_snapshot() -> impl Strategy<Value = CoverageSnapshot> {
    prop::collection::btree_map("[a-z]{1,6}(/[a-z]{1,6}){0,2}\\.go", (1u64..200, 0u64..=100), 0..8)
        .prop_map(|entries| {
            CoverageSnapshot::from_files(
                entries
                    .into_iter()
                    .map(|(path, (total, pct))| FileCoverage::new(path, total, total * pct / 100))
                    .collect(),
            )
        })
}

proptest! {
    #[test]
    fn comparing_a_snapshot_with_itself_is_stable(x in arb_snapshot()) {
        let result = comparator().compare(Some(&x), &x, None);
        prop_assert_eq!(result.difference, 0.0);
        prop_assert_eq!(result.trend.direction, Direction::Stable);
        prop_assert!(result.significant_files.is_empty());
        prop_assert!(result.file_changes.iter().all(|f| f.status == FileStatus::Modified));
    }
}
