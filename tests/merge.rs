mod common;

use std::cell::RefCell;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{hours_ago, setup_store, snapshot};
use covtrend::cancel::CancellationToken;
use covtrend::config::MergeConfig;
use covtrend::error::{CovtrendError, Result};
use covtrend::merge::{merge, HistoryBundle, HistorySync};
use covtrend::model::HistoryRecord;
use covtrend::store::RecordOptions;
use covtrend::transport::{ArtifactKey, ArtifactTransport, DirectoryTransport};
use proptest::prelude::*;

fn rec(branch: &str, commit: &str, covered: u64, ts: DateTime<Utc>) -> HistoryRecord {
    HistoryRecord::new(snapshot(branch, commit, covered, ts), ts)
}

/// In-memory transport that can be told to fail.
#[derive(Default)]
struct MemoryTransport {
    objects: RefCell<BTreeMap<String, Vec<u8>>>,
    fail_get: bool,
    fail_put: bool,
}

impl ArtifactTransport for MemoryTransport {
    fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>> {
        if self.fail_get {
            return Err(CovtrendError::Transport("connection refused".into()));
        }
        Ok(self.objects.borrow().get(&key.object_path()).cloned())
    }

    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<()> {
        if self.fail_put {
            return Err(CovtrendError::Transport("HTTP 503".into()));
        }
        self.objects
            .borrow_mut()
            .insert(key.object_path(), bytes.to_vec());
        Ok(())
    }
}

impl MemoryTransport {
    fn seed(&self, bundle: &HistoryBundle) {
        self.put(&ArtifactKey::history(&bundle.branch), &bundle.to_vec().unwrap())
            .unwrap();
    }

    fn bundle(&self, branch: &str) -> Option<HistoryBundle> {
        self.get(&ArtifactKey::history(branch))
            .unwrap()
            .map(|bytes| HistoryBundle::from_slice(&bytes).unwrap())
    }
}

#[test]
fn newer_local_duplicate_wins_and_external_only_survives() {
    let now = Utc::now();
    let t0 = now - Duration::hours(3);
    let t1 = now - Duration::hours(2);
    let t2 = now - Duration::hours(1);

    let local = HistoryBundle::new("main", vec![rec("main", "A", 70, t1)], now);
    let external = HistoryBundle::new(
        "main",
        vec![rec("main", "A", 60, t0), rec("main", "B", 80, t2)],
        now,
    );

    let merged = merge(&local, &external, 0, now);
    let got: Vec<(&str, DateTime<Utc>)> = merged
        .records
        .iter()
        .map(|r| (r.snapshot.commit_sha.as_str(), r.timestamp()))
        .collect();
    assert_eq!(got, [("B", t2), ("A", t1)]);
}

#[test]
fn sync_pulls_external_and_pushes_union() {
    let (store, _dir) = setup_store();
    let cancel = CancellationToken::new();
    store
        .record(
            snapshot("main", "local", 70, hours_ago(1)),
            RecordOptions::default(),
            &cancel,
        )
        .unwrap();

    let transport = MemoryTransport::default();
    transport.seed(&HistoryBundle::new(
        "main",
        vec![rec("main", "ci-1", 65, hours_ago(30)), rec("main", "ci-2", 68, hours_ago(20))],
        Utc::now(),
    ));

    let outcome = HistorySync::new(&store, &transport, MergeConfig::default())
        .sync("main", &cancel)
        .unwrap();
    assert_eq!(outcome.local, 1);
    assert_eq!(outcome.fetched, 2);
    assert_eq!(outcome.imported, 2);
    assert_eq!(outcome.merged, 3);
    assert!(outcome.pushed);
    assert!(!outcome.used_fallback);

    let local = store.query("main", 0, &cancel).unwrap();
    assert_eq!(local.len(), 3);

    let pushed = transport.bundle("main").unwrap();
    assert_eq!(pushed.record_count, 3);
    assert_eq!(pushed.records[0].snapshot.commit_sha, "local");
}

#[test]
fn second_sync_imports_nothing() {
    let (store, _dir) = setup_store();
    let cancel = CancellationToken::new();
    let transport = MemoryTransport::default();
    transport.seed(&HistoryBundle::new(
        "main",
        vec![rec("main", "ci-1", 65, hours_ago(3))],
        Utc::now(),
    ));

    let sync = HistorySync::new(&store, &transport, MergeConfig::default());
    assert_eq!(sync.sync("main", &cancel).unwrap().imported, 1);
    let again = sync.sync("main", &cancel).unwrap();
    assert_eq!(again.imported, 0);
    assert_eq!(again.merged, 1);
}

#[test]
fn missing_branch_history_falls_back_without_pushing_fallback_records() {
    let (store, _dir) = setup_store();
    let cancel = CancellationToken::new();
    let transport = MemoryTransport::default();
    transport.seed(&HistoryBundle::new(
        "main",
        vec![rec("main", "base", 80, hours_ago(5))],
        Utc::now(),
    ));
    store
        .record(
            snapshot("feature/x", "head", 78, hours_ago(1)),
            RecordOptions::default(),
            &cancel,
        )
        .unwrap();

    let outcome = HistorySync::new(&store, &transport, MergeConfig::default())
        .sync("feature/x", &cancel)
        .unwrap();
    assert!(outcome.used_fallback);
    assert_eq!(outcome.imported, 1);

    // The fallback records serve as a local baseline.
    let baseline = store.get_latest_entry("main", &cancel).unwrap();
    assert_eq!(baseline.snapshot.commit_sha, "base");

    let pushed = transport.bundle("feature/x").unwrap();
    assert_eq!(pushed.record_count, 1);
    assert_eq!(pushed.records[0].snapshot.commit_sha, "head");
}

#[test]
fn transport_failures_do_not_fail_sync() {
    let (store, _dir) = setup_store();
    let cancel = CancellationToken::new();
    store
        .record(
            snapshot("main", "local", 70, hours_ago(1)),
            RecordOptions::default(),
            &cancel,
        )
        .unwrap();

    let transport = MemoryTransport {
        fail_get: true,
        fail_put: true,
        ..MemoryTransport::default()
    };
    let outcome = HistorySync::new(&store, &transport, MergeConfig::default())
        .sync("main", &cancel)
        .unwrap();
    assert_eq!(outcome.local, 1);
    assert_eq!(outcome.fetched, 0);
    assert!(!outcome.pushed);
}

#[test]
fn corrupt_external_history_is_ignored() {
    let (store, _dir) = setup_store();
    let cancel = CancellationToken::new();
    let transport = MemoryTransport::default();
    transport
        .put(&ArtifactKey::history("main"), b"<html>not json</html>")
        .unwrap();

    let outcome = HistorySync::new(&store, &transport, MergeConfig::default())
        .sync("main", &cancel)
        .unwrap();
    assert_eq!(outcome.fetched, 0);
    assert!(outcome.pushed);
}

#[test]
fn invalid_external_records_are_skipped() {
    let (store, _dir) = setup_store();
    let cancel = CancellationToken::new();
    let mut bad = rec("main", "bad", 50, hours_ago(2));
    bad.snapshot.covered_statements = 500;
    let transport = MemoryTransport::default();
    transport.seed(&HistoryBundle::new(
        "main",
        vec![bad, rec("main", "good", 60, hours_ago(1))],
        Utc::now(),
    ));

    let outcome = HistorySync::new(&store, &transport, MergeConfig::default())
        .sync("main", &cancel)
        .unwrap();
    assert_eq!(outcome.imported, 1);
    assert_eq!(store.query("main", 0, &cancel).unwrap().len(), 1);
}

#[test]
fn sync_through_directory_transport() {
    let (store, dir) = setup_store();
    let cancel = CancellationToken::new();
    let artifacts = dir.path().join("artifacts");

    // A previous CI run left history in the restored directory.
    let previous = DirectoryTransport::new(&artifacts);
    previous
        .put(
            &ArtifactKey::history("main"),
            &HistoryBundle::new("main", vec![rec("main", "old", 60, hours_ago(48))], Utc::now())
                .to_vec()
                .unwrap(),
        )
        .unwrap();

    store
        .record(
            snapshot("main", "new", 62, hours_ago(1)),
            RecordOptions::default(),
            &cancel,
        )
        .unwrap();
    let transport = DirectoryTransport::new(&artifacts);
    let outcome = HistorySync::new(&store, &transport, MergeConfig::default())
        .sync("main", &cancel)
        .unwrap();
    assert_eq!(outcome.merged, 2);

    let bytes = transport.get(&ArtifactKey::history("main")).unwrap().unwrap();
    let bundle = HistoryBundle::from_slice(&bytes).unwrap();
    let commits: Vec<_> = bundle
        .records
        .iter()
        .map(|r| r.snapshot.commit_sha.as_str())
        .collect();
    assert_eq!(commits, ["new", "old"]);
}

#[test]
fn stale_external_records_are_dropped() {
    let (store, _dir) = setup_store();
    let cancel = CancellationToken::new();
    let transport = MemoryTransport::default();
    transport.seed(&HistoryBundle::new(
        "main",
        vec![
            rec("main", "stale", 60, hours_ago(24 * 100)),
            rec("main", "fresh", 61, hours_ago(24)),
        ],
        Utc::now(),
    ));

    let outcome = HistorySync::new(&store, &transport, MergeConfig::default())
        .sync("main", &cancel)
        .unwrap();
    assert_eq!(outcome.fetched, 1);
    assert_eq!(outcome.merged, 1);
}

#[test]
fn cancelled_sync_returns_cancelled() {
    let (store, _dir) = setup_store();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let transport = MemoryTransport::default();
    let err = HistorySync::new(&store, &transport, MergeConfig::default())
        .sync("main", &cancel)
        .unwrap_err();
    assert!(matches!(err, CovtrendError::Cancelled));
    assert!(transport.bundle("main").is_none());
}

// -- Properties -------------------------------------------------------------

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Records drawn from a small key space so duplicates are common.
fn arb_records() -> impl Strategy<Value = Vec<HistoryRecord>> {
    prop::collection::vec(
        (0usize..2, 0usize..4, 0u64..=100, 0i64..6, 0i64..3),
        0..8,
    )
    .prop_map(|items| {
        items
            .into_iter()
            .map(|(b, c, covered, hour, recorded)| {
                let branch = ["main", "dev"][b];
                let ts = epoch() + Duration::hours(hour);
                HistoryRecord::new(
                    snapshot(branch, &format!("c{c}"), covered, ts),
                    ts + Duration::minutes(recorded),
                )
            })
            .collect()
    })
}

fn as_set(bundle: &HistoryBundle) -> Vec<HistoryRecord> {
    let mut records = bundle.records.clone();
    records.sort_by(|a, b| a.key().cmp(&b.key()));
    records
}

proptest! {
    #[test]
    fn merge_is_commutative(a in arb_records(), b in arb_records()) {
        let now = epoch();
        let a = HistoryBundle::new("main", a, now);
        let b = HistoryBundle::new("main", b, now);
        prop_assert_eq!(as_set(&merge(&a, &b, 0, now)), as_set(&merge(&b, &a, 0, now)));
    }

    #[test]
    fn merge_is_idempotent(a in arb_records(), b in arb_records()) {
        let now = epoch();
        let a = HistoryBundle::new("main", a, now);
        let b = HistoryBundle::new("main", b, now);
        let ab = merge(&a, &b, 0, now);
        prop_assert_eq!(as_set(&merge(&ab, &a, 0, now)), as_set(&ab));
        prop_assert_eq!(as_set(&merge(&ab, &b, 0, now)), as_set(&ab));
        prop_assert_eq!(as_set(&merge(&ab, &ab, 0, now)), as_set(&ab));
    }

    #[test]
    fn merge_keeps_one_record_per_key(a in arb_records(), b in arb_records(), max_runs in 0usize..5) {
        let now = epoch();
        let merged = merge(
            &HistoryBundle::new("main", a, now),
            &HistoryBundle::new("main", b, now),
            max_runs,
            now,
        );
        let keys = merged.keys();
        prop_assert_eq!(keys.len(), merged.records.len());
        prop_assert_eq!(merged.record_count, merged.records.len());
        if max_runs > 0 {
            prop_assert!(merged.records.len() <= max_runs);
        }
        prop_assert!(merged
            .records
            .windows(2)
            .all(|w| w[0].timestamp() >= w[1].timestamp()));
    }
}
