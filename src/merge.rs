//! Reconciling local history with history carried over from earlier CI runs.
//!
//! Runners are ephemeral, so the local store only ever holds what this job
//! recorded or restored. [`merge`] combines two record sets; [`HistorySync`]
//! wires it to the store and an [`ArtifactTransport`], recording locally
//! first and treating the transport as best-effort.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::config::MergeConfig;
use crate::error::{CovtrendError, Result};
use crate::model::{HistoryRecord, RecordKey};
use crate::retention::days_before;
use crate::store::HistoryStore;
use crate::transport::{ArtifactKey, ArtifactTransport};

/// A branch's history as exchanged with the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBundle {
    pub branch: String,
    /// Newest first.
    pub records: Vec<HistoryRecord>,
    pub record_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HistoryBundle {
    pub fn new(branch: impl Into<String>, mut records: Vec<HistoryRecord>, now: DateTime<Utc>) -> Self {
        sort_newest_first(&mut records);
        Self {
            branch: branch.into(),
            record_count: records.len(),
            records,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn empty(branch: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(branch, Vec::new(), now)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    #[must_use]
    pub fn keys(&self) -> BTreeSet<RecordKey> {
        self.records.iter().map(HistoryRecord::key).collect()
    }

    /// Drop records older than `max_age_days` (0 keeps everything).
    pub fn retain_max_age(&mut self, max_age_days: u32, now: DateTime<Utc>) {
        let Some(cutoff) = days_before(now, max_age_days) else {
            return;
        };
        self.records.retain(|r| r.timestamp() >= cutoff);
        self.record_count = self.records.len();
    }
}

/// Union `local` and `external`, keep the winning record per
/// `(branch, commit_sha)`, order newest first and keep at most `max_runs`
/// (0 = unlimited). The record set does not depend on argument order, and
/// merging a result with either input again changes nothing. The result is
/// labelled with `local`'s branch, or `external`'s if `local` has none.
#[must_use]
pub fn merge(
    local: &HistoryBundle,
    external: &HistoryBundle,
    max_runs: usize,
    now: DateTime<Utc>,
) -> HistoryBundle {
    let mut winners: BTreeMap<RecordKey, &HistoryRecord> = BTreeMap::new();
    for record in local.records.iter().chain(&external.records) {
        match winners.entry(record.key()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if record.precedence(slot.get()).is_gt() {
                    slot.insert(record);
                }
            }
        }
    }

    let mut records: Vec<HistoryRecord> = winners.into_values().cloned().collect();
    sort_newest_first(&mut records);
    if max_runs > 0 {
        records.truncate(max_runs);
    }

    let branch = if local.branch.is_empty() {
        external.branch.clone()
    } else {
        local.branch.clone()
    };

    HistoryBundle {
        branch,
        record_count: records.len(),
        records,
        created_at: local.created_at.min(external.created_at),
        updated_at: now,
    }
}

fn sort_newest_first(records: &mut [HistoryRecord]) {
    records.sort_by(|a, b| {
        b.timestamp()
            .cmp(&a.timestamp())
            .then_with(|| a.key().cmp(&b.key()))
    });
}

/// History fetched from the transport.
#[derive(Debug, Clone)]
pub struct FetchedHistory {
    pub bundle: HistoryBundle,
    /// True when the requested branch had none and the fallback was used.
    pub used_fallback: bool,
}

/// Fetch the history artifact for `branch`, falling back to
/// `config.fallback_branch` when the branch has none. Records older than
/// `config.max_age_days` are dropped.
pub fn fetch_history(
    transport: &dyn ArtifactTransport,
    branch: &str,
    config: &MergeConfig,
    now: DateTime<Utc>,
) -> Result<Option<FetchedHistory>> {
    let mut fetched = transport
        .get(&ArtifactKey::history(branch))?
        .map(|bytes| (bytes, false));

    if fetched.is_none() && config.fallback_branch != branch {
        fetched = transport
            .get(&ArtifactKey::history(&config.fallback_branch))?
            .map(|bytes| (bytes, true));
    }

    let Some((bytes, used_fallback)) = fetched else {
        return Ok(None);
    };

    let mut bundle = HistoryBundle::from_slice(&bytes)?;
    bundle.retain_max_age(config.max_age_days, now);
    Ok(Some(FetchedHistory {
        bundle,
        used_fallback,
    }))
}

/// Counts describing one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub local: usize,
    pub fetched: usize,
    pub imported: usize,
    pub merged: usize,
    pub pushed: bool,
    pub used_fallback: bool,
}

/// Synchronizes a branch's local history with its external artifact.
pub struct HistorySync<'a> {
    store: &'a HistoryStore,
    transport: &'a dyn ArtifactTransport,
    config: MergeConfig,
}

impl<'a> HistorySync<'a> {
    pub fn new(
        store: &'a HistoryStore,
        transport: &'a dyn ArtifactTransport,
        config: MergeConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Pull external history into the local store and push the merged
    /// history back. Transport failures are logged and do not fail the
    /// sync; local store failures and cancellation do.
    ///
    /// Records fetched from the fallback branch are imported locally (they
    /// serve as a baseline) but are not pushed under `branch`.
    pub fn sync(&self, branch: &str, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let now = Utc::now();
        let local_records = self.store.query(branch, 0, cancel)?.collect_records()?;
        let local = HistoryBundle::new(branch, local_records, now);

        cancel.checkpoint()?;
        let fetched = match fetch_history(self.transport, branch, &self.config, now) {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(branch = %branch, error = %e, "Could not fetch external history; continuing with local history");
                None
            }
        };

        let mut outcome = SyncOutcome {
            local: local.record_count,
            ..SyncOutcome::default()
        };

        let external = match fetched {
            Some(fetched) => {
                outcome.fetched = fetched.bundle.record_count;
                outcome.used_fallback = fetched.used_fallback;
                outcome.imported = self.import_missing(&local, &fetched.bundle, cancel)?;
                if fetched.used_fallback {
                    HistoryBundle::empty(branch, now)
                } else {
                    fetched.bundle
                }
            }
            None => HistoryBundle::empty(branch, now),
        };

        let merged = merge(&local, &external, self.config.max_runs, now);
        outcome.merged = merged.record_count;

        cancel.checkpoint()?;
        let key = ArtifactKey::history(branch);
        match merged.to_vec().and_then(|bytes| self.transport.put(&key, &bytes)) {
            Ok(()) => outcome.pushed = true,
            Err(e) => {
                warn!(branch = %branch, error = %e, "Could not push merged history");
            }
        }

        info!(
            branch = %branch,
            local = outcome.local,
            fetched = outcome.fetched,
            imported = outcome.imported,
            merged = outcome.merged,
            pushed = outcome.pushed,
            "History sync complete"
        );
        Ok(outcome)
    }

    /// Write external records the local history lacks (or holds an older
    /// version of) into the store.
    fn import_missing(
        &self,
        local: &HistoryBundle,
        external: &HistoryBundle,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let local_by_key: BTreeMap<RecordKey, &HistoryRecord> =
            local.records.iter().map(|r| (r.key(), r)).collect();

        let mut imported = 0;
        for record in &external.records {
            cancel.checkpoint()?;
            let newer = local_by_key
                .get(&record.key())
                .map_or(true, |existing| record.precedence(existing).is_gt());
            if !newer {
                continue;
            }
            match self.store.import(record, cancel) {
                Ok(true) => imported += 1,
                Ok(false) => {}
                Err(e @ CovtrendError::Validation(_)) => {
                    warn!(commit = %record.snapshot.commit_sha, error = %e, "Skipping invalid external record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(imported)
    }
}
