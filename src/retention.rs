//! Retention rules: which records a cleanup pass removes.

use chrono::{DateTime, Duration, Utc};

use crate::config::HistoryConfig;

/// Age and count limits applied per branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// 0 disables the age limit.
    pub retention_days: u32,
    /// 0 disables the count limit.
    pub max_entries: usize,
}

impl From<&HistoryConfig> for RetentionPolicy {
    fn from(config: &HistoryConfig) -> Self {
        Self {
            retention_days: config.retention_days,
            max_entries: config.max_entries,
        }
    }
}

impl RetentionPolicy {
    /// Oldest timestamp that survives the age limit.
    #[must_use]
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        days_before(now, self.retention_days)
    }
}

/// The instant `days` days before `now`. `None` when `days` is 0 or the
/// result is out of range; either way there is no lower bound.
#[must_use]
pub fn days_before(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    if days == 0 {
        return None;
    }
    now.checked_sub_signed(Duration::days(i64::from(days)))
}

/// Return the indices of `timestamps` (one branch, any order) that the policy
/// expires: everything older than the cutoff, then the oldest survivors
/// beyond `max_entries`. The result is sorted ascending.
#[must_use]
pub fn select_expired(
    timestamps: &[DateTime<Utc>],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..timestamps.len()).collect();
    order.sort_by_key(|&i| (timestamps[i], i));

    let cutoff = policy.cutoff(now);
    let (mut expired, survivors): (Vec<usize>, Vec<usize>) = order
        .into_iter()
        .partition(|&i| cutoff.is_some_and(|c| timestamps[i] < c));

    if policy.max_entries > 0 && survivors.len() > policy.max_entries {
        let surplus = survivors.len() - policy.max_entries;
        expired.extend_from_slice(&survivors[..surplus]);
    }

    expired.sort_unstable();
    expired
}
