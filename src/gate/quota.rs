//! Rolling daily/monthly call- and credit-quota tracking.
//!
//! Buckets roll over on first access in a new UTC day or month. Quota
//! source order: per-key override → global config → none; the chosen source
//! travels with the check result so callers can report it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::keys::{KeyRecord, QuotaLimits};

// ─── Status types ─────────────────────────────────────────────────────────────

/// Which configuration supplied the limits being enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaSource {
    Key,
    Global,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    Daily,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    Calls,
    Credits,
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCheck {
    Ok {
        source: QuotaSource,
    },
    Exceeded {
        source: QuotaSource,
        scope: QuotaScope,
        dimension: QuotaDimension,
    },
}

impl QuotaCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, QuotaCheck::Ok { .. })
    }
}

// ─── Usage buckets ────────────────────────────────────────────────────────────

/// Per-key usage counters for the current day and month buckets.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub day: String,
    pub month: String,
    pub daily_calls: u64,
    pub monthly_calls: u64,
    pub daily_credits: u64,
    pub monthly_credits: u64,
}

impl QuotaUsage {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: day_bucket(now),
            month: month_bucket(now),
            daily_calls: 0,
            monthly_calls: 0,
            daily_credits: 0,
            monthly_credits: 0,
        }
    }

    /// Reset whichever buckets have rolled into a new period.
    fn roll(&mut self, now: DateTime<Utc>) {
        let day = day_bucket(now);
        if self.day != day {
            self.day = day;
            self.daily_calls = 0;
            self.daily_credits = 0;
        }
        let month = month_bucket(now);
        if self.month != month {
            self.month = month;
            self.monthly_calls = 0;
            self.monthly_credits = 0;
        }
    }
}

fn day_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn month_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

// ─── Tracker ──────────────────────────────────────────────────────────────────

pub struct QuotaTracker {
    /// Global fallback limits when a key carries no override.
    global: Option<QuotaLimits>,
    usage: Mutex<HashMap<String, QuotaUsage>>,
}

impl QuotaTracker {
    pub fn new(global: Option<QuotaLimits>) -> Self {
        Self {
            global,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the limits applying to `record` and their source.
    fn resolve_limits<'a>(&'a self, record: &'a KeyRecord) -> (Option<&'a QuotaLimits>, QuotaSource) {
        if let Some(limits) = &record.quota {
            return (Some(limits), QuotaSource::Key);
        }
        if let Some(limits) = &self.global {
            return (Some(limits), QuotaSource::Global);
        }
        (None, QuotaSource::None)
    }

    /// Would admitting one more call charging `credits` stay within quota?
    pub async fn check(&self, record: &KeyRecord, credits: u64) -> QuotaCheck {
        self.check_with_pending(record, 0, 0, credits).await
    }

    /// Quota check with `pending_calls`/`pending_credits` already admitted
    /// earlier in the same batch but not yet recorded. Batch admission uses
    /// this so entry N sees entries 0..N in its hypothetical usage.
    pub async fn check_with_pending(
        &self,
        record: &KeyRecord,
        pending_calls: u64,
        pending_credits: u64,
        credits: u64,
    ) -> QuotaCheck {
        let (limits, source) = self.resolve_limits(record);
        let Some(limits) = limits else {
            return QuotaCheck::Ok { source };
        };
        if limits.is_unlimited() {
            return QuotaCheck::Ok { source };
        }

        let now = Utc::now();
        let mut usage = self.usage.lock().await;
        let bucket = usage
            .entry(record.key.clone())
            .or_insert_with(|| QuotaUsage::new(now));
        bucket.roll(now);

        let checks = [
            (
                limits.daily_calls,
                bucket.daily_calls + pending_calls + 1,
                QuotaScope::Daily,
                QuotaDimension::Calls,
            ),
            (
                limits.monthly_calls,
                bucket.monthly_calls + pending_calls + 1,
                QuotaScope::Monthly,
                QuotaDimension::Calls,
            ),
            (
                limits.daily_credits,
                bucket.daily_credits + pending_credits + credits,
                QuotaScope::Daily,
                QuotaDimension::Credits,
            ),
            (
                limits.monthly_credits,
                bucket.monthly_credits + pending_credits + credits,
                QuotaScope::Monthly,
                QuotaDimension::Credits,
            ),
        ];
        for (limit, would_be, scope, dimension) in checks {
            if let Some(limit) = limit {
                if would_be > limit {
                    return QuotaCheck::Exceeded {
                        source,
                        scope,
                        dimension,
                    };
                }
            }
        }
        QuotaCheck::Ok { source }
    }

    /// Record one admitted call charging `credits`.
    pub async fn record(&self, key_id: &str, credits: u64) {
        let now = Utc::now();
        let mut usage = self.usage.lock().await;
        let bucket = usage
            .entry(key_id.to_string())
            .or_insert_with(|| QuotaUsage::new(now));
        bucket.roll(now);
        bucket.daily_calls += 1;
        bucket.monthly_calls += 1;
        bucket.daily_credits += credits;
        bucket.monthly_credits += credits;
    }

    /// Current usage snapshot for one key (admin observability).
    pub async fn usage(&self, key_id: &str) -> Option<QuotaUsage> {
        let now = Utc::now();
        let mut usage = self.usage.lock().await;
        usage.get_mut(key_id).map(|bucket| {
            bucket.roll(now);
            bucket.clone()
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn record_with_quota(quota: Option<QuotaLimits>) -> KeyRecord {
        KeyRecord {
            key: "pg_q".into(),
            name: "q".into(),
            credits: 1000,
            total_spent: 0,
            total_calls: 0,
            allowed_calls: 0,
            denied_calls: 0,
            created_at: Utc::now(),
            last_used_at: None,
            active: true,
            suspended: false,
            expires_at: None,
            spending_limit: 0,
            allowed_tools: HashSet::new(),
            denied_tools: HashSet::new(),
            ip_allowlist: Vec::new(),
            allowed_countries: HashSet::new(),
            denied_countries: HashSet::new(),
            quota,
            rate_limit_per_minute: None,
            auto_topup: None,
            auto_topup_today: None,
            namespace: None,
            group: None,
            tags: Vec::new(),
            alias: None,
        }
    }

    #[tokio::test]
    async fn no_limits_always_ok() {
        let tracker = QuotaTracker::new(None);
        let record = record_with_quota(None);
        let check = tracker.check(&record, 100).await;
        assert_eq!(check, QuotaCheck::Ok { source: QuotaSource::None });
    }

    #[tokio::test]
    async fn key_override_wins_over_global() {
        let global = QuotaLimits {
            daily_calls: Some(1),
            ..Default::default()
        };
        let tracker = QuotaTracker::new(Some(global));
        let record = record_with_quota(Some(QuotaLimits {
            daily_calls: Some(5),
            ..Default::default()
        }));

        tracker.record(&record.key, 1).await;
        // Global would deny the second call; the key override allows it.
        let check = tracker.check(&record, 1).await;
        assert_eq!(check, QuotaCheck::Ok { source: QuotaSource::Key });
    }

    #[tokio::test]
    async fn daily_call_limit_exceeds() {
        let tracker = QuotaTracker::new(Some(QuotaLimits {
            daily_calls: Some(2),
            ..Default::default()
        }));
        let record = record_with_quota(None);

        tracker.record(&record.key, 1).await;
        tracker.record(&record.key, 1).await;
        match tracker.check(&record, 1).await {
            QuotaCheck::Exceeded {
                source,
                scope,
                dimension,
            } => {
                assert_eq!(source, QuotaSource::Global);
                assert_eq!(scope, QuotaScope::Daily);
                assert_eq!(dimension, QuotaDimension::Calls);
            }
            other => panic!("expected exceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn credit_limit_counts_charge_size() {
        let tracker = QuotaTracker::new(Some(QuotaLimits {
            daily_credits: Some(10),
            ..Default::default()
        }));
        let record = record_with_quota(None);

        tracker.record(&record.key, 8).await;
        assert!(tracker.check(&record, 2).await.is_ok());
        assert!(!tracker.check(&record, 3).await.is_ok());
    }

    #[tokio::test]
    async fn buckets_roll_on_new_day() {
        let tracker = QuotaTracker::new(Some(QuotaLimits {
            daily_calls: Some(1),
            ..Default::default()
        }));
        let record = record_with_quota(None);
        tracker.record(&record.key, 1).await;
        assert!(!tracker.check(&record, 1).await.is_ok());

        // Force yesterday's bucket; the next check must roll it over.
        {
            let mut usage = tracker.usage.lock().await;
            let bucket = usage.get_mut(&record.key).unwrap();
            bucket.day = "1999-01-01".into();
        }
        assert!(tracker.check(&record, 1).await.is_ok());
    }
}
