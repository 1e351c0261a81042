//! Authoritative key/account store.
//!
//! All credit mutations are read-modify-write operations under a single
//! lock, held strictly for the in-memory update — never across network or
//! disk I/O. Every successful mutation mirrors a ledger entry, triggers the
//! optional snapshot write, and notifies the optional cross-node mirror.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ledger::{CreditLedger, LedgerEntryType};
use super::mirror::KeyMirror;
use super::{KeyConfig, KeyRecord};

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Errors surfaced by store operations. Denials that belong to the admission
/// pipeline (insufficient credits, spending limit) are *not* errors — they
/// are carried in [`DeductOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("key is revoked: {0}")]
    KeyRevoked(String),
    #[error("key is suspended: {0}")]
    KeySuspended(String),
    #[error("alias already in use: {0}")]
    AliasTaken(String),
    #[error("key capacity reached: {0} keys")]
    CapacityReached(usize),
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("cannot transfer a key to itself")]
    SelfTransfer,
    #[error("insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: u64, requested: u64 },
}

// ─── Outcomes ─────────────────────────────────────────────────────────────────

/// Result of an atomic check-and-decrement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeductOutcome {
    /// Credits charged. `auto_topup` carries the amount re-added by the
    /// auto-topup policy, when it fired.
    Charged {
        new_balance: u64,
        auto_topup: Option<u64>,
    },
    /// Balance does not cover the price. Nothing changed.
    Insufficient { balance: u64 },
    /// Lifetime spending cap would be exceeded. Nothing changed.
    SpendingLimited { balance: u64 },
}

/// Result of an all-or-nothing batch charge.
#[derive(Debug, Clone)]
pub enum BatchDeductOutcome {
    /// Every call charged its price; `balances[i]` is the balance after the
    /// i-th charge (the last one is the post-batch balance).
    Charged { balances: Vec<u64> },
    /// The charge at `index` would fail; nothing was charged.
    Failed { index: usize, insufficient: bool },
}

// ─── Store ────────────────────────────────────────────────────────────────────

pub struct KeyStore {
    records: Mutex<HashMap<String, KeyRecord>>,
    ledger: Arc<CreditLedger>,
    mirror: Option<Arc<dyn KeyMirror>>,
    /// Snapshot path; `None` disables persistence.
    state_file: Option<PathBuf>,
    /// Serializes snapshot writes so a slow write cannot be overtaken by a
    /// newer one and then clobber it.
    persist_lock: Mutex<()>,
    /// Maximum live keys (0 = unlimited).
    max_keys: usize,
}

impl KeyStore {
    pub fn new(ledger: Arc<CreditLedger>, state_file: Option<PathBuf>, max_keys: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ledger,
            mirror: None,
            state_file,
            persist_lock: Mutex::new(()),
            max_keys,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn KeyMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    // ─── Snapshot persistence ───────────────────────────────────────────────

    /// Load the snapshot file, if configured and present.
    pub async fn load_snapshot(&self) -> anyhow::Result<usize> {
        let Some(path) = &self.state_file else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let contents = tokio::fs::read_to_string(path).await?;
        let loaded: Vec<KeyRecord> = serde_json::from_str(&contents)?;
        let count = loaded.len();
        let mut records = self.records.lock().await;
        for record in loaded {
            records.insert(record.key.clone(), record);
        }
        info!(count, path = %path.display(), "loaded key snapshot");
        Ok(count)
    }

    /// Write the snapshot atomically (temp file, then rename). Failures are
    /// logged and swallowed — the in-memory balance stays authoritative.
    async fn persist(&self) {
        let Some(path) = &self.state_file else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot: Vec<KeyRecord> = {
            let records = self.records.lock().await;
            records.values().cloned().collect()
        };
        let json = match serde_json::to_vec_pretty(&snapshot) {
            Ok(j) => j,
            Err(e) => {
                warn!(err = %e, "failed to serialize key snapshot");
                return;
            }
        };
        let tmp = path.with_extension("tmp");
        let result = tokio::fs::write(&tmp, &json)
            .await
            .and_then(|_| std::fs::rename(&tmp, path));
        if let Err(e) = result {
            warn!(err = %e, path = %path.display(), "failed to write key snapshot");
        }
    }

    fn mirror_save(&self, record: &KeyRecord) {
        if let Some(mirror) = &self.mirror {
            let mirror = Arc::clone(mirror);
            let record = record.clone();
            tokio::spawn(async move {
                if let Err(e) = mirror.save_key(&record).await {
                    warn!(key = %record.key, err = %e, "key mirror save failed");
                }
            });
        }
    }

    // ─── Reads ──────────────────────────────────────────────────────────────

    pub async fn get(&self, key_id: &str) -> Option<KeyRecord> {
        self.records.lock().await.get(key_id).cloned()
    }

    pub async fn list(&self) -> Vec<KeyRecord> {
        let mut all: Vec<KeyRecord> = self.records.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Resolve an alias or a key id to the key id. Admin paths only —
    /// credentials are never resolved through aliases.
    pub async fn resolve_alias_or_id(&self, s: &str) -> Option<String> {
        let records = self.records.lock().await;
        if records.contains_key(s) {
            return Some(s.to_string());
        }
        records
            .values()
            .find(|r| r.active && r.alias.as_deref() == Some(s))
            .map(|r| r.key.clone())
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Create a key with an opaque generated id and an `initial` ledger
    /// entry. Fails on alias collision (among live keys) or capacity.
    pub async fn create(
        &self,
        name: &str,
        credits: u64,
        config: KeyConfig,
    ) -> Result<KeyRecord, StoreError> {
        let record = {
            let mut records = self.records.lock().await;
            if self.max_keys > 0 && records.len() >= self.max_keys {
                return Err(StoreError::CapacityReached(self.max_keys));
            }
            if let Some(alias) = &config.alias {
                let taken = records
                    .values()
                    .any(|r| r.active && r.alias.as_deref() == Some(alias.as_str()));
                if taken {
                    return Err(StoreError::AliasTaken(alias.clone()));
                }
            }
            let key = format!("pg_{}", Uuid::new_v4().simple());
            let record = KeyRecord {
                key: key.clone(),
                name: name.to_string(),
                credits,
                total_spent: 0,
                total_calls: 0,
                allowed_calls: 0,
                denied_calls: 0,
                created_at: Utc::now(),
                last_used_at: None,
                active: true,
                suspended: false,
                expires_at: config.expires_at,
                spending_limit: config.spending_limit,
                allowed_tools: config.allowed_tools,
                denied_tools: config.denied_tools,
                ip_allowlist: config.ip_allowlist,
                allowed_countries: config.allowed_countries,
                denied_countries: config.denied_countries,
                quota: config.quota,
                rate_limit_per_minute: config.rate_limit_per_minute,
                auto_topup: config.auto_topup,
                auto_topup_today: None,
                namespace: config.namespace,
                group: config.group,
                tags: config.tags,
                alias: config.alias,
            };
            records.insert(key, record.clone());
            record
        };

        self.ledger
            .record(
                &record.key,
                LedgerEntryType::Initial,
                credits,
                0,
                credits,
                None,
                None,
            )
            .await;
        info!(key = %record.key, name, credits, "key created");
        self.mirror_save(&record);
        self.persist().await;
        Ok(record)
    }

    pub async fn revoke(&self, key_id: &str) -> Result<(), StoreError> {
        {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(key_id)
                .ok_or_else(|| StoreError::KeyNotFound(key_id.into()))?;
            record.active = false;
        }
        info!(key = key_id, "key revoked");
        if let Some(mirror) = &self.mirror {
            let mirror = Arc::clone(mirror);
            let key = key_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = mirror.revoke_key(&key).await {
                    warn!(key = %key, err = %e, "key mirror revoke failed");
                }
            });
        }
        self.persist().await;
        Ok(())
    }

    pub async fn suspend(&self, key_id: &str) -> Result<(), StoreError> {
        self.set_suspended(key_id, true).await
    }

    pub async fn resume(&self, key_id: &str) -> Result<(), StoreError> {
        self.set_suspended(key_id, false).await
    }

    async fn set_suspended(&self, key_id: &str, suspended: bool) -> Result<(), StoreError> {
        let record = {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(key_id)
                .ok_or_else(|| StoreError::KeyNotFound(key_id.into()))?;
            record.suspended = suspended;
            record.clone()
        };
        info!(key = key_id, suspended, "key suspension changed");
        self.mirror_save(&record);
        self.persist().await;
        Ok(())
    }

    // ─── Credit mutations ───────────────────────────────────────────────────

    /// Add credits to an active, non-suspended key. `entry_type` selects the
    /// ledger entry kind (`Topup`, `BulkTopup`).
    pub async fn add_credits(
        &self,
        key_id: &str,
        amount: u64,
        entry_type: LedgerEntryType,
        memo: Option<String>,
    ) -> Result<u64, StoreError> {
        if amount == 0 {
            return Err(StoreError::InvalidAmount);
        }
        let (before, after) = {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(key_id)
                .ok_or_else(|| StoreError::KeyNotFound(key_id.into()))?;
            if !record.active {
                return Err(StoreError::KeyRevoked(key_id.into()));
            }
            if record.suspended {
                return Err(StoreError::KeySuspended(key_id.into()));
            }
            let before = record.credits;
            record.credits = record.credits.saturating_add(amount);
            (before, record.credits)
        };

        self.ledger
            .record(key_id, entry_type, amount, before, after, None, memo)
            .await;
        debug!(key = key_id, amount, balance = after, "credits added");
        if let Some(mirror) = &self.mirror {
            let mirror = Arc::clone(mirror);
            let key = key_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = mirror.atomic_topup(&key, amount).await {
                    warn!(key = %key, err = %e, "key mirror topup failed");
                }
            });
        }
        self.persist().await;
        Ok(after)
    }

    /// Atomic check-and-decrement of one key's balance.
    ///
    /// Charging bumps `total_calls`/`allowed_calls`/`total_spent`, stamps
    /// `last_used_at`, applies the auto-topup policy, and writes a
    /// `deduction` ledger entry. The spending-limit check happens here, under
    /// the same lock, so two concurrent deductions cannot both pass a cap
    /// that covers only one of them.
    pub async fn deduct_credits(
        &self,
        key_id: &str,
        amount: u64,
        tool: &str,
    ) -> Result<DeductOutcome, StoreError> {
        let now = Utc::now();
        let (outcome, entries) = {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(key_id)
                .ok_or_else(|| StoreError::KeyNotFound(key_id.into()))?;
            if !record.active {
                return Err(StoreError::KeyRevoked(key_id.into()));
            }
            if record.suspended {
                return Err(StoreError::KeySuspended(key_id.into()));
            }

            if record.spending_limit > 0
                && record.total_spent.saturating_add(amount) > record.spending_limit
            {
                return Ok(DeductOutcome::SpendingLimited {
                    balance: record.credits,
                });
            }
            if record.credits < amount {
                return Ok(DeductOutcome::Insufficient {
                    balance: record.credits,
                });
            }

            let before = record.credits;
            record.credits -= amount;
            record.total_spent += amount;
            record.total_calls += 1;
            record.allowed_calls += 1;
            record.last_used_at = Some(now);

            let mut entries = vec![(
                LedgerEntryType::Deduction,
                amount,
                before,
                record.credits,
                Some(tool.to_string()),
                None,
            )];

            let topped_up = apply_auto_topup(record, now);
            if let Some(added) = topped_up {
                entries.push((
                    LedgerEntryType::AutoTopup,
                    added,
                    record.credits - added,
                    record.credits,
                    None,
                    None,
                ));
            }

            (
                DeductOutcome::Charged {
                    new_balance: record.credits,
                    auto_topup: topped_up,
                },
                entries,
            )
        };

        for (entry_type, amt, before, after, tool, memo) in entries {
            self.ledger
                .record(key_id, entry_type, amt, before, after, tool, memo)
                .await;
        }
        self.persist().await;
        Ok(outcome)
    }

    /// All-or-nothing charge for a batch of priced calls. Either every call
    /// is charged (with one `deduction` ledger entry each) or the balance is
    /// untouched and the failing index is reported.
    pub async fn deduct_batch(
        &self,
        key_id: &str,
        calls: &[(String, u64)],
    ) -> Result<BatchDeductOutcome, StoreError> {
        let now = Utc::now();
        let (outcome, entries) = {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(key_id)
                .ok_or_else(|| StoreError::KeyNotFound(key_id.into()))?;
            if !record.active {
                return Err(StoreError::KeyRevoked(key_id.into()));
            }
            if record.suspended {
                return Err(StoreError::KeySuspended(key_id.into()));
            }

            // Dry run against a hypothetical balance to find the first
            // failing index without mutating anything.
            let mut balance = record.credits;
            let mut spent = record.total_spent;
            for (index, (_, price)) in calls.iter().enumerate() {
                if record.spending_limit > 0
                    && spent.saturating_add(*price) > record.spending_limit
                {
                    return Ok(BatchDeductOutcome::Failed {
                        index,
                        insufficient: false,
                    });
                }
                if balance < *price {
                    return Ok(BatchDeductOutcome::Failed {
                        index,
                        insufficient: true,
                    });
                }
                balance -= price;
                spent += price;
            }

            // All checks passed — apply every charge under the same lock.
            let mut entries = Vec::with_capacity(calls.len());
            let mut balances = Vec::with_capacity(calls.len());
            for (tool, price) in calls {
                let before = record.credits;
                record.credits -= price;
                record.total_spent += price;
                record.total_calls += 1;
                record.allowed_calls += 1;
                entries.push((*price, before, record.credits, tool.clone()));
                balances.push(record.credits);
            }
            record.last_used_at = Some(now);

            (BatchDeductOutcome::Charged { balances }, entries)
        };

        for (price, before, after, tool) in entries {
            self.ledger
                .record(
                    key_id,
                    LedgerEntryType::Deduction,
                    price,
                    before,
                    after,
                    Some(tool),
                    None,
                )
                .await;
        }
        self.persist().await;
        Ok(outcome)
    }

    /// Return charged credits after a downstream failure. Decrements
    /// `total_spent` (refunds unwind spend accounting); call counters stay.
    pub async fn refund(
        &self,
        key_id: &str,
        amount: u64,
        tool: &str,
    ) -> Result<u64, StoreError> {
        if amount == 0 {
            return Err(StoreError::InvalidAmount);
        }
        let (before, after) = {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(key_id)
                .ok_or_else(|| StoreError::KeyNotFound(key_id.into()))?;
            let before = record.credits;
            record.credits = record.credits.saturating_add(amount);
            record.total_spent = record.total_spent.saturating_sub(amount);
            (before, record.credits)
        };

        self.ledger
            .record(
                key_id,
                LedgerEntryType::Refund,
                amount,
                before,
                after,
                Some(tool.to_string()),
                None,
            )
            .await;
        debug!(key = key_id, amount, balance = after, tool, "credits refunded");
        self.persist().await;
        Ok(after)
    }

    /// Two-record atomic move with paired `transfer_out`/`transfer_in`
    /// entries. Both records change under one lock acquisition — either both
    /// apply or neither.
    pub async fn transfer(
        &self,
        from_id: &str,
        to_id: &str,
        amount: u64,
        memo: Option<String>,
    ) -> Result<(u64, u64), StoreError> {
        if amount == 0 {
            return Err(StoreError::InvalidAmount);
        }
        if from_id == to_id {
            return Err(StoreError::SelfTransfer);
        }
        let (from_before, from_after, to_before, to_after) = {
            let mut records = self.records.lock().await;
            let from = records
                .get(from_id)
                .ok_or_else(|| StoreError::KeyNotFound(from_id.into()))?;
            if !from.active {
                return Err(StoreError::KeyRevoked(from_id.into()));
            }
            if from.credits < amount {
                return Err(StoreError::InsufficientCredits {
                    balance: from.credits,
                    requested: amount,
                });
            }
            let to = records
                .get(to_id)
                .ok_or_else(|| StoreError::KeyNotFound(to_id.into()))?;
            if !to.active {
                return Err(StoreError::KeyRevoked(to_id.into()));
            }

            let from = records.get_mut(from_id).expect("checked above");
            let from_before = from.credits;
            from.credits -= amount;
            let from_after = from.credits;

            let to = records.get_mut(to_id).expect("checked above");
            let to_before = to.credits;
            to.credits += amount;
            (from_before, from_after, to_before, to.credits)
        };

        self.ledger
            .record(
                from_id,
                LedgerEntryType::TransferOut,
                amount,
                from_before,
                from_after,
                None,
                memo.clone(),
            )
            .await;
        self.ledger
            .record(
                to_id,
                LedgerEntryType::TransferIn,
                amount,
                to_before,
                to_after,
                None,
                memo,
            )
            .await;
        info!(from = from_id, to = to_id, amount, "credits transferred");
        self.persist().await;
        Ok((from_after, to_after))
    }

    /// Bump the denial counter for a key that failed admission. Denials
    /// touch nothing else — `total_calls` counts charged calls only.
    pub async fn note_denied(&self, key_id: &str) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(key_id) {
            record.denied_calls += 1;
        }
    }
}

/// Apply the auto-topup policy after a successful deduction. Returns the
/// amount added, if the policy fired.
fn apply_auto_topup(record: &mut KeyRecord, now: chrono::DateTime<Utc>) -> Option<u64> {
    let policy = record.auto_topup.clone()?;
    if record.credits >= policy.threshold {
        return None;
    }
    let today = now.format("%Y-%m-%d").to_string();
    let count_today = match &record.auto_topup_today {
        Some((day, count)) if *day == today => *count,
        _ => 0,
    };
    if count_today >= policy.max_daily {
        return None;
    }
    record.credits = record.credits.saturating_add(policy.amount);
    record.auto_topup_today = Some((today, count_today + 1));
    Some(policy.amount)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ledger::HistoryQuery;
    use crate::keys::AutoTopup;

    fn store() -> KeyStore {
        KeyStore::new(Arc::new(CreditLedger::default()), None, 0)
    }

    #[tokio::test]
    async fn create_writes_initial_entry() {
        let store = store();
        let record = store.create("alice", 100, KeyConfig::default()).await.unwrap();
        assert!(record.key.starts_with("pg_"));
        assert_eq!(record.credits, 100);

        let history = store
            .ledger()
            .history(&record.key, &HistoryQuery::default())
            .await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].entry_type, LedgerEntryType::Initial);
        assert_eq!(history[0].balance_after, 100);
    }

    #[tokio::test]
    async fn deduct_and_ledger_balances() {
        let store = store();
        let record = store.create("k", 100, KeyConfig::default()).await.unwrap();
        let outcome = store.deduct_credits(&record.key, 5, "echo").await.unwrap();
        assert_eq!(
            outcome,
            DeductOutcome::Charged {
                new_balance: 95,
                auto_topup: None
            }
        );

        let deductions = store
            .ledger()
            .history(
                &record.key,
                &HistoryQuery {
                    entry_type: Some(LedgerEntryType::Deduction),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(deductions.len(), 1);
        assert_eq!(deductions[0].balance_before, 100);
        assert_eq!(deductions[0].balance_after, 95);
        assert_eq!(deductions[0].tool.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn deduct_insufficient_leaves_balance() {
        let store = store();
        let record = store.create("k", 3, KeyConfig::default()).await.unwrap();
        let outcome = store.deduct_credits(&record.key, 5, "echo").await.unwrap();
        assert_eq!(outcome, DeductOutcome::Insufficient { balance: 3 });
        assert_eq!(store.get(&record.key).await.unwrap().credits, 3);
        assert_eq!(store.get(&record.key).await.unwrap().total_calls, 0);
    }

    #[tokio::test]
    async fn spending_limit_blocks_inside_deduct() {
        let store = store();
        let config = KeyConfig {
            spending_limit: 8,
            ..Default::default()
        };
        let record = store.create("k", 100, config).await.unwrap();
        assert!(matches!(
            store.deduct_credits(&record.key, 5, "a").await.unwrap(),
            DeductOutcome::Charged { .. }
        ));
        assert_eq!(
            store.deduct_credits(&record.key, 5, "a").await.unwrap(),
            DeductOutcome::SpendingLimited { balance: 95 }
        );
    }

    #[tokio::test]
    async fn suspended_key_denies_deduct_allows_read() {
        let store = store();
        let record = store.create("k", 50, KeyConfig::default()).await.unwrap();
        store.suspend(&record.key).await.unwrap();
        assert!(matches!(
            store.deduct_credits(&record.key, 1, "t").await,
            Err(StoreError::KeySuspended(_))
        ));
        assert_eq!(store.get(&record.key).await.unwrap().credits, 50);

        store.resume(&record.key).await.unwrap();
        assert!(matches!(
            store.deduct_credits(&record.key, 1, "t").await.unwrap(),
            DeductOutcome::Charged { .. }
        ));
    }

    #[tokio::test]
    async fn refund_restores_balance_and_unwinds_spend() {
        let store = store();
        let record = store.create("k", 100, KeyConfig::default()).await.unwrap();
        store.deduct_credits(&record.key, 5, "echo").await.unwrap();
        store.refund(&record.key, 5, "echo").await.unwrap();

        let after = store.get(&record.key).await.unwrap();
        assert_eq!(after.credits, 100);
        assert_eq!(after.total_spent, 0);
        assert_eq!(after.total_calls, 1);

        let refunds = store
            .ledger()
            .history(
                &record.key,
                &HistoryQuery {
                    entry_type: Some(LedgerEntryType::Refund),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(refunds.len(), 1);
    }

    #[tokio::test]
    async fn transfer_is_paired_and_atomic() {
        let store = store();
        let a = store.create("a", 100, KeyConfig::default()).await.unwrap();
        let b = store.create("b", 10, KeyConfig::default()).await.unwrap();

        let (from_after, to_after) = store
            .transfer(&a.key, &b.key, 40, Some("rebalance".into()))
            .await
            .unwrap();
        assert_eq!(from_after, 60);
        assert_eq!(to_after, 50);

        // Over-transfer fails and changes nothing.
        let err = store.transfer(&b.key, &a.key, 500, None).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientCredits { .. }));
        assert_eq!(store.get(&a.key).await.unwrap().credits, 60);
        assert_eq!(store.get(&b.key).await.unwrap().credits, 50);
    }

    #[tokio::test]
    async fn alias_unique_across_live_keys() {
        let store = store();
        let config = KeyConfig {
            alias: Some("prod".into()),
            ..Default::default()
        };
        let first = store.create("k1", 10, config.clone()).await.unwrap();
        assert!(matches!(
            store.create("k2", 10, config.clone()).await,
            Err(StoreError::AliasTaken(_))
        ));

        // Revoking frees the alias for a new key.
        store.revoke(&first.key).await.unwrap();
        assert!(store.create("k3", 10, config).await.is_ok());

        assert_eq!(
            store.resolve_alias_or_id("prod").await,
            store.list().await.iter().find(|r| r.active).map(|r| r.key.clone())
        );
    }

    #[tokio::test]
    async fn batch_deduct_all_or_nothing() {
        let store = store();
        let record = store.create("k", 12, KeyConfig::default()).await.unwrap();
        let calls = vec![
            ("a".to_string(), 5),
            ("b".to_string(), 5),
            ("c".to_string(), 5),
        ];
        match store.deduct_batch(&record.key, &calls).await.unwrap() {
            BatchDeductOutcome::Failed { index, insufficient } => {
                assert_eq!(index, 2);
                assert!(insufficient);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(store.get(&record.key).await.unwrap().credits, 12);

        let calls = vec![("a".to_string(), 5), ("b".to_string(), 5)];
        match store.deduct_batch(&record.key, &calls).await.unwrap() {
            BatchDeductOutcome::Charged { balances } => assert_eq!(balances, vec![7, 2]),
            other => panic!("expected charge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auto_topup_fires_below_threshold() {
        let store = store();
        let config = KeyConfig {
            auto_topup: Some(AutoTopup {
                threshold: 10,
                amount: 50,
                max_daily: 1,
            }),
            ..Default::default()
        };
        let record = store.create("k", 12, config).await.unwrap();

        // 12 → 7, below threshold 10 → topped up to 57.
        let outcome = store.deduct_credits(&record.key, 5, "t").await.unwrap();
        assert_eq!(
            outcome,
            DeductOutcome::Charged {
                new_balance: 57,
                auto_topup: Some(50)
            }
        );

        // Burn down below threshold again; max_daily=1 blocks a second topup.
        store.deduct_credits(&record.key, 50, "t").await.unwrap();
        let outcome = store.deduct_credits(&record.key, 5, "t").await.unwrap();
        assert_eq!(
            outcome,
            DeductOutcome::Charged {
                new_balance: 2,
                auto_topup: None
            }
        );
    }

    #[tokio::test]
    async fn concurrent_deducts_never_overspend() {
        let store = Arc::new(store());
        let record = store.create("k", 100, KeyConfig::default()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            let key = record.key.clone();
            handles.push(tokio::spawn(async move {
                matches!(
                    store.deduct_credits(&key, 7, "t").await.unwrap(),
                    DeductOutcome::Charged { .. }
                )
            }));
        }
        let successes = {
            let mut n = 0u64;
            for h in handles {
                if h.await.unwrap() {
                    n += 1;
                }
            }
            n
        };

        // 100 / 7 = 14 charges max; balance never goes negative.
        assert_eq!(successes, 14);
        let after = store.get(&record.key).await.unwrap();
        assert_eq!(after.credits, 100 - successes * 7);
        assert_eq!(after.total_spent, successes * 7);
    }

    #[tokio::test]
    async fn mirror_notified_after_commit() {
        use crate::keys::mirror::KeyMirror;
        use std::sync::Mutex as StdMutex;

        #[derive(Default)]
        struct RecordingMirror {
            saves: StdMutex<Vec<String>>,
            topups: StdMutex<Vec<(String, u64)>>,
            revokes: StdMutex<Vec<String>>,
        }

        #[async_trait::async_trait]
        impl KeyMirror for RecordingMirror {
            async fn save_key(&self, record: &KeyRecord) -> anyhow::Result<()> {
                self.saves.lock().unwrap().push(record.key.clone());
                Ok(())
            }
            async fn revoke_key(&self, key_id: &str) -> anyhow::Result<()> {
                self.revokes.lock().unwrap().push(key_id.to_string());
                Ok(())
            }
            async fn atomic_topup(&self, key_id: &str, amount: u64) -> anyhow::Result<()> {
                self.topups.lock().unwrap().push((key_id.to_string(), amount));
                Ok(())
            }
        }

        let mirror = Arc::new(RecordingMirror::default());
        let store = KeyStore::new(Arc::new(CreditLedger::default()), None, 0)
            .with_mirror(Arc::clone(&mirror) as Arc<dyn KeyMirror>);

        let record = store.create("m", 10, KeyConfig::default()).await.unwrap();
        store
            .add_credits(&record.key, 5, LedgerEntryType::Topup, None)
            .await
            .unwrap();
        store.revoke(&record.key).await.unwrap();

        // Mirror calls are fire-and-forget; give the spawned tasks a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(mirror.saves.lock().unwrap().as_slice(), &[record.key.clone()]);
        assert_eq!(
            mirror.topups.lock().unwrap().as_slice(),
            &[(record.key.clone(), 5)]
        );
        assert_eq!(mirror.revokes.lock().unwrap().as_slice(), &[record.key.clone()]);
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let store = KeyStore::new(Arc::new(CreditLedger::default()), Some(path.clone()), 0);
        let record = store.create("persist-me", 77, KeyConfig::default()).await.unwrap();

        let reloaded = KeyStore::new(Arc::new(CreditLedger::default()), Some(path), 0);
        assert_eq!(reloaded.load_snapshot().await.unwrap(), 1);
        let loaded = reloaded.get(&record.key).await.unwrap();
        assert_eq!(loaded.credits, 77);
        assert_eq!(loaded.name, "persist-me");
    }
}
