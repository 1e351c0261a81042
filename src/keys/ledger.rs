//! Bounded per-key append log of credit-changing events.
//!
//! The balance on the `KeyRecord` is authoritative; the ledger is derived
//! and advisory. Entries may be dropped under pressure (FIFO once the
//! per-key cap is reached) without losing accounting correctness, and a
//! failed ledger write never aborts the credit mutation that produced it.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Default maximum entries retained per key.
pub const DEFAULT_LEDGER_CAP: usize = 100;

// ─── Entry types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Initial,
    Topup,
    Deduction,
    TransferIn,
    TransferOut,
    AutoTopup,
    Refund,
    BulkTopup,
}

impl LedgerEntryType {
    /// Entry types that represent credits leaving the key.
    fn is_debit(self) -> bool {
        matches!(self, Self::Deduction | Self::TransferOut)
    }
}

/// One credit-changing event. Timestamps are server-generated at record time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub entry_type: LedgerEntryType,
    pub amount: u64,
    pub balance_before: u64,
    pub balance_after: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Filters for `CreditLedger::history`.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub entry_type: Option<LedgerEntryType>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

// ─── Velocity analysis ────────────────────────────────────────────────────────

/// Spending-rate summary over a trailing window, with a depletion forecast.
/// All monetary rates are rounded to 2 decimals.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingVelocity {
    pub window_hours: f64,
    pub total_debited: u64,
    pub data_points: usize,
    pub credits_per_hour: f64,
    pub credits_per_day: f64,
    pub calls_per_hour: f64,
    pub calls_per_day: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours_remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depletion_date: Option<DateTime<Utc>>,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

/// In-memory append log, one bounded deque per key.
pub struct CreditLedger {
    entries: Mutex<HashMap<String, VecDeque<LedgerEntry>>>,
    cap: usize,
}

impl Default for CreditLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAP)
    }
}

impl CreditLedger {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cap: cap.max(1),
        }
    }

    /// Append an entry for `key_id`, stamping it with the current time and
    /// evicting the oldest entry once the per-key cap is exceeded.
    pub async fn record(
        &self,
        key_id: &str,
        entry_type: LedgerEntryType,
        amount: u64,
        balance_before: u64,
        balance_after: u64,
        tool: Option<String>,
        memo: Option<String>,
    ) {
        let entry = LedgerEntry {
            timestamp: Utc::now(),
            entry_type,
            amount,
            balance_before,
            balance_after,
            tool,
            memo,
        };
        let mut map = self.entries.lock().await;
        let log = map.entry(key_id.to_string()).or_default();
        log.push_back(entry);
        while log.len() > self.cap {
            log.pop_front();
        }
    }

    /// Newest-first history for one key, optionally filtered.
    pub async fn history(&self, key_id: &str, query: &HistoryQuery) -> Vec<LedgerEntry> {
        let map = self.entries.lock().await;
        let Some(log) = map.get(key_id) else {
            return Vec::new();
        };
        let iter = log
            .iter()
            .rev()
            .filter(|e| query.entry_type.is_none_or(|t| e.entry_type == t))
            .filter(|e| query.since.is_none_or(|s| e.timestamp >= s));
        match query.limit {
            Some(n) => iter.take(n).cloned().collect(),
            None => iter.cloned().collect(),
        }
    }

    /// Compute the spending rate over the trailing `window_hours` and, given
    /// the current balance, forecast when the key runs dry.
    ///
    /// Span selection:
    /// - two or more debits: time between the newest and oldest debit,
    ///   falling back to the full window if the span is not positive;
    /// - one debit: time since that debit, floored at ~36 seconds so a
    ///   just-now debit does not produce an absurd rate;
    /// - no debits: the full window.
    pub async fn spending_velocity(
        &self,
        key_id: &str,
        current_balance: u64,
        window_hours: f64,
    ) -> SpendingVelocity {
        let now = Utc::now();
        let window_start = now - Duration::seconds((window_hours * 3600.0) as i64);

        let map = self.entries.lock().await;
        let debits: Vec<&LedgerEntry> = map
            .get(key_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.entry_type.is_debit() && e.timestamp >= window_start)
                    .collect()
            })
            .unwrap_or_default();

        let total_debited: u64 = debits.iter().map(|e| e.amount).sum();
        let data_points = debits.len();

        let span_hours = match data_points {
            0 => window_hours,
            1 => {
                let h = (now - debits[0].timestamp).num_milliseconds() as f64 / 3_600_000.0;
                h.max(0.01)
            }
            _ => {
                let newest = debits.iter().map(|e| e.timestamp).max().unwrap();
                let oldest = debits.iter().map(|e| e.timestamp).min().unwrap();
                let h = (newest - oldest).num_milliseconds() as f64 / 3_600_000.0;
                if h > 0.0 {
                    h
                } else {
                    window_hours
                }
            }
        };

        let credits_per_hour = if total_debited == 0 {
            0.0
        } else {
            round2(total_debited as f64 / span_hours)
        };
        let calls_per_hour = if data_points == 0 {
            0.0
        } else {
            round2(data_points as f64 / span_hours)
        };

        let (hours_remaining, depletion_date) = if current_balance == 0 {
            (Some(0.0), Some(now))
        } else if credits_per_hour > 0.0 {
            let hours = round2(current_balance as f64 / credits_per_hour);
            let eta = now + Duration::seconds((hours * 3600.0) as i64);
            (Some(hours), Some(eta))
        } else {
            (None, None)
        };

        SpendingVelocity {
            window_hours,
            total_debited,
            data_points,
            credits_per_hour,
            credits_per_day: round2(credits_per_hour * 24.0),
            calls_per_hour,
            calls_per_day: round2(calls_per_hour * 24.0),
            hours_remaining,
            depletion_date,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
