//! `keys` — API key accounts, credit balances, and the credit ledger.
//!
//! - **KeyRecord** — durable account state for one API key: balance,
//!   counters, status flags, ACLs, quota overrides, auto-topup policy.
//! - **KeyStore** — authoritative map `key id → record`; every credit
//!   mutation is a linearizable single-writer operation under its lock.
//! - **CreditLedger** — bounded per-key append log of credit-changing
//!   events, with spending-velocity and depletion analysis.
//! - **KeyMirror** — optional fire-and-forget replication hook for
//!   cross-node deployments.

pub mod ledger;
pub mod mirror;
pub mod store;

pub use ledger::{CreditLedger, LedgerEntry, LedgerEntryType, SpendingVelocity};
pub use mirror::KeyMirror;
pub use store::{BatchDeductOutcome, DeductOutcome, KeyStore, StoreError};

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Quota limits ─────────────────────────────────────────────────────────────

/// Daily/monthly call- and credit-limits. `None` means unlimited in that
/// dimension. Used both as a per-key override and as the global default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_calls: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_calls: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_credits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_credits: Option<u64>,
}

impl QuotaLimits {
    pub fn is_unlimited(&self) -> bool {
        self.daily_calls.is_none()
            && self.monthly_calls.is_none()
            && self.daily_credits.is_none()
            && self.monthly_credits.is_none()
    }
}

// ─── Auto-topup policy ────────────────────────────────────────────────────────

/// Automatic balance replenishment: when a deduction drops the balance below
/// `threshold`, add `amount` credits, at most `max_daily` times per UTC day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoTopup {
    pub threshold: u64,
    pub amount: u64,
    pub max_daily: u32,
}

// ─── Key record ───────────────────────────────────────────────────────────────

/// The account for one API key. The `key` field is both the identifier and
/// the credential; `alias` is a human-friendly handle for admin paths only
/// and is never accepted where a credential is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub key: String,
    pub name: String,
    /// Spendable balance. Never observable below zero.
    pub credits: u64,
    pub total_spent: u64,
    pub total_calls: u64,
    pub allowed_calls: u64,
    pub denied_calls: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// `false` means permanently revoked. A revoked key id is never reused.
    pub active: bool,
    /// `true` means temporarily disabled.
    pub suspended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Lifetime cap on `total_spent`; 0 = unlimited.
    #[serde(default)]
    pub spending_limit: u64,
    /// Whitelist when non-empty.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub allowed_tools: HashSet<String>,
    /// Always-deny blacklist.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub denied_tools: HashSet<String>,
    /// Addresses or CIDR ranges; when non-empty the client IP must match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_allowlist: Vec<String>,
    /// ISO-3166-1 alpha-2 codes, matched against a trusted header.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub allowed_countries: HashSet<String>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub denied_countries: HashSet<String>,
    /// Per-key quota override; takes precedence over the global config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaLimits>,
    /// Per-key rate-limit ceiling (requests per minute).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_topup: Option<AutoTopup>,
    /// Rolling per-day auto-topup accounting: `(YYYY-MM-DD, count)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_topup_today: Option<(String, u32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Unique short name resolvable in admin paths. Never a credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Options applied when creating a key. Everything not listed here starts at
/// its zero value on the new record.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyConfig {
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub spending_limit: u64,
    #[serde(default)]
    pub allowed_tools: HashSet<String>,
    #[serde(default)]
    pub denied_tools: HashSet<String>,
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    #[serde(default)]
    pub allowed_countries: HashSet<String>,
    #[serde(default)]
    pub denied_countries: HashSet<String>,
    #[serde(default)]
    pub quota: Option<QuotaLimits>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u64>,
    #[serde(default)]
    pub auto_topup: Option<AutoTopup>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Why a tool name is rejected by a key's ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclVerdict {
    Allowed,
    /// Whitelist present and the tool is not on it.
    NotWhitelisted,
    /// Tool is on the blacklist.
    Blacklisted,
}

impl KeyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Apply the whitelist/blacklist ACL to a (prefixed) tool name.
    pub fn check_tool(&self, tool: &str) -> AclVerdict {
        if self.denied_tools.contains(tool) {
            return AclVerdict::Blacklisted;
        }
        if !self.allowed_tools.is_empty() && !self.allowed_tools.contains(tool) {
            return AclVerdict::NotWhitelisted;
        }
        AclVerdict::Allowed
    }

    /// Whether the ACL admits a tool (used when filtering `tools/list`).
    pub fn tool_visible(&self, tool: &str) -> bool {
        self.check_tool(tool) == AclVerdict::Allowed
    }

    /// Whether the client IP matches the allowlist. An empty allowlist
    /// admits everything; an unparseable client IP fails closed.
    pub fn ip_allowed(&self, client_ip: Option<&str>) -> bool {
        if self.ip_allowlist.is_empty() {
            return true;
        }
        let Some(ip) = client_ip.and_then(|s| s.parse::<IpAddr>().ok()) else {
            return false;
        };
        self.ip_allowlist.iter().any(|pat| ip_matches(&ip, pat))
    }
}

// ─── IP / CIDR matching ───────────────────────────────────────────────────────

/// Match an IP against a plain address or a CIDR range (`10.0.0.0/8`,
/// `2001:db8::/32`). Malformed patterns never match.
pub fn ip_matches(ip: &IpAddr, pattern: &str) -> bool {
    match pattern.split_once('/') {
        None => pattern.parse::<IpAddr>().map(|p| p == *ip).unwrap_or(false),
        Some((net, bits)) => {
            let (Ok(net), Ok(bits)) = (net.parse::<IpAddr>(), bits.parse::<u32>()) else {
                return false;
            };
            match (ip, net) {
                (IpAddr::V4(ip), IpAddr::V4(net)) => {
                    prefix_eq(&ip.octets(), &net.octets(), bits.min(32))
                }
                (IpAddr::V6(ip), IpAddr::V6(net)) => {
                    prefix_eq(&ip.octets(), &net.octets(), bits.min(128))
                }
                _ => false,
            }
        }
    }
}

fn prefix_eq(a: &[u8], b: &[u8], bits: u32) -> bool {
    let full = (bits / 8) as usize;
    if a[..full] != b[..full] {
        return false;
    }
    let rem = bits % 8;
    if rem == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem);
    (a[full] & mask) == (b[full] & mask)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
