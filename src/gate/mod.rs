//! `gate` — the admission decision pipeline for tool calls.
//!
//! Given (key, tool call, client metadata), the gate composes the key state
//! checks, IP/country/ACL/scope predicates, pricing, rate limiting, and
//! quota into one [`AdmissionDecision`]. Steps 1–9 only read state; the
//! single mutation is the atomic check-and-decrement in the key store.
//!
//! Shadow mode evaluates the full pipeline but enforces nothing: every call
//! is admitted with zero charge, and would-be denials are broadcast as
//! `shadow_denial` events.

pub mod quota;
pub mod rate_limit;

pub use quota::{QuotaCheck, QuotaTracker};
pub use rate_limit::{RateCheck, RateLimitConfig, RateLimiter};

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::events::{EventBroadcaster, GatewayEvent, ShadowDenialEvent};
use crate::keys::{AclVerdict, BatchDeductOutcome, DeductOutcome, KeyRecord, KeyStore, StoreError};
use crate::pricing::PricingTable;

// ─── Denial reasons ───────────────────────────────────────────────────────────

/// Closed set of admission denial reasons, surfaced verbatim in
/// `"Payment required: <reason>"` error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    InvalidKey,
    KeyRevoked,
    KeySuspended,
    KeyExpired,
    IpNotAllowed,
    CountryNotAllowed,
    CountryDenied,
    ToolNotAllowed,
    ToolDenied,
    TokenScope,
    RateLimited,
    QuotaExceeded,
    SpendingLimit,
    InsufficientCredits,
    ContentPolicy,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid_key",
            Self::KeyRevoked => "key_revoked",
            Self::KeySuspended => "key_suspended",
            Self::KeyExpired => "key_expired",
            Self::IpNotAllowed => "ip_not_allowed",
            Self::CountryNotAllowed => "country_not_allowed",
            Self::CountryDenied => "country_denied",
            Self::ToolNotAllowed => "tool_not_allowed",
            Self::ToolDenied => "tool_denied",
            Self::TokenScope => "token_scope",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceeded => "quota_exceeded",
            Self::SpendingLimit => "spending_limit",
            Self::InsufficientCredits => "insufficient_credits",
            Self::ContentPolicy => "content_policy",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Decisions ────────────────────────────────────────────────────────────────

/// Result of evaluating one tool call. `credits_required` is the resolved
/// price whether or not the call was admitted, so denials can tell the
/// caller what a retry would cost.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub credits_charged: u64,
    pub credits_required: u64,
    pub remaining_credits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
}

impl AdmissionDecision {
    fn allow(price: u64, remaining_credits: u64) -> Self {
        Self {
            allowed: true,
            credits_charged: price,
            credits_required: price,
            remaining_credits,
            reason: None,
        }
    }

    fn deny(reason: DenialReason, price: u64, remaining_credits: u64) -> Self {
        Self {
            allowed: false,
            credits_charged: 0,
            credits_required: price,
            remaining_credits,
            reason: Some(reason),
        }
    }
}

/// Result of evaluating a batch all-or-nothing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDecision {
    pub all_allowed: bool,
    pub decisions: Vec<AdmissionDecision>,
    pub total_credits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    pub remaining_credits: u64,
}

/// One tool call as seen by the gate: the *prefixed* public name plus its
/// arguments.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Request metadata extracted by the edge.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub client_ip: Option<String>,
    /// From the trusted `X-Country` header.
    pub client_country: Option<String>,
    /// Tool whitelist carried by a scoped token, when one authenticated the
    /// request.
    pub scoped_tools: Option<HashSet<String>>,
}

// ─── Free methods ─────────────────────────────────────────────────────────────

/// Methods that bypass admission entirely (discovery and lifecycle).
/// A trailing `*` matches any method with that prefix.
#[derive(Debug, Clone)]
pub struct FreeMethods {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

pub fn default_free_methods() -> Vec<String> {
    [
        "initialize",
        "initialized",
        "ping",
        "notifications/*",
        "tools/list",
        "resources/list",
        "prompts/list",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl FreeMethods {
    pub fn new(patterns: &[String]) -> Self {
        let mut exact = HashSet::new();
        let mut prefixes = Vec::new();
        for p in patterns {
            match p.strip_suffix('*') {
                Some(prefix) => prefixes.push(prefix.to_string()),
                None => {
                    exact.insert(p.clone());
                }
            }
        }
        Self { exact, prefixes }
    }

    pub fn is_free(&self, method: &str) -> bool {
        self.exact.contains(method) || self.prefixes.iter().any(|p| method.starts_with(p.as_str()))
    }
}

impl Default for FreeMethods {
    fn default() -> Self {
        Self::new(&default_free_methods())
    }
}

// ─── Gate ─────────────────────────────────────────────────────────────────────

pub struct Gate {
    store: Arc<KeyStore>,
    quota: QuotaTracker,
    limiter: RateLimiter,
    pricing: PricingTable,
    free_methods: FreeMethods,
    shadow_mode: bool,
    broadcaster: EventBroadcaster,
}

impl Gate {
    pub fn new(
        store: Arc<KeyStore>,
        quota: QuotaTracker,
        limiter: RateLimiter,
        pricing: PricingTable,
        free_methods: FreeMethods,
        shadow_mode: bool,
        broadcaster: EventBroadcaster,
    ) -> Self {
        Self {
            store,
            quota,
            limiter,
            pricing,
            free_methods,
            shadow_mode,
            broadcaster,
        }
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Whether the method bypasses admission.
    pub fn is_free_method(&self, method: &str) -> bool {
        self.free_methods.is_free(method)
    }

    // ─── Single-call admission ──────────────────────────────────────────────

    /// Run the full admission pipeline for one call. The only state change
    /// on the allow path is the atomic deduction (plus usage recording); on
    /// denial, only the key's denied-call counter moves.
    pub async fn evaluate(
        &self,
        key_id: &str,
        call: &ToolCall,
        caller: &CallerContext,
    ) -> AdmissionDecision {
        if self.shadow_mode {
            return self.evaluate_shadow(key_id, call, caller).await;
        }

        let price = self.pricing.resolve(&call.name, &call.arguments);
        let Some(record) = self.store.get(key_id).await else {
            return AdmissionDecision::deny(DenialReason::InvalidKey, price, 0);
        };

        if let Some(reason) = self.preflight(&record, call, caller, price).await {
            self.store.note_denied(key_id).await;
            debug!(key = key_id, tool = %call.name, reason = %reason, "admission denied");
            return AdmissionDecision::deny(reason, price, record.credits);
        }

        match self.store.deduct_credits(key_id, price, &call.name).await {
            Ok(DeductOutcome::Charged { new_balance, .. }) => {
                self.quota.record(key_id, price).await;
                self.limiter.record(key_id, &call.name).await;
                AdmissionDecision::allow(price, new_balance)
            }
            Ok(DeductOutcome::Insufficient { balance }) => {
                self.store.note_denied(key_id).await;
                AdmissionDecision::deny(DenialReason::InsufficientCredits, price, balance)
            }
            Ok(DeductOutcome::SpendingLimited { balance }) => {
                self.store.note_denied(key_id).await;
                AdmissionDecision::deny(DenialReason::SpendingLimit, price, balance)
            }
            Err(e) => {
                // The key state changed between preflight and deduction.
                let reason = store_error_reason(&e);
                warn!(key = key_id, err = %e, "deduction failed after preflight");
                AdmissionDecision::deny(reason, price, 0)
            }
        }
    }

    /// The read-only checks (steps 2–9). Returns the first failing reason.
    async fn preflight(
        &self,
        record: &KeyRecord,
        call: &ToolCall,
        caller: &CallerContext,
        price: u64,
    ) -> Option<DenialReason> {
        if let Some(reason) = self.preflight_sim(record, call, caller).await {
            return Some(reason);
        }
        if !self.quota.check(record, price).await.is_ok() {
            return Some(DenialReason::QuotaExceeded);
        }
        if record.spending_limit > 0
            && record.total_spent.saturating_add(price) > record.spending_limit
        {
            return Some(DenialReason::SpendingLimit);
        }
        None
    }

    /// Shadow-mode evaluation: run the pipeline read-only, report would-be
    /// denials as events, and always admit without charging.
    async fn evaluate_shadow(
        &self,
        key_id: &str,
        call: &ToolCall,
        caller: &CallerContext,
    ) -> AdmissionDecision {
        let (would_deny, balance) = match self.store.get(key_id).await {
            None => (Some(DenialReason::InvalidKey), 0),
            Some(record) => {
                let price = self.pricing.resolve(&call.name, &call.arguments);
                let reason = match self.preflight(&record, call, caller, price).await {
                    Some(reason) => Some(reason),
                    None if record.credits < price => Some(DenialReason::InsufficientCredits),
                    None => None,
                };
                (reason, record.credits)
            }
        };

        if let Some(reason) = would_deny {
            self.broadcaster
                .emit(GatewayEvent::ShadowDenial(ShadowDenialEvent {
                    key: key_id.to_string(),
                    tool: call.name.clone(),
                    reason,
                }));
        }
        AdmissionDecision::allow(0, balance)
    }

    // ─── Batch admission ────────────────────────────────────────────────────

    /// All-or-nothing admission for a batch of calls. Prices are computed
    /// once; every entry is checked against a snapshot balance decremented
    /// hypothetically; if any entry would fail, nothing is charged and the
    /// failing index is reported. The actual charge is a single atomic batch
    /// deduction under the key's lock.
    pub async fn evaluate_batch(
        &self,
        key_id: &str,
        calls: &[ToolCall],
        caller: &CallerContext,
    ) -> BatchDecision {
        let Some(record) = self.store.get(key_id).await else {
            return batch_deny(DenialReason::InvalidKey, None, 0, 0);
        };

        let prices: Vec<u64> = calls
            .iter()
            .map(|c| self.pricing.resolve(&c.name, &c.arguments))
            .collect();
        let total_credits: u64 = prices.iter().sum();

        if self.shadow_mode {
            return self.evaluate_batch_shadow(&record, calls, caller, &prices).await;
        }

        // Hypothetical pass: steps 1–9 per entry against a simulated balance.
        let mut sim_balance = record.credits;
        let mut sim_spent = record.total_spent;
        let mut pending_credits = 0u64;
        for (index, (call, price)) in calls.iter().zip(&prices).enumerate() {
            if let Some(reason) = self.preflight_sim(&record, call, caller).await {
                self.store.note_denied(key_id).await;
                return batch_deny(reason, Some(index), total_credits, record.credits);
            }
            if !self
                .quota
                .check_with_pending(&record, index as u64, pending_credits, *price)
                .await
                .is_ok()
            {
                self.store.note_denied(key_id).await;
                return batch_deny(
                    DenialReason::QuotaExceeded,
                    Some(index),
                    total_credits,
                    record.credits,
                );
            }
            if record.spending_limit > 0
                && sim_spent.saturating_add(*price) > record.spending_limit
            {
                self.store.note_denied(key_id).await;
                return batch_deny(
                    DenialReason::SpendingLimit,
                    Some(index),
                    total_credits,
                    record.credits,
                );
            }
            if sim_balance < *price {
                self.store.note_denied(key_id).await;
                return batch_deny(
                    DenialReason::InsufficientCredits,
                    Some(index),
                    total_credits,
                    record.credits,
                );
            }
            sim_balance -= price;
            sim_spent += price;
            pending_credits += price;
        }

        // Commit: all deductions atomically under the key's lock.
        let named: Vec<(String, u64)> = calls
            .iter()
            .zip(&prices)
            .map(|(c, p)| (c.name.clone(), *p))
            .collect();
        match self.store.deduct_batch(key_id, &named).await {
            Ok(BatchDeductOutcome::Charged { balances }) => {
                for (call, price) in calls.iter().zip(&prices) {
                    self.quota.record(key_id, *price).await;
                    self.limiter.record(key_id, &call.name).await;
                }
                let decisions = prices
                    .iter()
                    .zip(&balances)
                    .map(|(price, balance)| AdmissionDecision::allow(*price, *balance))
                    .collect();
                let remaining = balances.last().copied().unwrap_or(record.credits);
                BatchDecision {
                    all_allowed: true,
                    decisions,
                    total_credits,
                    failed_index: None,
                    reason: None,
                    remaining_credits: remaining,
                }
            }
            Ok(BatchDeductOutcome::Failed { index, insufficient }) => {
                // A concurrent mutation shrank the balance between the
                // simulation and the commit.
                self.store.note_denied(key_id).await;
                let reason = if insufficient {
                    DenialReason::InsufficientCredits
                } else {
                    DenialReason::SpendingLimit
                };
                let balance = self
                    .store
                    .get(key_id)
                    .await
                    .map(|r| r.credits)
                    .unwrap_or_default();
                batch_deny(reason, Some(index), total_credits, balance)
            }
            Err(e) => {
                warn!(key = key_id, err = %e, "batch deduction failed after simulation");
                batch_deny(store_error_reason(&e), None, total_credits, 0)
            }
        }
    }

    /// Per-entry read-only checks for batch simulation (everything except
    /// quota/spending/balance, which the caller simulates cumulatively).
    async fn preflight_sim(
        &self,
        record: &KeyRecord,
        call: &ToolCall,
        caller: &CallerContext,
    ) -> Option<DenialReason> {
        if !record.active {
            return Some(DenialReason::KeyRevoked);
        }
        if record.suspended {
            return Some(DenialReason::KeySuspended);
        }
        if record.is_expired(chrono::Utc::now()) {
            return Some(DenialReason::KeyExpired);
        }
        if !record.ip_allowed(caller.client_ip.as_deref()) {
            return Some(DenialReason::IpNotAllowed);
        }
        if let Some(reason) = check_country(record, caller.client_country.as_deref()) {
            return Some(reason);
        }
        if let Some(scoped) = &caller.scoped_tools {
            if !scoped.contains(&call.name) {
                return Some(DenialReason::TokenScope);
            }
        }
        match record.check_tool(&call.name) {
            AclVerdict::Blacklisted => return Some(DenialReason::ToolDenied),
            AclVerdict::NotWhitelisted => return Some(DenialReason::ToolNotAllowed),
            AclVerdict::Allowed => {}
        }
        if self
            .limiter
            .check(&record.key, &call.name, record.rate_limit_per_minute)
            .await
            == RateCheck::Limited
        {
            return Some(DenialReason::RateLimited);
        }
        None
    }

    async fn evaluate_batch_shadow(
        &self,
        record: &KeyRecord,
        calls: &[ToolCall],
        caller: &CallerContext,
        prices: &[u64],
    ) -> BatchDecision {
        let mut sim_balance = record.credits;
        for (call, price) in calls.iter().zip(prices) {
            let would_deny = match self.preflight_sim(record, call, caller).await {
                Some(reason) => Some(reason),
                None if sim_balance < *price => Some(DenialReason::InsufficientCredits),
                None => {
                    sim_balance -= price;
                    None
                }
            };
            if let Some(reason) = would_deny {
                self.broadcaster
                    .emit(GatewayEvent::ShadowDenial(ShadowDenialEvent {
                        key: record.key.clone(),
                        tool: call.name.clone(),
                        reason,
                    }));
            }
        }
        BatchDecision {
            all_allowed: true,
            decisions: calls
                .iter()
                .map(|_| AdmissionDecision::allow(0, record.credits))
                .collect(),
            total_credits: 0,
            failed_index: None,
            reason: None,
            remaining_credits: record.credits,
        }
    }
}

fn batch_deny(
    reason: DenialReason,
    failed_index: Option<usize>,
    total_credits: u64,
    remaining: u64,
) -> BatchDecision {
    BatchDecision {
        all_allowed: false,
        decisions: Vec::new(),
        total_credits,
        failed_index,
        reason: Some(reason),
        remaining_credits: remaining,
    }
}

fn check_country(record: &KeyRecord, country: Option<&str>) -> Option<DenialReason> {
    if record.allowed_countries.is_empty() && record.denied_countries.is_empty() {
        return None;
    }
    let country = country.map(|c| c.to_ascii_uppercase());
    if let Some(c) = &country {
        if record.denied_countries.contains(c) {
            return Some(DenialReason::CountryDenied);
        }
    }
    if !record.allowed_countries.is_empty() {
        match &country {
            Some(c) if record.allowed_countries.contains(c) => {}
            _ => return Some(DenialReason::CountryNotAllowed),
        }
    }
    None
}

fn store_error_reason(e: &StoreError) -> DenialReason {
    match e {
        StoreError::KeyNotFound(_) => DenialReason::InvalidKey,
        StoreError::KeyRevoked(_) => DenialReason::KeyRevoked,
        StoreError::KeySuspended(_) => DenialReason::KeySuspended,
        _ => DenialReason::InsufficientCredits,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_method_wildcards() {
        let free = FreeMethods::default();
        assert!(free.is_free("initialize"));
        assert!(free.is_free("ping"));
        assert!(free.is_free("tools/list"));
        assert!(free.is_free("notifications/progress"));
        assert!(free.is_free("notifications/cancelled"));
        assert!(!free.is_free("tools/call"));
        assert!(!free.is_free("tools/call_batch"));
    }

    #[test]
    fn denial_reasons_render_snake_case() {
        assert_eq!(DenialReason::InsufficientCredits.to_string(), "insufficient_credits");
        assert_eq!(DenialReason::IpNotAllowed.to_string(), "ip_not_allowed");
        assert_eq!(
            serde_json::to_value(DenialReason::RateLimited).unwrap(),
            serde_json::json!("rate_limited")
        );
    }
}
