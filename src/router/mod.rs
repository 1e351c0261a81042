//! `router` — prefix-based fan-out across multiple wrapped MCP servers.
//!
//! Public tool names are `<prefix><separator><original>`. `tools/list`
//! aggregates every backend's catalogue under its prefix; `tools/call`
//! admits the *prefixed* name through the gate (so pricing and ACL can
//! target `"fs:read_file"`), then forwards the stripped name to the owning
//! backend. Free and unknown methods go to the first configured backend
//! ungated.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{EventBroadcaster, GatewayEvent, ToolCallEvent};
use crate::gate::{AdmissionDecision, CallerContext, Gate, ToolCall};
use crate::keys::KeyRecord;
use crate::mcp::{
    McpError, McpMessage, McpResponse, MCP_INTERNAL_ERROR, MCP_INVALID_PARAMS,
    MCP_PAYMENT_REQUIRED,
};
use crate::proxy::BackendProxy;

pub const DEFAULT_SEPARATOR: &str = ":";

// ─── Configuration errors ─────────────────────────────────────────────────────

/// Invalid router configurations are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum RouterConfigError {
    #[error("no backends configured")]
    Empty,
    #[error("backend prefix must not be empty")]
    EmptyPrefix,
    #[error("backend prefix {0:?} contains the separator {1:?}")]
    SeparatorInPrefix(String, String),
    #[error("duplicate backend prefix: {0}")]
    DuplicatePrefix(String),
}

pub struct RouterEntry {
    pub prefix: String,
    pub backend: Arc<dyn BackendProxy>,
}

// ─── Router ───────────────────────────────────────────────────────────────────

pub struct MultiServerRouter {
    entries: Vec<RouterEntry>,
    separator: String,
    gate: Arc<Gate>,
    broadcaster: EventBroadcaster,
    refund_on_failure: bool,
}

impl MultiServerRouter {
    pub fn new(
        entries: Vec<RouterEntry>,
        separator: String,
        gate: Arc<Gate>,
        broadcaster: EventBroadcaster,
        refund_on_failure: bool,
    ) -> Result<Self, RouterConfigError> {
        if entries.is_empty() {
            return Err(RouterConfigError::Empty);
        }
        for (i, entry) in entries.iter().enumerate() {
            if entry.prefix.is_empty() {
                return Err(RouterConfigError::EmptyPrefix);
            }
            if entry.prefix.contains(&separator) {
                return Err(RouterConfigError::SeparatorInPrefix(
                    entry.prefix.clone(),
                    separator.clone(),
                ));
            }
            if entries[..i].iter().any(|e| e.prefix == entry.prefix) {
                return Err(RouterConfigError::DuplicatePrefix(entry.prefix.clone()));
            }
        }
        Ok(Self {
            entries,
            separator,
            gate,
            broadcaster,
            refund_on_failure,
        })
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }

    pub fn prefixes(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.prefix.as_str()).collect()
    }

    /// (prefix, is_running) for every backend, in configuration order.
    pub fn backend_health(&self) -> Vec<(String, bool)> {
        self.entries
            .iter()
            .map(|e| (e.prefix.clone(), e.backend.is_running()))
            .collect()
    }

    /// Split a public tool name into (prefix, original). Plain index-of on
    /// the separator — no patterns involved.
    fn split_name<'a>(&self, name: &'a str) -> Option<(&'a str, &'a str)> {
        let pos = name.find(&self.separator)?;
        Some((&name[..pos], &name[pos + self.separator.len()..]))
    }

    fn backend_for(&self, prefix: &str) -> Option<&RouterEntry> {
        self.entries.iter().find(|e| e.prefix == prefix)
    }

    fn unknown_prefix_error(&self, id: Value, name: &str) -> McpResponse {
        let prefixes: Vec<&str> = self.prefixes();
        McpResponse::error(
            id,
            McpError::new(
                MCP_INVALID_PARAMS,
                format!("unknown tool prefix in {name:?}"),
            )
            .with_data(json!({ "validPrefixes": prefixes, "separator": self.separator })),
        )
    }

    // ─── tools/list aggregation ─────────────────────────────────────────────

    /// Fan `tools/list` out to every backend ungated, rewrite each tool name
    /// under its backend's prefix, and filter the merged catalogue against
    /// the calling key's ACL (on the prefixed names). Aggregation order is
    /// stable: configuration order, then each backend's own order.
    pub async fn list_tools(&self, id: Value, acl: Option<&KeyRecord>) -> McpResponse {
        let mut merged: Vec<Value> = Vec::new();
        for entry in &self.entries {
            let request = McpMessage::request(
                json!(format!("list-{}", Uuid::new_v4().simple())),
                "tools/list",
                None,
            );
            let tools = match entry.backend.forward_ungated(&request).await {
                Ok(response) => response
                    .result
                    .as_ref()
                    .and_then(|r| r.get("tools"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                Err(e) => {
                    warn!(prefix = %entry.prefix, err = %e, "tools/list fan-out failed");
                    Vec::new()
                }
            };
            for mut tool in tools {
                let Some(original) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let prefixed = format!("{}{}{}", entry.prefix, self.separator, original);
                if let Some(record) = acl {
                    if !record.tool_visible(&prefixed) {
                        continue;
                    }
                }
                if let Some(obj) = tool.as_object_mut() {
                    obj.insert("name".into(), json!(prefixed));
                    let description = obj
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    obj.insert(
                        "description".into(),
                        json!(format!("[{}] {}", entry.prefix, description)),
                    );
                }
                merged.push(tool);
            }
        }
        McpResponse::ok(id, json!({ "tools": merged }))
    }

    // ─── tools/call ─────────────────────────────────────────────────────────

    /// Admit and forward one tool call. The gate sees the prefixed name; the
    /// backend sees the original.
    pub async fn call_tool(
        &self,
        key_id: &str,
        id: Value,
        call: ToolCall,
        caller: &CallerContext,
    ) -> McpResponse {
        let Some((prefix, original)) = self.split_name(&call.name) else {
            return self.unknown_prefix_error(id, &call.name);
        };
        if self.backend_for(prefix).is_none() {
            return self.unknown_prefix_error(id, &call.name);
        }

        let decision = self.gate.evaluate(key_id, &call, caller).await;
        if !decision.allowed {
            return payment_required(id, &decision, None);
        }

        self.forward_admitted(key_id, id, &call.name, prefix, original, call.arguments, &decision)
            .await
    }

    /// Forward a call that has already been charged (single admitted call or
    /// one entry of an admitted batch), refunding per policy on downstream
    /// failure.
    pub async fn forward_admitted(
        &self,
        key_id: &str,
        id: Value,
        public_name: &str,
        prefix: &str,
        original: &str,
        arguments: Value,
        decision: &AdmissionDecision,
    ) -> McpResponse {
        let Some(entry) = self.backend_for(prefix) else {
            // The prefix was validated before admission; reaching this means
            // a race against reconfiguration. Refund and report.
            return self
                .fail_and_maybe_refund(
                    key_id,
                    id,
                    public_name,
                    decision,
                    "backend disappeared".to_string(),
                )
                .await;
        };

        let started = Instant::now();
        let request = McpMessage::request(
            id.clone(),
            "tools/call",
            Some(json!({ "name": original, "arguments": arguments })),
        );

        match entry.backend.forward_ungated(&request).await {
            Ok(response) if response.is_error() => {
                let message = response
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                debug!(tool = public_name, %message, "downstream reported an error");
                let refunded = self.maybe_refund(key_id, public_name, decision).await;
                self.emit_tool_call(key_id, public_name, decision, started, false, refunded);
                response
            }
            Ok(response) => {
                self.emit_tool_call(key_id, public_name, decision, started, true, false);
                response
            }
            Err(e) => {
                self.fail_and_maybe_refund(key_id, id, public_name, decision, e.to_string())
                    .await
            }
        }
    }

    async fn fail_and_maybe_refund(
        &self,
        key_id: &str,
        id: Value,
        public_name: &str,
        decision: &AdmissionDecision,
        message: String,
    ) -> McpResponse {
        let refunded = self.maybe_refund(key_id, public_name, decision).await;
        self.emit_tool_call(key_id, public_name, decision, Instant::now(), false, refunded);
        McpResponse::error(id, McpError::new(MCP_INTERNAL_ERROR, message))
    }

    /// Restore charged credits when the refund policy applies. Returns
    /// whether a refund happened.
    async fn maybe_refund(
        &self,
        key_id: &str,
        public_name: &str,
        decision: &AdmissionDecision,
    ) -> bool {
        if !self.refund_on_failure || decision.credits_charged == 0 {
            return false;
        }
        match self
            .gate
            .store()
            .refund(key_id, decision.credits_charged, public_name)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(key = key_id, err = %e, "refund failed");
                false
            }
        }
    }

    fn emit_tool_call(
        &self,
        key_id: &str,
        public_name: &str,
        decision: &AdmissionDecision,
        started: Instant,
        ok: bool,
        refunded: bool,
    ) {
        let charged = if refunded { 0 } else { decision.credits_charged };
        self.broadcaster.emit(GatewayEvent::ToolCall(ToolCallEvent {
            key: key_id.to_string(),
            tool: public_name.to_string(),
            credits_charged: charged,
            refunded,
            ok,
            duration_ms: started.elapsed().as_millis() as u64,
        }));
    }

    // ─── Free / unknown methods ─────────────────────────────────────────────

    /// Forward a free or unknown method to the first configured backend.
    pub async fn forward_free(&self, request: &McpMessage) -> Result<McpResponse, crate::proxy::ProxyError> {
        let first = &self.entries[0];
        first.backend.forward_ungated(request).await
    }

    /// Validate that a public name routes somewhere; used before batch
    /// admission so a bad name fails the whole batch with invalid params.
    pub fn resolve_name<'a>(&self, name: &'a str) -> Option<(&'a str, &'a str)> {
        let (prefix, original) = self.split_name(name)?;
        self.backend_for(prefix)?;
        Some((prefix, original))
    }
}

/// Shape a denial as the JSON-RPC payment-required error.
pub fn payment_required(
    id: Value,
    decision: &AdmissionDecision,
    failed_index: Option<usize>,
) -> McpResponse {
    let reason = decision
        .reason
        .map(|r| r.as_str())
        .unwrap_or("insufficient_credits");
    let mut data = json!({
        "creditsRequired": decision.credits_required,
        "remainingCredits": decision.remaining_credits,
        "accepts": ["credits"],
        "reason": reason,
    });
    if let Some(index) = failed_index {
        data["failedIndex"] = json!(index);
    }
    McpResponse::error(
        id,
        McpError::new(MCP_PAYMENT_REQUIRED, format!("Payment required: {reason}")).with_data(data),
    )
}
