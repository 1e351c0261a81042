//! Observability event fan-out.
//!
//! The admission pipeline and key lifecycle emit typed [`GatewayEvent`]s
//! over a broadcast channel; the admin SSE endpoint subscribes and renders
//! them as notifications. The channel is lossy by contract — dropping
//! events when nobody listens (or a subscriber lags) is fine, since the
//! key store stays the source of truth.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::gate::DenialReason;

// ─── Event payloads ───────────────────────────────────────────────────────────

/// Outcome of one forwarded tool call, emitted after the backend answers
/// (or fails). `credits_charged` is the net charge — zero when refunded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEvent {
    pub key: String,
    /// Prefixed public tool name.
    pub tool: String,
    pub credits_charged: u64,
    pub refunded: bool,
    pub ok: bool,
    pub duration_ms: u64,
}

/// A call shadow mode would have denied, had enforcement been on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowDenialEvent {
    pub key: String,
    pub tool: String,
    pub reason: DenialReason,
}

/// Key lifecycle transitions surfaced to admin observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAction {
    Created,
    Topup,
    Revoked,
    Suspended,
    Resumed,
}

impl KeyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Topup => "topup",
            Self::Revoked => "revoked",
            Self::Suspended => "suspended",
            Self::Resumed => "resumed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyLifecycleEvent {
    pub action: KeyAction,
    pub key: String,
    /// Credits involved, for `topup`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

// ─── Event envelope ───────────────────────────────────────────────────────────

/// Everything the gateway reports about itself. Serializes as
/// `{"method": "<name>", "params": {...}}` so SSE consumers see the same
/// notification shape the JSON-RPC surface uses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum GatewayEvent {
    ToolCall(ToolCallEvent),
    ShadowDenial(ShadowDenialEvent),
    KeyEvent(KeyLifecycleEvent),
}

impl GatewayEvent {
    /// The notification method name for this event.
    pub fn method(&self) -> &'static str {
        match self {
            Self::ToolCall(_) => "tool_call",
            Self::ShadowDenial(_) => "shadow_denial",
            Self::KeyEvent(_) => "key_event",
        }
    }

    /// The params payload alone, for SSE data fields.
    pub fn params(&self) -> Value {
        match self {
            Self::ToolCall(e) => serde_json::to_value(e),
            Self::ShadowDenial(e) => serde_json::to_value(e),
            Self::KeyEvent(e) => serde_json::to_value(e),
        }
        .unwrap_or(Value::Null)
    }
}

// ─── Broadcaster ──────────────────────────────────────────────────────────────

/// Fans typed events out to every subscribed admin stream.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<GatewayEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event. No subscribers is fine — the send result is
    /// deliberately ignored.
    pub fn emit(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
