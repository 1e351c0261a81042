/// MCP JSON-RPC 2.0 wire types shared by the edge, the gate, and the
/// backend transports.
///
/// The proxy does not assume any specific MCP protocol version — payloads
/// are forwarded verbatim. Only the envelope (`jsonrpc`, `id`, `method`,
/// `params` / `result` / `error`) is interpreted here.
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Core message types ───────────────────────────────────────────────────────

/// An incoming or outgoing JSON-RPC 2.0 request or notification.
///
/// Notifications (no `id`) use the same wire format but expect no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpMessage {
    /// Create a request (has an id, expects a response).
    pub fn request(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Create a notification (no id, no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Whether this message is a notification (fire-and-forget).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// The `params.name` field of a `tools/call` request, if present.
    pub fn tool_name(&self) -> Option<&str> {
        self.params.as_ref()?.get("name")?.as_str()
    }

    /// The `params.arguments` object of a `tools/call` request (`{}` if absent).
    pub fn tool_arguments(&self) -> Value {
        self.params
            .as_ref()
            .and_then(|p| p.get("arguments"))
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }
}

/// A JSON-RPC 2.0 response (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

impl McpResponse {
    /// Construct a successful response.
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Construct an error response.
    pub fn error(id: Value, error: McpError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl std::fmt::Display for McpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

// ─── Error codes ──────────────────────────────────────────────────────────────

pub const MCP_PARSE_ERROR: i32 = -32700;
pub const MCP_INVALID_REQUEST: i32 = -32600;
pub const MCP_METHOD_NOT_FOUND: i32 = -32601;
pub const MCP_INVALID_PARAMS: i32 = -32602;
pub const MCP_INTERNAL_ERROR: i32 = -32603;
/// Admission denied — insufficient credits, rate limit, quota, ACL, scope,
/// IP, country, or key state. `data` carries `creditsRequired`,
/// `remainingCredits`, and (for batches) `failedIndex`.
pub const MCP_PAYMENT_REQUIRED: i32 = -32402;
/// Content policy violation (external guardrails collaborator).
pub const MCP_CONTENT_POLICY: i32 = -32406;

// ─── Batch params ─────────────────────────────────────────────────────────────

/// One entry in a `tools/call_batch` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCallEntry {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Params for the `tools/call_batch` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCallParams {
    pub calls: Vec<BatchCallEntry>,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_roundtrip() {
        let req = McpMessage::request(
            json!(7),
            "tools/call",
            Some(json!({"name": "echo", "arguments": {"text": "hi"}})),
        );
        let s = serde_json::to_string(&req).unwrap();
        let back: McpMessage = serde_json::from_str(&s).unwrap();
        assert_eq!(back.id, Some(json!(7)));
        assert_eq!(back.tool_name(), Some("echo"));
        assert_eq!(back.tool_arguments()["text"], "hi");
    }

    #[test]
    fn notification_skips_id_on_wire() {
        let n = McpMessage::notification("notifications/progress", None);
        assert!(n.is_notification());
        let s = serde_json::to_string(&n).unwrap();
        assert!(!s.contains("\"id\""));
    }

    #[test]
    fn error_response_serializes_data() {
        let resp = McpResponse::error(
            json!(1),
            McpError::new(MCP_PAYMENT_REQUIRED, "Payment required: insufficient_credits")
                .with_data(json!({"creditsRequired": 5, "remainingCredits": 3})),
        );
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["error"]["code"], -32402);
        assert_eq!(v["error"]["data"]["creditsRequired"], 5);
        assert!(v.get("result").is_none());
    }
}
