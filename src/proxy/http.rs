//! Remote streamable-HTTP MCP transport.
//!
//! Each JSON-RPC request is an HTTP POST accepting either a plain JSON body
//! or a `text/event-stream` body. SSE bodies are scanned frame-by-frame for
//! the response whose id matches the request; unrelated frames (progress
//! notifications, other ids, non-JSON payloads) are skipped. Once the remote
//! hands out an `Mcp-Session-Id`, it is echoed on every subsequent request
//! and released with a best-effort DELETE on stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::mcp::{McpMessage, McpResponse};

use super::sse::SseParser;
use super::{BackendProxy, ProxyError, MAX_BODY_BYTES, REQUEST_TIMEOUT_SECS, STOP_GRACE_SECS};

const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct HttpProxy {
    url: String,
    client: reqwest::Client,
    session: RwLock<Option<String>>,
    running: AtomicBool,
    max_body: usize,
}

impl HttpProxy {
    pub fn new(url: String) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            url,
            client,
            session: RwLock::new(None),
            running: AtomicBool::new(false),
            max_body: MAX_BODY_BYTES,
        })
    }

    /// The session id currently held, if the remote issued one.
    pub async fn session_id(&self) -> Option<String> {
        self.session.read().await.clone()
    }

    async fn capture_session(&self, response: &reqwest::Response) {
        if let Some(sid) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut session = self.session.write().await;
            if session.as_deref() != Some(sid) {
                debug!(url = %self.url, "captured MCP session id");
                *session = Some(sid.to_string());
            }
        }
    }

    async fn post(&self, request: &McpMessage) -> Result<reqwest::Response, ProxyError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(request);
        if let Some(sid) = self.session.read().await.as_deref() {
            builder = builder.header(SESSION_HEADER, sid);
        }
        let response = builder.send().await?;
        self.capture_session(&response).await;
        Ok(response.error_for_status()?)
    }

    async fn round_trip(&self, request: &McpMessage) -> Result<McpResponse, ProxyError> {
        if !self.is_running() {
            return Err(ProxyError::NotStarted);
        }

        // Notifications: POST best-effort, ignore the response entirely.
        let Some(request_id) = request.id.clone() else {
            if let Err(e) = self.post(request).await {
                debug!(url = %self.url, err = %e, "notification POST failed");
            }
            return Ok(McpResponse::ok(Value::Null, serde_json::json!({})));
        };

        let response = self.post(request).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            self.read_sse(response, &request_id).await
        } else {
            // application/json, or anything else that parses as JSON.
            let body = self.read_capped(response).await?;
            Ok(serde_json::from_slice(&body)?)
        }
    }

    /// Accumulate a response body, failing once it exceeds the cap.
    async fn read_capped(&self, response: reqwest::Response) -> Result<Vec<u8>, ProxyError> {
        if let Some(len) = response.content_length() {
            if len as usize > self.max_body {
                return Err(ProxyError::BodyTooLarge(self.max_body));
            }
        }
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > self.max_body {
                return Err(ProxyError::BodyTooLarge(self.max_body));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Scan SSE frames until one carries the response for `request_id`.
    async fn read_sse(
        &self,
        response: reqwest::Response,
        request_id: &Value,
    ) -> Result<McpResponse, ProxyError> {
        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        let mut total = 0usize;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total += chunk.len();
            if total > self.max_body {
                return Err(ProxyError::BodyTooLarge(self.max_body));
            }
            for payload in parser.push(&chunk) {
                if let Some(found) = match_frame(&payload, request_id) {
                    return Ok(serde_json::from_value(found)?);
                }
            }
        }
        if let Some(payload) = parser.finish() {
            if let Some(found) = match_frame(&payload, request_id) {
                return Ok(serde_json::from_value(found)?);
            }
        }
        Err(ProxyError::NoSseMatch)
    }
}

/// Try a completed frame payload against the request id. Non-JSON payloads,
/// notifications, and foreign ids are skipped (`None`).
fn match_frame(payload: &str, request_id: &Value) -> Option<Value> {
    let value: Value = serde_json::from_str(payload).ok()?;
    match &value {
        Value::Object(obj) => {
            let is_response = obj.get("jsonrpc").and_then(Value::as_str) == Some("2.0");
            if is_response && obj.get("id") == Some(request_id) {
                return Some(value);
            }
            None
        }
        Value::Array(items) => items
            .iter()
            .find(|item| {
                item.get("jsonrpc").and_then(Value::as_str) == Some("2.0")
                    && item.get("id") == Some(request_id)
            })
            .cloned(),
        _ => None,
    }
}

#[async_trait::async_trait]
impl BackendProxy for HttpProxy {
    async fn start(&self) -> Result<(), ProxyError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let session = self.session.write().await.take();
        if let Some(sid) = session {
            // Best-effort session release.
            let result = self
                .client
                .delete(&self.url)
                .header(SESSION_HEADER, &sid)
                .timeout(Duration::from_secs(STOP_GRACE_SECS))
                .send()
                .await;
            if let Err(e) = result {
                warn!(url = %self.url, err = %e, "session DELETE failed");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn forward(&self, request: &McpMessage) -> Result<McpResponse, ProxyError> {
        self.round_trip(request).await
    }

    async fn forward_ungated(&self, request: &McpMessage) -> Result<McpResponse, ProxyError> {
        self.round_trip(request).await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn match_frame_skips_notifications() {
        let id = json!(42);
        assert!(match_frame(r#"{"method":"notifications/progress","params":{}}"#, &id).is_none());
        assert!(match_frame("not json", &id).is_none());
        assert!(match_frame(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#, &id).is_none());
        let hit = match_frame(r#"{"jsonrpc":"2.0","id":42,"result":{"ok":true}}"#, &id);
        assert_eq!(hit.unwrap()["result"]["ok"], true);
    }

    #[test]
    fn match_frame_searches_arrays() {
        let id = json!("abc");
        let payload = r#"[{"jsonrpc":"2.0","id":"zzz","result":1},{"jsonrpc":"2.0","id":"abc","result":2}]"#;
        let hit = match_frame(payload, &id).unwrap();
        assert_eq!(hit["result"], 2);
    }
}
