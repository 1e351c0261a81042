//! `/mcp` — the JSON-RPC admission edge.
//!
//! Accepts a single JSON-RPC 2.0 object, a JSON-RPC array batch, or the
//! `tools/call_batch` method. Free methods skip the gate (with `tools/list`
//! still ACL-filtered); `tools/call` and `tools/call_batch` go through
//! admission; everything else forwards to the first backend untouched.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::debug;

use crate::gate::{CallerContext, DenialReason, ToolCall};
use crate::mcp::{
    BatchCallParams, McpError, McpMessage, McpResponse, MCP_INTERNAL_ERROR, MCP_INVALID_PARAMS,
    MCP_PARSE_ERROR, MCP_PAYMENT_REQUIRED,
};
use crate::router::payment_required;
use crate::server::auth::{client_country, client_ip, extract_credential, Credential};
use crate::AppContext;

/// Authenticated request metadata, extracted once per HTTP request.
struct EdgeAuth {
    key_id: Option<String>,
    caller: CallerContext,
    /// A scoped token was presented but failed verification.
    bad_token: bool,
}

fn authenticate(ctx: &AppContext, headers: &HeaderMap, peer: Option<SocketAddr>) -> EdgeAuth {
    let caller_base = CallerContext {
        client_ip: client_ip(headers, peer),
        client_country: client_country(headers),
        scoped_tools: None,
    };
    match extract_credential(headers, &ctx.scoped_secret) {
        Ok(Some(Credential::ApiKey(key))) => EdgeAuth {
            key_id: Some(key),
            caller: caller_base,
            bad_token: false,
        },
        Ok(Some(Credential::Scoped(token))) => EdgeAuth {
            key_id: Some(token.key.clone()),
            caller: CallerContext {
                scoped_tools: Some(token.tools),
                ..caller_base
            },
            bad_token: false,
        },
        Ok(None) => EdgeAuth {
            key_id: None,
            caller: caller_base,
            bad_token: false,
        },
        Err(e) => {
            debug!(err = %e, "scoped token rejected");
            EdgeAuth {
                key_id: None,
                caller: caller_base,
                bad_token: true,
            }
        }
    }
}

// ─── Endpoint ─────────────────────────────────────────────────────────────────

pub async fn mcp_endpoint(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if ctx.draining.load(std::sync::atomic::Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let parsed: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            let response = McpResponse::error(
                Value::Null,
                McpError::new(MCP_PARSE_ERROR, format!("invalid JSON: {e}")),
            );
            return Json(response).into_response();
        }
    };

    let auth = authenticate(&ctx, &headers, Some(peer));

    match parsed {
        // JSON-RPC array batch: each element handled independently;
        // notifications produce no response entry.
        Value::Array(items) => {
            let mut responses = Vec::new();
            for item in items {
                if let Some(response) = handle_value(&ctx, &auth, item).await {
                    responses.push(response);
                }
            }
            Json(responses).into_response()
        }
        single => match handle_value(&ctx, &auth, single).await {
            Some(response) => Json(response).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        },
    }
}

/// Handle one JSON-RPC value. `None` means a notification with nothing to
/// send back.
async fn handle_value(ctx: &AppContext, auth: &EdgeAuth, value: Value) -> Option<McpResponse> {
    let raw_id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: McpMessage = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            return Some(McpResponse::error(
                raw_id,
                McpError::new(MCP_PARSE_ERROR, format!("invalid JSON-RPC request: {e}")),
            ));
        }
    };

    match request.method.as_str() {
        "tools/call_batch" => Some(handle_batch(ctx, auth, request).await),
        "tools/call" => Some(handle_call(ctx, auth, request).await),
        method if ctx.gate.is_free_method(method) => handle_free(ctx, auth, request).await,
        // Unknown methods forward to the first backend, ungated.
        _ => forward_free(ctx, request).await,
    }
}

// ─── Free methods ─────────────────────────────────────────────────────────────

async fn handle_free(ctx: &AppContext, auth: &EdgeAuth, request: McpMessage) -> Option<McpResponse> {
    if request.method == "tools/list" {
        let id = request.id.clone().unwrap_or(Value::Null);
        // Filter the aggregated catalogue against the caller's ACL when a
        // key was presented; scoped-token whitelists narrow it further.
        let record = match &auth.key_id {
            Some(key) => ctx.store.get(key).await,
            None => None,
        };
        let mut response = ctx.router.list_tools(id, record.as_ref()).await;
        if let Some(scoped) = &auth.caller.scoped_tools {
            if let Some(tools) = response
                .result
                .as_mut()
                .and_then(|r| r.get_mut("tools"))
                .and_then(Value::as_array_mut)
            {
                tools.retain(|t| {
                    t.get("name")
                        .and_then(Value::as_str)
                        .is_some_and(|name| scoped.contains(name))
                });
            }
        }
        return Some(response);
    }
    forward_free(ctx, request).await
}

async fn forward_free(ctx: &AppContext, request: McpMessage) -> Option<McpResponse> {
    let is_notification = request.is_notification();
    match ctx.router.forward_free(&request).await {
        Ok(response) => (!is_notification).then_some(response),
        Err(e) => (!is_notification).then(|| {
            McpResponse::error(
                request.id.clone().unwrap_or(Value::Null),
                McpError::new(MCP_INTERNAL_ERROR, e.to_string()),
            )
        }),
    }
}

// ─── tools/call ───────────────────────────────────────────────────────────────

async fn handle_call(ctx: &AppContext, auth: &EdgeAuth, request: McpMessage) -> McpResponse {
    let id = request.id.clone().unwrap_or(Value::Null);

    let Some(name) = request.tool_name().map(str::to_string) else {
        return McpResponse::error(
            id,
            McpError::new(MCP_INVALID_PARAMS, "missing tool name in params"),
        );
    };
    let Some(key_id) = resolve_key(auth) else {
        return deny_unauthenticated(id, auth);
    };

    let call = ToolCall {
        name,
        arguments: request.tool_arguments(),
    };
    ctx.router.call_tool(&key_id, id, call, &auth.caller).await
}

// ─── tools/call_batch ─────────────────────────────────────────────────────────

async fn handle_batch(ctx: &AppContext, auth: &EdgeAuth, request: McpMessage) -> McpResponse {
    let id = request.id.clone().unwrap_or(Value::Null);

    let params: BatchCallParams = match request
        .params
        .clone()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(p)) => p,
        Ok(None) | Err(_) => {
            return McpResponse::error(
                id,
                McpError::new(MCP_INVALID_PARAMS, "tools/call_batch requires params.calls"),
            );
        }
    };
    if params.calls.is_empty() {
        return McpResponse::error(id, McpError::new(MCP_INVALID_PARAMS, "empty batch"));
    }
    let Some(key_id) = resolve_key(auth) else {
        return deny_unauthenticated(id, auth);
    };

    // Every name must route somewhere before admission is attempted.
    for (index, entry) in params.calls.iter().enumerate() {
        if ctx.router.resolve_name(&entry.name).is_none() {
            return McpResponse::error(
                id,
                McpError::new(
                    MCP_INVALID_PARAMS,
                    format!("unknown tool prefix in {:?}", entry.name),
                )
                .with_data(json!({
                    "failedIndex": index,
                    "validPrefixes": ctx.router.prefixes(),
                })),
            );
        }
    }

    let calls: Vec<ToolCall> = params
        .calls
        .iter()
        .map(|entry| ToolCall {
            name: entry.name.clone(),
            arguments: entry.arguments.clone(),
        })
        .collect();

    let batch = ctx.gate.evaluate_batch(&key_id, &calls, &auth.caller).await;
    if !batch.all_allowed {
        let reason = batch
            .reason
            .map(|r| r.as_str())
            .unwrap_or("insufficient_credits");
        let mut data = json!({
            "creditsRequired": batch.total_credits,
            "remainingCredits": batch.remaining_credits,
            "accepts": ["credits"],
            "reason": reason,
        });
        if let Some(index) = batch.failed_index {
            data["failedIndex"] = json!(index);
        }
        return McpResponse::error(
            id,
            McpError::new(MCP_PAYMENT_REQUIRED, format!("Payment required: {reason}"))
                .with_data(data),
        );
    }

    // All charged up front; forward each call in order. Per-call downstream
    // failures refund independently under the refund policy.
    let mut results = Vec::with_capacity(calls.len());
    for (index, call) in calls.iter().enumerate() {
        let (prefix, original) = ctx
            .router
            .resolve_name(&call.name)
            .expect("validated before admission");
        let sub_id = json!(format!("{}#{}", render_id(&id), index));
        let response = ctx
            .router
            .forward_admitted(
                &key_id,
                sub_id,
                &call.name,
                prefix,
                original,
                call.arguments.clone(),
                &batch.decisions[index],
            )
            .await;
        results.push(match (response.result, response.error) {
            (Some(result), _) => json!({ "result": result }),
            (None, Some(error)) => json!({ "error": error }),
            (None, None) => json!({ "result": null }),
        });
    }

    McpResponse::ok(
        id,
        json!({
            "results": results,
            "totalCredits": batch.total_credits,
            "remainingCredits": batch.remaining_credits,
        }),
    )
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn resolve_key(auth: &EdgeAuth) -> Option<String> {
    auth.key_id.clone()
}

/// No usable credential: shape the denial exactly like a gate denial so
/// clients handle both paths the same way. A scoped token that failed
/// verification is just an invalid credential — `token_scope` is reserved
/// for whitelist misses on a *valid* token.
fn deny_unauthenticated(id: Value, auth: &EdgeAuth) -> McpResponse {
    if auth.bad_token {
        debug!("denying request with unverifiable scoped token");
    }
    let decision = crate::gate::AdmissionDecision {
        allowed: false,
        credits_charged: 0,
        credits_required: 0,
        remaining_credits: 0,
        reason: Some(DenialReason::InvalidKey),
    };
    payment_required(id, &decision, None)
}

fn render_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
