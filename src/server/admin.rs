//! Minimal admin surface: key lifecycle, top-ups, transfers, ledger and
//! velocity reads, scoped-token minting, and the observability event
//! stream. Everything here is a thin wrapper over the key store and the
//! ledger, guarded by the admin bearer token.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures_util::stream;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::events::{GatewayEvent, KeyAction, KeyLifecycleEvent};
use crate::keys::ledger::{HistoryQuery, LedgerEntryType};
use crate::keys::{KeyConfig, KeyRecord, StoreError};
use crate::server::auth::{mint_scoped_token, tokens_equal};
use crate::AppContext;

// ─── Auth middleware ──────────────────────────────────────────────────────────

pub async fn require_admin(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if ctx.admin_token.is_empty() || !tokens_equal(presented, &ctx.admin_token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "admin token required" })),
        )
            .into_response();
    }
    next.run(request).await
}

fn store_error(e: StoreError) -> Response {
    let status = match &e {
        StoreError::KeyNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::AliasTaken(_) | StoreError::SelfTransfer => StatusCode::CONFLICT,
        StoreError::InvalidAmount => StatusCode::BAD_REQUEST,
        StoreError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        StoreError::KeyRevoked(_) | StoreError::KeySuspended(_) => StatusCode::CONFLICT,
        StoreError::CapacityReached(_) => StatusCode::INSUFFICIENT_STORAGE,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "no such key or alias" })),
    )
        .into_response()
}

/// Hide most of the credential when listing keys.
fn masked(mut record: KeyRecord) -> KeyRecord {
    if record.key.len() > 10 {
        record.key = format!("{}…{}", &record.key[..6], &record.key[record.key.len() - 4..]);
    }
    record
}

// ─── Key lifecycle ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateKeyBody {
    pub name: String,
    #[serde(default)]
    pub credits: u64,
    #[serde(flatten)]
    pub config: KeyConfig,
}

pub async fn create_key(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateKeyBody>,
) -> Response {
    match ctx.store.create(&body.name, body.credits, body.config).await {
        // The only place the full key is returned.
        Ok(record) => {
            ctx.broadcaster.emit(GatewayEvent::KeyEvent(KeyLifecycleEvent {
                action: KeyAction::Created,
                key: record.key.clone(),
                amount: Some(record.credits),
            }));
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Err(e) => store_error(e),
    }
}

pub async fn list_keys(State(ctx): State<Arc<AppContext>>) -> Response {
    let keys: Vec<KeyRecord> = ctx.store.list().await.into_iter().map(masked).collect();
    Json(json!({ "keys": keys })).into_response()
}

pub async fn get_key(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Response {
    let Some(key_id) = ctx.store.resolve_alias_or_id(&id).await else {
        return not_found();
    };
    match ctx.store.get(&key_id).await {
        Some(record) => Json(record).into_response(),
        None => not_found(),
    }
}

#[derive(Deserialize)]
pub struct TopupBody {
    pub amount: u64,
    #[serde(default)]
    pub memo: Option<String>,
}

pub async fn topup_key(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<TopupBody>,
) -> Response {
    let Some(key_id) = ctx.store.resolve_alias_or_id(&id).await else {
        return not_found();
    };
    match ctx
        .store
        .add_credits(&key_id, body.amount, LedgerEntryType::Topup, body.memo)
        .await
    {
        Ok(balance) => {
            ctx.broadcaster.emit(GatewayEvent::KeyEvent(KeyLifecycleEvent {
                action: KeyAction::Topup,
                key: key_id.clone(),
                amount: Some(body.amount),
            }));
            Json(json!({ "key": key_id, "credits": balance })).into_response()
        }
        Err(e) => store_error(e),
    }
}

pub async fn revoke_key(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Response {
    lifecycle(ctx, id, KeyAction::Revoked, |store, key| async move {
        store.revoke(&key).await
    })
    .await
}

pub async fn suspend_key(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Response {
    lifecycle(ctx, id, KeyAction::Suspended, |store, key| async move {
        store.suspend(&key).await
    })
    .await
}

pub async fn resume_key(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Response {
    lifecycle(ctx, id, KeyAction::Resumed, |store, key| async move {
        store.resume(&key).await
    })
    .await
}

async fn lifecycle<F, Fut>(ctx: Arc<AppContext>, id: String, action: KeyAction, op: F) -> Response
where
    F: FnOnce(Arc<crate::keys::KeyStore>, String) -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    let Some(key_id) = ctx.store.resolve_alias_or_id(&id).await else {
        return not_found();
    };
    match op(Arc::clone(&ctx.store), key_id.clone()).await {
        Ok(()) => {
            ctx.broadcaster.emit(GatewayEvent::KeyEvent(KeyLifecycleEvent {
                action,
                key: key_id.clone(),
                amount: None,
            }));
            Json(json!({ "key": key_id, "status": action.as_str() })).into_response()
        }
        Err(e) => store_error(e),
    }
}

// ─── Transfers ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct TransferBody {
    pub from: String,
    pub to: String,
    pub amount: u64,
    #[serde(default)]
    pub memo: Option<String>,
}

pub async fn transfer(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<TransferBody>,
) -> Response {
    let (Some(from), Some(to)) = (
        ctx.store.resolve_alias_or_id(&body.from).await,
        ctx.store.resolve_alias_or_id(&body.to).await,
    ) else {
        return not_found();
    };
    match ctx.store.transfer(&from, &to, body.amount, body.memo).await {
        Ok((from_balance, to_balance)) => Json(json!({
            "from": { "key": from, "credits": from_balance },
            "to": { "key": to, "credits": to_balance },
        }))
        .into_response(),
        Err(e) => store_error(e),
    }
}

// ─── Ledger & velocity ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LedgerParams {
    #[serde(rename = "type")]
    pub entry_type: Option<LedgerEntryType>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

pub async fn key_ledger(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(params): Query<LedgerParams>,
) -> Response {
    let Some(key_id) = ctx.store.resolve_alias_or_id(&id).await else {
        return not_found();
    };
    let entries = ctx
        .store
        .ledger()
        .history(
            &key_id,
            &HistoryQuery {
                entry_type: params.entry_type,
                since: params.since,
                limit: params.limit,
            },
        )
        .await;
    Json(json!({ "key": key_id, "entries": entries })).into_response()
}

#[derive(Deserialize)]
pub struct VelocityParams {
    pub hours: Option<f64>,
}

pub async fn key_velocity(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(params): Query<VelocityParams>,
) -> Response {
    let Some(key_id) = ctx.store.resolve_alias_or_id(&id).await else {
        return not_found();
    };
    let Some(record) = ctx.store.get(&key_id).await else {
        return not_found();
    };
    let velocity = ctx
        .store
        .ledger()
        .spending_velocity(&key_id, record.credits, params.hours.unwrap_or(24.0))
        .await;
    Json(velocity).into_response()
}

// ─── Scoped tokens ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ScopedTokenBody {
    pub tools: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn mint_token(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<ScopedTokenBody>,
) -> Response {
    let Some(key_id) = ctx.store.resolve_alias_or_id(&id).await else {
        return not_found();
    };
    if body.tools.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "tools must not be empty" })),
        )
            .into_response();
    }
    match mint_scoped_token(&ctx.scoped_secret, &key_id, &body.tools, body.expires_at) {
        Ok(token) => Json(json!({ "token": token, "key": key_id })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ─── Event stream ─────────────────────────────────────────────────────────────

/// GET /admin/events — observability notifications as Server-Sent Events.
/// Each [`GatewayEvent`] becomes one SSE frame labeled with its method.
pub async fn events_sse(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let rx = ctx.broadcaster.subscribe();

    let s = stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = json!({
                        "method": event.method(),
                        "params": event.params(),
                    });
                    let sse_event = Event::default()
                        .data(data.to_string())
                        .event(event.method());
                    return Some((Ok::<Event, Infallible>(sse_event), rx));
                }
                // Lagged subscribers skip dropped events and continue.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(s).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
