//! HTTP surface: the `/mcp` admission edge, the admin routes, the event
//! stream, and `/healthz`.
//!
//! During shutdown the edge answers 503 while in-flight requests drain;
//! backends are stopped after the listener closes.

pub mod admin;
pub mod auth;
pub mod mcp_handler;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, State};
use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::proxy::MAX_BODY_BYTES;
use crate::AppContext;

pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], ctx.config.port).into();
    let router = build_router(Arc::clone(&ctx));

    info!("gateway listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(ctx))
    .await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let admin_routes = Router::new()
        .route(
            "/admin/keys",
            post(admin::create_key).get(admin::list_keys),
        )
        .route("/admin/keys/{id}", get(admin::get_key))
        .route("/admin/keys/{id}/topup", post(admin::topup_key))
        .route("/admin/keys/{id}/revoke", post(admin::revoke_key))
        .route("/admin/keys/{id}/suspend", post(admin::suspend_key))
        .route("/admin/keys/{id}/resume", post(admin::resume_key))
        .route("/admin/keys/{id}/ledger", get(admin::key_ledger))
        .route("/admin/keys/{id}/velocity", get(admin::key_velocity))
        .route("/admin/keys/{id}/scoped-token", post(admin::mint_token))
        .route("/admin/transfer", post(admin::transfer))
        .route("/admin/events", get(admin::events_sse))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&ctx),
            admin::require_admin,
        ));

    Router::new()
        .route("/mcp", post(mcp_handler::mcp_endpoint))
        .route("/healthz", get(healthz))
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn healthz(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let backends: Vec<_> = ctx
        .router
        .backend_health()
        .into_iter()
        .map(|(prefix, running)| json!({ "prefix": prefix, "running": running }))
        .collect();
    Json(json!({
        "status": "ok",
        "uptimeSecs": ctx.started_at.elapsed().as_secs(),
        "shadowMode": ctx.config.shadow_mode,
        "backends": backends,
    }))
}

/// Resolve on ctrl-c or SIGTERM; flips the drain flag first so keep-alive
/// connections see 503 while axum finishes in-flight requests.
async fn shutdown_signal(ctx: Arc<AppContext>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested — draining in-flight requests");
    ctx.draining.store(true, std::sync::atomic::Ordering::SeqCst);
}
