//! `proxy` — transports to wrapped MCP servers.
//!
//! Two variants implement [`BackendProxy`]: [`StdioProxy`] spawns the server
//! as a child process and speaks newline-delimited JSON-RPC over its pipes;
//! [`HttpProxy`] talks to a remote streamable-HTTP MCP server, including SSE
//! response bodies. Both correlate responses to requests by JSON-RPC id.

pub mod http;
pub mod sse;
pub mod stdio;

pub use http::HttpProxy;
pub use stdio::StdioProxy;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::mcp::{McpMessage, McpResponse};

/// Per-request timeout applied by both transports.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Request and response body cap.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
/// Grace period between SIGTERM and SIGKILL on stdio shutdown, and the
/// best-effort DELETE timeout on HTTP shutdown.
pub const STOP_GRACE_SECS: u64 = 5;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("backend not started")]
    NotStarted,
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("backend exited before a response was received")]
    BackendGone,
    #[error("failed to spawn backend: {0}")]
    Spawn(String),
    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("No matching response in SSE stream")]
    NoSseMatch,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("invalid JSON from backend: {0}")]
    Parse(#[from] serde_json::Error),
}

// ─── Backend configuration ────────────────────────────────────────────────────

/// Where one backend lives: a command to spawn, or a remote URL.
#[derive(Debug, Clone)]
pub enum BackendTarget {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Http {
        url: String,
    },
}

/// One configured backend behind the router.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub prefix: String,
    pub target: BackendTarget,
}

// ─── Transport trait ──────────────────────────────────────────────────────────

/// One wrapped MCP server. `forward` and `forward_ungated` share the same
/// transport behavior — the distinction is who calls them: the router uses
/// `forward_ungated` for calls the gate already admitted (or that never
/// needed admission), keeping the charge decision out of the transport.
#[async_trait]
pub trait BackendProxy: Send + Sync {
    /// Start the transport (spawn the child / mark the remote usable).
    async fn start(&self) -> Result<(), ProxyError>;

    /// Stop gracefully; safe to call more than once.
    async fn stop(&self);

    fn is_running(&self) -> bool;

    /// Forward a request that was admitted by the gate.
    async fn forward(&self, request: &McpMessage) -> Result<McpResponse, ProxyError>;

    /// Forward without any admission semantics (free methods, post-charge
    /// batch entries, router fan-out).
    async fn forward_ungated(&self, request: &McpMessage) -> Result<McpResponse, ProxyError>;
}
