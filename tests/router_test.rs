//! Integration tests for the prefix router.
//!
//! Tests cover:
//! 1. Prefix routing — backend receives the stripped tool name
//! 2. tools/list aggregation, rewriting, and ACL filtering
//! 3. Unknown / missing prefix errors carry the valid prefixes
//! 4. Refund on downstream error (and no refund when disabled)
//! 5. Free methods go to the first backend
//! 6. Router configuration invariants

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use paygate::events::{EventBroadcaster, GatewayEvent};
use paygate::gate::{CallerContext, FreeMethods, Gate, QuotaTracker, RateLimitConfig, RateLimiter, ToolCall};
use paygate::keys::{CreditLedger, KeyConfig, KeyStore};
use paygate::mcp::{McpError, McpMessage, McpResponse};
use paygate::pricing::PricingTable;
use paygate::proxy::{BackendProxy, ProxyError};
use paygate::router::{MultiServerRouter, RouterConfigError, RouterEntry};

// ─── Mock backend ─────────────────────────────────────────────────────────────

/// Records every forwarded request and answers from a canned script.
struct MockBackend {
    requests: Mutex<Vec<McpMessage>>,
    tools: Vec<&'static str>,
    /// When set, tools/call responses carry this error.
    fail_calls: Option<McpError>,
}

impl MockBackend {
    fn new(tools: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            tools,
            fail_calls: None,
        })
    }

    fn failing(tools: Vec<&'static str>, error: McpError) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            tools,
            fail_calls: Some(error),
        })
    }

    async fn recorded(&self) -> Vec<McpMessage> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl BackendProxy for MockBackend {
    async fn start(&self) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn stop(&self) {}

    fn is_running(&self) -> bool {
        true
    }

    async fn forward(&self, request: &McpMessage) -> Result<McpResponse, ProxyError> {
        self.forward_ungated(request).await
    }

    async fn forward_ungated(&self, request: &McpMessage) -> Result<McpResponse, ProxyError> {
        self.requests.lock().await.push(request.clone());
        let id = request.id.clone().unwrap_or(Value::Null);
        match request.method.as_str() {
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .iter()
                    .map(|name| json!({ "name": name, "description": format!("{name} tool") }))
                    .collect();
                Ok(McpResponse::ok(id, json!({ "tools": tools })))
            }
            "tools/call" => match &self.fail_calls {
                Some(error) => Ok(McpResponse::error(id, error.clone())),
                None => Ok(McpResponse::ok(
                    id,
                    json!({ "content": [{ "type": "text", "text": "done" }] }),
                )),
            },
            _ => Ok(McpResponse::ok(id, json!({}))),
        }
    }
}

// ─── Fixture ──────────────────────────────────────────────────────────────────

struct Fixture {
    store: Arc<KeyStore>,
    router: MultiServerRouter,
    broadcaster: EventBroadcaster,
}

fn make_router(
    backends: Vec<(&str, Arc<MockBackend>)>,
    default_price: u64,
    refund_on_failure: bool,
) -> Fixture {
    let store = Arc::new(KeyStore::new(Arc::new(CreditLedger::default()), None, 0));
    let broadcaster = EventBroadcaster::new();
    let gate = Arc::new(Gate::new(
        Arc::clone(&store),
        QuotaTracker::new(None),
        RateLimiter::new(RateLimitConfig::default()),
        PricingTable::new(default_price, HashMap::new()),
        FreeMethods::default(),
        false,
        broadcaster.clone(),
    ));
    let entries = backends
        .into_iter()
        .map(|(prefix, backend)| RouterEntry {
            prefix: prefix.to_string(),
            backend: backend as Arc<dyn BackendProxy>,
        })
        .collect();
    let router = MultiServerRouter::new(
        entries,
        ":".to_string(),
        gate,
        broadcaster.clone(),
        refund_on_failure,
    )
    .unwrap();
    Fixture {
        store,
        router,
        broadcaster,
    }
}

// ─── 1. Prefix routing ───────────────────────────────────────────────────────

#[tokio::test]
async fn call_strips_prefix_and_preserves_id() {
    let fs = MockBackend::new(vec!["read_file"]);
    let gh = MockBackend::new(vec!["search_repos"]);
    let fx = make_router(vec![("fs", Arc::clone(&fs)), ("gh", Arc::clone(&gh))], 5, false);
    let key = fx.store.create("k", 100, KeyConfig::default()).await.unwrap();

    let response = fx
        .router
        .call_tool(
            &key.key,
            json!(42),
            ToolCall {
                name: "fs:read_file".to_string(),
                arguments: json!({ "path": "/tmp/x" }),
            },
            &CallerContext::default(),
        )
        .await;

    assert!(response.error.is_none());
    assert_eq!(response.id, json!(42));

    let sent = fs.recorded().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, "tools/call");
    let params = sent[0].params.as_ref().unwrap();
    assert_eq!(params["name"], "read_file");
    assert_eq!(params["arguments"]["path"], "/tmp/x");

    // The other backend saw nothing.
    assert!(gh.recorded().await.is_empty());

    // Gate priced the prefixed name.
    assert_eq!(fx.store.get(&key.key).await.unwrap().credits, 95);
}

// ─── 2. tools/list aggregation ───────────────────────────────────────────────

#[tokio::test]
async fn list_merges_prefixes_and_rewrites() {
    let fs = MockBackend::new(vec!["read_file", "write_file"]);
    let gh = MockBackend::new(vec!["search_repos"]);
    let fx = make_router(vec![("fs", fs), ("gh", gh)], 1, false);

    let response = fx.router.list_tools(json!(1), None).await;
    let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
    let names: Vec<&str> = tools
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    // Stable order: configuration order, then backend order.
    assert_eq!(names, vec!["fs:read_file", "fs:write_file", "gh:search_repos"]);
    assert_eq!(tools[0]["description"], "[fs] read_file tool");
}

#[tokio::test]
async fn list_filters_against_prefixed_acl() {
    let fs = MockBackend::new(vec!["read_file", "write_file"]);
    let gh = MockBackend::new(vec!["search_repos"]);
    let fx = make_router(vec![("fs", fs), ("gh", gh)], 1, false);

    let config = KeyConfig {
        allowed_tools: ["fs:read_file".to_string()].into_iter().collect(),
        ..Default::default()
    };
    let key = fx.store.create("k", 10, config).await.unwrap();
    let record = fx.store.get(&key.key).await.unwrap();

    let response = fx.router.list_tools(json!(1), Some(&record)).await;
    let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
    let names: Vec<&str> = tools
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["fs:read_file"]);
}

// ─── 3. Prefix errors ────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_prefix_lists_valid_ones() {
    let fs = MockBackend::new(vec!["read_file"]);
    let fx = make_router(vec![("fs", fs)], 1, false);
    let key = fx.store.create("k", 10, KeyConfig::default()).await.unwrap();

    for bad_name in ["zz:tool", "no_separator_here"] {
        let response = fx
            .router
            .call_tool(
                &key.key,
                json!(1),
                ToolCall {
                    name: bad_name.to_string(),
                    arguments: json!({}),
                },
                &CallerContext::default(),
            )
            .await;
        let error = response.error.expect("should be an error");
        assert_eq!(error.code, -32602);
        let prefixes = error.data.unwrap()["validPrefixes"].clone();
        assert_eq!(prefixes, json!(["fs"]));
    }

    // Nothing charged for malformed names.
    assert_eq!(fx.store.get(&key.key).await.unwrap().credits, 10);
}

// ─── 4. Refund on failure ────────────────────────────────────────────────────

#[tokio::test]
async fn downstream_error_refunds_when_enabled() {
    let fs = MockBackend::failing(vec!["read_file"], McpError::new(-1, "boom"));
    let fx = make_router(vec![("fs", fs)], 5, true);
    let key = fx.store.create("k", 100, KeyConfig::default()).await.unwrap();
    let mut events = fx.broadcaster.subscribe();

    let response = fx
        .router
        .call_tool(
            &key.key,
            json!(7),
            ToolCall {
                name: "fs:read_file".to_string(),
                arguments: json!({}),
            },
            &CallerContext::default(),
        )
        .await;

    // The downstream error is passed through...
    assert_eq!(response.error.as_ref().unwrap().message, "boom");
    // ...and the charge is restored.
    assert_eq!(fx.store.get(&key.key).await.unwrap().credits, 100);

    match events.recv().await.unwrap() {
        GatewayEvent::ToolCall(event) => {
            assert!(event.refunded);
            assert_eq!(event.credits_charged, 0);
            assert!(!event.ok);
            assert_eq!(event.tool, "fs:read_file");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn downstream_error_keeps_charge_when_disabled() {
    let fs = MockBackend::failing(vec!["read_file"], McpError::new(-1, "boom"));
    let fx = make_router(vec![("fs", fs)], 5, false);
    let key = fx.store.create("k", 100, KeyConfig::default()).await.unwrap();

    fx.router
        .call_tool(
            &key.key,
            json!(7),
            ToolCall {
                name: "fs:read_file".to_string(),
                arguments: json!({}),
            },
            &CallerContext::default(),
        )
        .await;
    assert_eq!(fx.store.get(&key.key).await.unwrap().credits, 95);
}

// ─── 5. Free methods ─────────────────────────────────────────────────────────

#[tokio::test]
async fn free_methods_reach_first_backend() {
    let fs = MockBackend::new(vec!["read_file"]);
    let gh = MockBackend::new(vec!["search_repos"]);
    let fx = make_router(vec![("fs", Arc::clone(&fs)), ("gh", Arc::clone(&gh))], 1, false);

    let request = McpMessage::request(json!(1), "initialize", Some(json!({})));
    let response = fx.router.forward_free(&request).await.unwrap();
    assert!(response.error.is_none());

    assert_eq!(fs.recorded().await.len(), 1);
    assert!(gh.recorded().await.is_empty());
}

// ─── 6. Configuration invariants ─────────────────────────────────────────────

#[tokio::test]
async fn invalid_configurations_rejected() {
    let store = Arc::new(KeyStore::new(Arc::new(CreditLedger::default()), None, 0));
    let broadcaster = EventBroadcaster::new();
    let gate = Arc::new(Gate::new(
        Arc::clone(&store),
        QuotaTracker::new(None),
        RateLimiter::new(RateLimitConfig::default()),
        PricingTable::default(),
        FreeMethods::default(),
        false,
        broadcaster.clone(),
    ));

    let entry = |prefix: &str| RouterEntry {
        prefix: prefix.to_string(),
        backend: MockBackend::new(vec![]) as Arc<dyn BackendProxy>,
    };

    let empty = MultiServerRouter::new(
        Vec::new(),
        ":".into(),
        Arc::clone(&gate),
        broadcaster.clone(),
        false,
    );
    assert!(matches!(empty, Err(RouterConfigError::Empty)));

    let duplicate = MultiServerRouter::new(
        vec![entry("fs"), entry("fs")],
        ":".into(),
        Arc::clone(&gate),
        broadcaster.clone(),
        false,
    );
    assert!(matches!(duplicate, Err(RouterConfigError::DuplicatePrefix(_))));

    let separator_in_prefix = MultiServerRouter::new(
        vec![entry("a:b")],
        ":".into(),
        gate,
        broadcaster,
        false,
    );
    assert!(matches!(
        separator_in_prefix,
        Err(RouterConfigError::SeparatorInPrefix(_, _))
    ));
}
