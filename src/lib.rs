pub mod config;
pub mod events;
pub mod gate;
pub mod keys;
pub mod mcp;
pub mod pricing;
pub mod proxy;
pub mod router;
pub mod server;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use config::GatewayConfig;
use events::EventBroadcaster;
use gate::{FreeMethods, Gate, QuotaTracker, RateLimiter};
use keys::{CreditLedger, KeyStore};
use pricing::PricingTable;
use proxy::{BackendProxy, BackendTarget, HttpProxy, StdioProxy};
use router::{MultiServerRouter, RouterEntry};

/// Shared application state passed to every HTTP handler.
pub struct AppContext {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<KeyStore>,
    pub gate: Arc<Gate>,
    pub router: Arc<MultiServerRouter>,
    /// All configured backends, for lifecycle management.
    pub backends: Vec<Arc<dyn BackendProxy>>,
    pub broadcaster: EventBroadcaster,
    /// Bearer token guarding the admin surface.
    pub admin_token: String,
    /// HMAC key for scoped-token signing/verification.
    pub scoped_secret: Vec<u8>,
    /// Set during shutdown; the edge answers 503 while draining.
    pub draining: Arc<AtomicBool>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire the whole pipeline together from config. Backends are built but
    /// not started; call [`AppContext::start_backends`] before serving.
    pub async fn build(config: GatewayConfig) -> Result<Self> {
        let config = Arc::new(config);
        let broadcaster = EventBroadcaster::new();

        let ledger = Arc::new(CreditLedger::default());
        let store = Arc::new(KeyStore::new(
            Arc::clone(&ledger),
            config.state_file.clone(),
            config.max_keys,
        ));
        store
            .load_snapshot()
            .await
            .context("failed to load key snapshot")?;

        let gate = Arc::new(Gate::new(
            Arc::clone(&store),
            QuotaTracker::new(config.quota.clone()),
            RateLimiter::new(config.rate_limit.clone()),
            PricingTable::new(config.default_price, config.pricing.clone()),
            FreeMethods::new(&config.free_methods),
            config.shadow_mode,
            broadcaster.clone(),
        ));

        let mut backends: Vec<Arc<dyn BackendProxy>> = Vec::new();
        let mut entries = Vec::new();
        for backend_config in &config.backends {
            let backend: Arc<dyn BackendProxy> = match &backend_config.target {
                BackendTarget::Stdio { command, args, env } => Arc::new(StdioProxy::new(
                    command.clone(),
                    args.clone(),
                    env.clone(),
                )),
                BackendTarget::Http { url } => Arc::new(
                    HttpProxy::new(url.clone())
                        .with_context(|| format!("backend {:?}", backend_config.prefix))?,
                ),
            };
            backends.push(Arc::clone(&backend));
            entries.push(RouterEntry {
                prefix: backend_config.prefix.clone(),
                backend,
            });
        }

        let router = Arc::new(MultiServerRouter::new(
            entries,
            config.separator.clone(),
            Arc::clone(&gate),
            broadcaster.clone(),
            config.refund_on_failure,
        )?);

        let admin_token = server::auth::get_or_create_token(&config.data_dir, "admin_token")?;
        let scoped_secret = server::auth::get_or_create_token(&config.data_dir, "signing_key")?
            .into_bytes();

        Ok(Self {
            config,
            store,
            gate,
            router,
            backends,
            broadcaster,
            admin_token,
            scoped_secret,
            draining: Arc::new(AtomicBool::new(false)),
            started_at: std::time::Instant::now(),
        })
    }

    pub async fn start_backends(&self) -> Result<()> {
        for backend in &self.backends {
            backend.start().await?;
        }
        Ok(())
    }

    pub async fn stop_backends(&self) {
        for backend in &self.backends {
            backend.stop().await;
        }
    }
}
