//! Gateway configuration.
//!
//! Priority: CLI / env var  >  `{data_dir}/config.toml`  >  built-in
//! default. Backend definitions ([[backend]] tables) only come from the
//! TOML file; everything else can be overridden from the command line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::Deserialize;
use tracing::error;

use crate::gate::rate_limit::RateLimitConfig;
use crate::gate::default_free_methods;
use crate::keys::QuotaLimits;
use crate::proxy::{BackendConfig, BackendTarget};
use crate::router::DEFAULT_SEPARATOR;

const DEFAULT_PORT: u16 = 8402;
const DEFAULT_MAX_KEYS: usize = 0;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// One `[[backend]]` table: a prefix plus exactly one of `command` or `url`.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendToml {
    pub prefix: String,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub url: Option<String>,
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    /// HTTP port for `/mcp` and the admin surface (default: 8402).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,paygate=trace".
    log: Option<String>,
    /// Key snapshot path; relative paths resolve under the data dir.
    /// Omit to keep keys in memory only.
    state_file: Option<PathBuf>,
    /// Credits charged when a tool has no explicit price (default: 1).
    default_price: Option<u64>,
    /// Separator between backend prefix and tool name (default: ":").
    separator: Option<String>,
    /// Restore charged credits when the backend reports an error.
    refund_on_failure: Option<bool>,
    /// Evaluate admissions but never enforce them (observability only).
    shadow_mode: Option<bool>,
    /// Methods that bypass admission; a trailing `*` is a prefix wildcard.
    free_methods: Option<Vec<String>>,
    /// Maximum live keys; 0 = unlimited.
    max_keys: Option<usize>,
    rate_limit: Option<RateLimitToml>,
    /// Global quota defaults (per-key overrides win).
    quota: Option<QuotaLimits>,
    /// Per-tool prices keyed by the prefixed public name.
    #[serde(default)]
    pricing: HashMap<String, u64>,
    #[serde(default)]
    backend: Vec<BackendToml>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitToml {
    global_per_minute: Option<u64>,
    #[serde(default)]
    per_tool: HashMap<String, u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── GatewayConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub state_file: Option<PathBuf>,
    pub default_price: u64,
    pub separator: String,
    pub refund_on_failure: bool,
    pub shadow_mode: bool,
    pub free_methods: Vec<String>,
    pub max_keys: usize,
    pub rate_limit: RateLimitConfig,
    pub quota: Option<QuotaLimits>,
    pub pricing: HashMap<String, u64>,
    pub backends: Vec<BackendConfig>,
}

impl GatewayConfig {
    /// Build config from CLI/env args + optional TOML file.
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        state_file: Option<PathBuf>,
    ) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let state_file = state_file.or(toml.state_file).map(|p| {
            if p.is_absolute() {
                p
            } else {
                data_dir.join(p)
            }
        });

        let separator = toml
            .separator
            .unwrap_or_else(|| DEFAULT_SEPARATOR.to_string());
        if separator.is_empty() {
            bail!("separator must not be empty");
        }

        let rate_limit = match toml.rate_limit {
            Some(rl) => RateLimitConfig {
                global_per_minute: rl.global_per_minute,
                per_tool: rl.per_tool,
            },
            None => RateLimitConfig::default(),
        };

        let backends = toml
            .backend
            .into_iter()
            .map(|b| backend_from_toml(b, &separator))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            port,
            data_dir,
            log,
            state_file,
            default_price: toml.default_price.unwrap_or(crate::pricing::DEFAULT_PRICE),
            separator,
            refund_on_failure: toml.refund_on_failure.unwrap_or(false),
            shadow_mode: toml.shadow_mode.unwrap_or(false),
            free_methods: toml.free_methods.unwrap_or_else(default_free_methods),
            max_keys: toml.max_keys.unwrap_or(DEFAULT_MAX_KEYS),
            rate_limit,
            quota: toml.quota.filter(|q| !q.is_unlimited()),
            pricing: toml.pricing,
            backends,
        })
    }
}

fn backend_from_toml(b: BackendToml, separator: &str) -> Result<BackendConfig> {
    if b.prefix.is_empty() {
        bail!("backend prefix must not be empty");
    }
    if b.prefix.contains(separator) {
        bail!(
            "backend prefix {:?} must not contain the separator {:?}",
            b.prefix,
            separator
        );
    }
    let target = match (&b.command, &b.url) {
        (Some(command), None) => BackendTarget::Stdio {
            command: command.clone(),
            args: b.args.clone(),
            env: b.env.clone(),
        },
        (None, Some(url)) => BackendTarget::Http { url: url.clone() },
        (Some(_), Some(_)) => bail!(
            "backend {:?} sets both command and url — pick one",
            b.prefix
        ),
        (None, None) => bail!("backend {:?} needs either command or url", b.prefix),
    };
    Ok(BackendConfig {
        prefix: b.prefix,
        target,
    })
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".paygate")
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) {
        std::fs::write(dir.join("config.toml"), body).unwrap();
    }

    #[test]
    fn defaults_without_toml() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = GatewayConfig::new(None, Some(dir.path().to_path_buf()), None, None).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.separator, ":");
        assert!(!cfg.refund_on_failure);
        assert!(cfg.free_methods.iter().any(|m| m == "tools/list"));
        assert!(cfg.backends.is_empty());
    }

    #[test]
    fn cli_overrides_toml() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "port = 9000\nlog = \"debug\"\n");
        let cfg = GatewayConfig::new(
            Some(7000),
            Some(dir.path().to_path_buf()),
            None,
            None,
        )
        .unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.log, "debug");
    }

    #[test]
    fn backends_parse_both_kinds() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
refund_on_failure = true
default_price = 2

[pricing]
"fs:read_file" = 5

[rate_limit]
global_per_minute = 120

[[backend]]
prefix = "fs"
command = "mcp-fs"
args = ["--root", "/tmp"]

[[backend]]
prefix = "gh"
url = "https://example.com/mcp"
"#,
        );
        let cfg = GatewayConfig::new(None, Some(dir.path().to_path_buf()), None, None).unwrap();
        assert!(cfg.refund_on_failure);
        assert_eq!(cfg.default_price, 2);
        assert_eq!(cfg.pricing.get("fs:read_file"), Some(&5));
        assert_eq!(cfg.rate_limit.global_per_minute, Some(120));
        assert_eq!(cfg.backends.len(), 2);
        assert!(matches!(cfg.backends[0].target, BackendTarget::Stdio { .. }));
        assert!(matches!(cfg.backends[1].target, BackendTarget::Http { .. }));
    }

    #[test]
    fn backend_with_both_targets_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "[[backend]]\nprefix = \"x\"\ncommand = \"a\"\nurl = \"https://b\"\n",
        );
        assert!(GatewayConfig::new(None, Some(dir.path().to_path_buf()), None, None).is_err());
    }

    #[test]
    fn prefix_containing_separator_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "[[backend]]\nprefix = \"a:b\"\ncommand = \"c\"\n",
        );
        assert!(GatewayConfig::new(None, Some(dir.path().to_path_buf()), None, None).is_err());
    }

    #[test]
    fn relative_state_file_resolves_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "state_file = \"keys.json\"\n");
        let cfg = GatewayConfig::new(None, Some(dir.path().to_path_buf()), None, None).unwrap();
        assert_eq!(cfg.state_file.unwrap(), dir.path().join("keys.json"));
    }
}
