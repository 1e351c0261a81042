use anyhow::Result;
use clap::{Parser, Subcommand};
use paygate::{config::GatewayConfig, server, AppContext};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "paygate",
    about = "Paygate — pay-per-call gating proxy for MCP tool servers",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP port for /mcp and the admin surface
    #[arg(long, env = "PAYGATE_PORT")]
    port: Option<u16>,

    /// Data directory for config.toml, tokens, and the key snapshot
    #[arg(long, env = "PAYGATE_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PAYGATE_LOG")]
    log: Option<String>,

    /// Key snapshot file (relative paths resolve under the data dir)
    #[arg(long, env = "PAYGATE_STATE_FILE")]
    state_file: Option<std::path::PathBuf>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "PAYGATE_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway (default when no subcommand given).
    ///
    /// Examples:
    ///   paygate serve
    ///   paygate
    Serve,
    /// Print the admin bearer token for this data directory.
    ///
    /// Generates one on first use. Pass it as `Authorization: Bearer <token>`
    /// to the /admin routes.
    Token,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = GatewayConfig::new(args.port, args.data_dir, args.log, args.state_file)?;
    let _log_guard = init_logging(&config.log, args.log_file.as_deref());

    match args.command.unwrap_or(Command::Serve) {
        Command::Token => {
            let token = paygate::server::auth::get_or_create_token(&config.data_dir, "admin_token")?;
            println!("{token}");
            Ok(())
        }
        Command::Serve => run_serve(config).await,
    }
}

async fn run_serve(config: GatewayConfig) -> Result<()> {
    info!(
        port = config.port,
        backends = config.backends.len(),
        shadow = config.shadow_mode,
        refund_on_failure = config.refund_on_failure,
        "starting paygate"
    );
    if config.backends.is_empty() {
        anyhow::bail!("no backends configured — add [[backend]] tables to config.toml");
    }

    let ctx = Arc::new(AppContext::build(config).await?);
    ctx.start_backends().await?;

    let result = server::serve(Arc::clone(&ctx)).await;

    info!("listener closed — stopping backends");
    ctx.stop_backends().await;
    result
}

/// Initialise tracing. Returns a guard that must stay alive for the
/// non-blocking file writer, when one is configured.
fn init_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("paygate.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            // Fall back to stdout-only — don't panic on a bad log path.
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        warn!("logging to stdout and {}", path.display());
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
