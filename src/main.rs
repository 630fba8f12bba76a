use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::WardenConfig;
use ratewarden::db::SqliteStore;
use ratewarden::http::{build_router, AppState, HttpServer, RequestRecorder};
use ratewarden::ratelimit::{
    make_limiter, FailurePolicy, InMemoryPolicyStore, InMemoryRequestLog, PolicySet, PolicyStore,
    RequestCounter, RequestLogWriter, TieredRateLimiter,
};

/// How often the request log is pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about = "Tiered rate limiting for HTTP APIs")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Policy file; overrides `rate_limiting.policy_path`
    #[arg(long, short)]
    policies: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve,
    /// Validate the policy file and print a summary
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = WardenConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let policy_path = cli
        .policies
        .clone()
        .or_else(|| config.rate_limiting.policy_path.as_ref().map(PathBuf::from));

    match cli.command {
        Command::Serve => serve(config, policy_path.as_deref()).await,
        Command::Check => check(&config, policy_path.as_deref()),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn serve(config: WardenConfig, policy_path: Option<&Path>) -> anyhow::Result<()> {
    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let backends = open_backends(&config, policy_path).await?;
    let rate_limiting = &config.rate_limiting;

    let limiter = TieredRateLimiter::new(backends.store, backends.counter)
        .with_default_quota(rate_limiting.default_quota())
        .with_failure_policy(FailurePolicy::new(
            rate_limiting.failure_mode,
            rate_limiting.store_timeout(),
        ));
    info!(
        default_limit = rate_limiting.default_limit,
        default_window_secs = rate_limiting.default_window_secs,
        failure_mode = ?rate_limiting.failure_mode,
        "Tiered rate limiter initialized"
    );

    let anonymous = make_limiter(config.anonymous.limit, config.anonymous.window_minutes)
        .with_max_entries(config.anonymous.max_entries)
        .with_name("anonymous");

    let pruner = spawn_log_pruner(backends.writer.clone(), rate_limiting.log_retention());

    let router = build_router(AppState {
        limiter: Arc::new(limiter),
        anonymous: Arc::new(anonymous),
        recorder: RequestRecorder::new(backends.writer),
        trust_identity_headers: config.server.trust_identity_headers,
    });

    if config.server.trust_identity_headers {
        warn!("Trusting X-User-Id / X-User-Role headers; run behind an authenticating proxy");
    } else {
        info!("Identity headers ignored; /api requests are not tier-limited without an AuthUser");
    }

    HttpServer::new(config.server.http_addr, router)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    pruner.abort();
    info!("Ratewarden stopped");
    Ok(())
}

fn check(config: &WardenConfig, policy_path: Option<&Path>) -> anyhow::Result<()> {
    let path = policy_path
        .context("no policy file given; pass --policies or set rate_limiting.policy_path")?;
    let policies = PolicySet::from_file(path)
        .with_context(|| format!("loading policies from {}", path.display()))?;

    println!("{}: ok", path.display());
    println!(
        "  roles: {}, users: {}, endpoints: {}",
        policies.roles.len(),
        policies.users.len(),
        policies.endpoints.len()
    );
    for policy in &policies.endpoints {
        let quota = policy.quota();
        println!(
            "  endpoint {} {} -> {} per {}s",
            policy.method,
            policy.endpoint,
            quota.limit(),
            quota.window_secs()
        );
    }
    let default = config.rate_limiting.default_quota();
    println!(
        "  default -> {} per {}s",
        default.limit(),
        default.window_secs()
    );
    Ok(())
}

struct Backends {
    store: Arc<dyn PolicyStore>,
    counter: Arc<dyn RequestCounter>,
    writer: Arc<dyn RequestLogWriter>,
}

/// SQLite when `database_url` is set, otherwise in memory.
///
/// With a database, the policy file (if any) is imported on startup.
async fn open_backends(
    config: &WardenConfig,
    policy_path: Option<&Path>,
) -> anyhow::Result<Backends> {
    let policies = policy_path
        .map(|path| {
            PolicySet::from_file(path)
                .with_context(|| format!("loading policies from {}", path.display()))
        })
        .transpose()?;

    match &config.rate_limiting.database_url {
        Some(url) => {
            let store = Arc::new(
                SqliteStore::connect(url)
                    .await
                    .with_context(|| format!("opening database {}", url))?,
            );
            if let Some(policies) = &policies {
                store.import_policies(policies).await?;
            }
            Ok(Backends {
                store: store.clone(),
                counter: store.clone(),
                writer: store,
            })
        }
        None => {
            if policies.is_none() {
                warn!("No policy file configured; only the default tier applies");
            }
            let store = Arc::new(InMemoryPolicyStore::with_policies(
                policies.unwrap_or_default(),
            ));
            let log = Arc::new(InMemoryRequestLog::new());
            info!("Using in-memory policy store and request log");
            Ok(Backends {
                store,
                counter: log.clone(),
                writer: log,
            })
        }
    }
}

/// Periodically drop request log entries older than `retention`.
fn spawn_log_pruner(writer: Arc<dyn RequestLogWriter>, retention: Duration) -> JoinHandle<()> {
    let retention =
        chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(365));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
                continue;
            };
            match writer.prune_before(cutoff).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Pruned request log"),
                Err(e) => warn!(error = %e, "Failed to prune request log"),
            }
        }
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
