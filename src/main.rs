use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scenegate::canary::CanaryRouter;
use scenegate::config::{BackendKind, GatewayConfig, RateLimitingConfig};
use scenegate::http::{admin_router, app_router, GovernanceStack, HttpServer};
use scenegate::idempotency::{IdempotencyCache, InMemoryIdempotencyStore};
use scenegate::ratelimit::{
    InMemoryRateLimitStore, RateLimitState, RateLimitStore, RedisSlidingWindow, SlidingWindowStore,
};

/// Request-governance gateway: rate limiting, canary routing and idempotency keys.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG (e.g. "debug" or "scenegate=trace")
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref(), args.log_format)?;

    info!("Starting Scenegate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::load(args.config.as_deref())?;
    info!(
        http_addr = %config.server.http_addr,
        admin_addr = %config.server.admin_addr,
        "Configuration loaded"
    );

    let mut background = Vec::new();

    let (rate_limit_store, cleanup) = build_rate_limit_store(&config.rate_limiting).await;
    background.extend(cleanup);
    let rules = config.rate_limiting.load_rules()?;
    info!(rules = rules.rules.len(), "Rate limiter initialized");

    let canary = Arc::new(CanaryRouter::new(config.canary.clone())?);

    let idempotency_store = Arc::new(InMemoryIdempotencyStore::new());
    background.push(spawn_purge(
        Arc::clone(&idempotency_store),
        config.idempotency.retention(),
    ));
    let idempotency = Arc::new(IdempotencyCache::new(
        idempotency_store,
        config.idempotency.clone(),
    )?);
    info!(
        protected_routes = ?config.idempotency.protected_routes,
        "Idempotency cache initialized"
    );

    let stack = GovernanceStack::new(
        RateLimitState::new(rate_limit_store, rules),
        canary,
        idempotency,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    let app_server = HttpServer::new("app", config.server.http_addr, stack.apply(app_router()));
    let admin_server = HttpServer::new("admin", config.server.admin_addr, admin_router(stack));

    let result = tokio::try_join!(
        app_server.serve_with_shutdown(wait_for_shutdown(shutdown_rx.clone())),
        admin_server.serve_with_shutdown(wait_for_shutdown(shutdown_rx)),
    );

    for task in background {
        task.abort();
    }
    result?;

    info!("Scenegate stopped");
    Ok(())
}

fn init_tracing(level: Option<&str>, format: LogFormat) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

/// Build the configured rate limit store.
///
/// An unreachable Redis at startup falls back to the in-process store. The
/// in-process store comes with its cleanup task.
async fn build_rate_limit_store(
    config: &RateLimitingConfig,
) -> (Arc<dyn RateLimitStore>, Option<JoinHandle<()>>) {
    if config.backend == BackendKind::Redis {
        let url = config.redis_url.as_deref().unwrap_or_default();
        match RedisSlidingWindow::connect(url).await {
            Ok(backend) => {
                let store = SlidingWindowStore::new(backend)
                    .with_timeout(config.backend_timeout())
                    .with_expiry_buffer(config.expiry_buffer());
                info!(
                    timeout_ms = config.backend_timeout_ms,
                    "Using distributed sliding-window rate limiter"
                );
                return (Arc::new(store), None);
            }
            Err(e) => {
                warn!(error = %e, "Rate limit cache unreachable, using in-process rate limiter");
            }
        }
    }

    let store = Arc::new(InMemoryRateLimitStore::new());
    let cleanup = store.spawn_cleanup(config.cleanup_interval());
    info!(
        cleanup_interval_secs = config.cleanup_interval_secs,
        "Using in-process fixed-window rate limiter"
    );
    (store, Some(cleanup))
}

/// Periodically drop idempotency records older than `retention`.
fn spawn_purge(store: Arc<InMemoryIdempotencyStore>, retention: Duration) -> JoinHandle<()> {
    let period = (retention / 10).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            store.purge_older_than(retention);
        }
    })
}

async fn wait_for_shutdown(mut rx: watch::Receiver<()>) {
    let _ = rx.changed().await;
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
