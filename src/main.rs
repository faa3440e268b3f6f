use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::{StoreBackend, StoreConfig, TurnstileConfig};
use turnstile::http::{HttpServer, IdentityResolver};
use turnstile::ratelimit::{DecisionEngine, InMemoryStore, RateStore};

/// Per-identity HTTP admission control.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// YAML configuration file; `TURNSTILE_*` environment variables override it
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Turnstile admission gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config =
        TurnstileConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    let policy = config.policy().context("invalid rate limit policy")?;
    info!(
        listen_addr = %config.server.listen_addr,
        ip_limit = policy.ip_rule().max_requests,
        token_limit = policy.token_rule().max_requests,
        token_overrides = policy.override_count(),
        "Configuration loaded"
    );

    let store = open_store(&config.store).await?;
    let engine = DecisionEngine::new(store, policy).with_store_timeout(config.store.timeout);
    info!(backend = ?config.store.backend, "Decision engine initialized");

    let server = HttpServer::new(config.server.listen_addr, Arc::new(engine))
        .with_resolver(IdentityResolver::new(config.server.trust_proxy_headers));

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile stopped");
    Ok(())
}

/// Open the configured rate state store.
async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn RateStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = InMemoryStore::new();
            spawn_purge_task(store.clone(), config.purge_interval);
            Ok(Arc::new(store))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let store = turnstile::ratelimit::RedisStore::connect(&config.redis_url)
                .await
                .context("failed to connect to Redis")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => {
            anyhow::bail!("store backend `redis` requires building with the `redis` feature")
        }
    }
}

/// Periodically drop expired records from the in-memory store.
fn spawn_purge_task(store: InMemoryStore, every: std::time::Duration) {
    if every.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            debug!(purged = purged, remaining = store.len(), "Store sweep finished");
        }
    });
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
