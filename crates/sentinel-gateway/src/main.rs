//! sentinel-gateway - zero-trust policy gateway daemon.
//!
//! Sits between autonomous agents and the backend systems they act on.
//! Every agent action is authenticated, rate-checked, sanitized, scored
//! against the live rule set, and answered with allow / deny / pending
//! human approval; every evaluation lands in the audit trail.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sentinel_core::auth::KeyStore;
use sentinel_core::config::Config;
use sentinel_core::forward::NullSink;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sentinel_gateway::{router, AppState};

/// Sentinel policy gateway daemon.
#[derive(Parser, Debug)]
#[command(name = "sentinel-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Path to the sqlite audit database (overrides SENTINEL_AUDIT_STORE_URL).
    #[arg(long)]
    audit_db: Option<String>,

    /// Log filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(path) = args.audit_db {
        config.audit_store_url = Some(path);
    }

    info!(
        mode = %config.mode,
        approval_threshold = config.approval_threshold,
        block_threshold = config.block_threshold,
        "starting sentinel gateway"
    );

    let state = AppState::build(
        &config,
        Arc::new(NullSink),
        Arc::new(KeyStore::with_seeded_agents()),
    )
    .context("building application state")?;
    state.spawn_background_tasks(&config);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(listen = %args.listen, "sentinel gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    info!("sentinel gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
