use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, net::SocketAddr, num::NonZeroU32, path::Path};
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod ids;
mod models;
mod routes;
mod services;
mod state;
mod units;

use routes::rate_limit::{ip_rate_limiter, spawn_pruner};
use services::{
    blob_store::BlobStore,
    ledger::Ledger,
    lifecycle::LifecycleEngine,
    reclaimer::Reclaimer,
};
use state::{AppState, HttpSettings};

const DB_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting ephemeral-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    let blobs = BlobStore::new(&cfg.storage_dir);
    blobs.ensure_root().await?;

    // --- Initialize SQLite ledger ---
    ensure_db_parent(&cfg.database_url)?;
    let ledger = Ledger::connect(&cfg.database_url, DB_MAX_CONNECTIONS).await?;
    ledger.migrate().await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    match &cfg.api_key {
        Some(_) => tracing::info!("API key authentication enabled"),
        None => tracing::info!("API key authentication disabled - public access"),
    }

    // --- Initialize core services ---
    let engine = LifecycleEngine::new(ledger, blobs, cfg.retention);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reclaimer = Reclaimer::new(engine.clone(), cfg.reclaimer);

    // No uploads are in flight yet, so leftovers from a crash go now.
    let report = reclaimer.sweep_startup().await;
    tracing::info!(
        "startup sweep evicted {} files, removed {} orphans, {} failures",
        report.evicted,
        report.orphans_removed,
        report.failures
    );
    let reclaimer = reclaimer.spawn(shutdown_rx.clone());

    // --- Build router ---
    let settings = HttpSettings {
        public_url: cfg.public_url.clone(),
        api_key: cfg.api_key.clone(),
    };
    let mut state = AppState::new(engine, settings);
    let mut pruner = None;
    match NonZeroU32::new(cfg.rate_limit_per_minute) {
        Some(per_minute) => {
            tracing::info!("Rate limit: {} requests per minute per client", per_minute);
            let limiter = ip_rate_limiter(per_minute);
            pruner = Some(spawn_pruner(limiter.clone(), shutdown_rx));
            state = state.with_rate_limiter(limiter);
        }
        None => tracing::info!("Rate limiting disabled"),
    }
    let app: Router = routes::routes::routes(state, cfg.io_timeout);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // --- Stop the reclaimer ---
    let _ = shutdown_tx.send(true);
    if let Err(err) = reclaimer.await {
        tracing::warn!("reclaimer task ended abnormally: {}", err);
    }
    if let Some(pruner) = pruner {
        let _ = pruner.await;
    }

    Ok(())
}

/// Create the directory holding the SQLite file if the URL points at one.
fn ensure_db_parent(database_url: &str) -> Result<()> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if db_path.is_empty() || db_path.starts_with(":memory:") {
        return Ok(());
    }

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
