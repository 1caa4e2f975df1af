use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use services::{
    metadata_store::MetadataStore,
    object_store::{LocalObjectStore, ObjectStore},
    reaper::ExpiryReaper,
    share_service::ShareService,
};

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

    tracing::info!("Starting tempshare with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing database url `{}`", cfg.database_url))?
        .create_if_missing(true)
        .foreign_keys(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("connecting to metadata database")?,
    );

    let metadata = MetadataStore::new(db);
    let applied = metadata.migrate().await.context("running migrations")?;
    tracing::info!("Applied {} migration statements", applied);

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core service ---
    let objects = Arc::new(LocalObjectStore::new(&cfg.storage_dir));
    objects
        .ensure_bucket(&cfg.bucket)
        .await
        .with_context(|| format!("creating bucket `{}`", cfg.bucket))?;
    let service = ShareService::new(metadata, objects, cfg.bucket.clone());

    // --- Expiry reaper ---
    let shutdown = CancellationToken::new();
    let reaper = ExpiryReaper::new(service.clone(), Duration::from_secs(cfg.reaper_interval_secs))
        .with_reconciliation(chrono::Duration::seconds(cfg.orphan_grace_secs));
    let mut reaper_state = reaper.subscribe();
    tokio::spawn(async move {
        while reaper_state.changed().await.is_ok() {
            tracing::debug!("expiry reaper state: {:?}", *reaper_state.borrow());
        }
    });
    spawn_manual_sweep_listener(reaper.trigger(), shutdown.clone());
    let reaper_task = tokio::spawn(reaper.run(shutdown.clone()));

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

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

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = wait_for_shutdown_signal().await {
            tracing::error!("Shutdown signal listener failed: {:#}", err);
        }
        signal_token.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    if let Err(err) = reaper_task.await {
        tracing::error!("Expiry reaper task panicked: {}", err);
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

/// SIGHUP forces an immediate expiry sweep.
#[cfg(unix)]
fn spawn_manual_sweep_listener(trigger: Arc<Notify>, shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sighup) => sighup,
        Err(err) => {
            tracing::warn!("Failed to install SIGHUP handler: {}", err);
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = sighup.recv() => match received {
                    Some(()) => {
                        tracing::info!("Received SIGHUP, requesting expiry sweep");
                        trigger.notify_one();
                    }
                    None => break,
                },
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_manual_sweep_listener(_trigger: Arc<Notify>, _shutdown: CancellationToken) {}

/// Waits for SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        tracing::info!("Received Ctrl+C");
    }

    Ok(())
}
