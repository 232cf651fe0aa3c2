//! # Inventra Sync Daemon
//!
//! Runs the inventory sync engine in the background for one terminal.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Initialize tracing (RUST_LOG, default info,inventra=debug)          │
//! │  2. Load SyncConfig (file → INVENTRA_* env)                             │
//! │  3. Open SQLite, run migrations, recover interrupted deliveries         │
//! │  4. Serve the cached view, start the sync loop                          │
//! │  5. Subscribe to the change feed (if configured)                        │
//! │  6. Wait for Ctrl+C / SIGTERM, then shut down in reverse order          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Environment
//! - `INVENTRA_CONFIG` - path to `inventra.toml` (defaults to the platform
//!   config directory)
//! - `INVENTRA_REMOTE_URL`, `INVENTRA_API_KEY`, ... - see `SyncConfig`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use inventra_core::StockSummary;
use inventra_db::{Database, DbConfig};
use inventra_sync::{
    HttpBackend, InventorySync, RealtimeManager, RealtimeOptions, SyncConfig, SyncPhase,
    WsChangeFeed,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting Inventra sync daemon");

    let config_path = std::env::var_os("INVENTRA_CONFIG").map(PathBuf::from);
    let config = SyncConfig::load(config_path).context("loading sync config")?;

    let Some(remote_url) = config.remote_url() else {
        bail!("remote.base_url is not configured (set INVENTRA_REMOTE_URL)");
    };
    info!(
        device_id = %config.device_id(),
        remote = %remote_url,
        realtime = config.realtime_url().is_some(),
        "Configuration loaded"
    );

    // Database
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let db = Database::new(DbConfig::new(&db_path).cache_quota_bytes(config.cache.quota_bytes))
        .await
        .context("opening local database")?;
    info!(?db_path, "Database connected and migrations applied");

    // Engine
    let backend = HttpBackend::new(
        remote_url,
        config.remote.api_key.as_deref(),
        config.request_timeout(),
    )?;
    let engine = InventorySync::new(&db, Arc::new(backend), &config).await?;

    let view = engine.get_stock_view().await;
    let summary = StockSummary::from_records(&view.records);
    info!(
        records = summary.records,
        low = summary.low,
        out_of_stock = summary.out_of_stock,
        stale = view.stale,
        "Serving cached stock view"
    );

    let loop_handle = engine.spawn(config.sync_interval());

    // Realtime
    let subscription = match config.realtime_url() {
        Some(url) => {
            let manager = RealtimeManager::new(
                Arc::new(WsChangeFeed::new(url)?),
                Arc::new(engine.clone()),
                RealtimeOptions::from_config(&config),
            );
            Some(manager.subscribe())
        }
        None => {
            debug!("No realtime URL configured, relying on the sync interval");
            None
        }
    };

    // Report status changes until asked to stop.
    let mut status = loop_handle.watch();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = status.changed() => {
                if changed.is_err() {
                    warn!("Sync loop stopped unexpectedly");
                    break;
                }
                let s = status.borrow_and_update().clone();
                match s.phase {
                    SyncPhase::Error => warn!(
                        error = s.last_error.as_deref().unwrap_or("unknown"),
                        pending = s.pending_mutations,
                        "Sync error"
                    ),
                    phase => debug!(
                        ?phase,
                        pending = s.pending_mutations,
                        failed = s.failed_mutations,
                        conflicts = s.conflicts,
                        "Sync status"
                    ),
                }
            }
        }
    }

    // Shut down in reverse order of startup.
    if let Some(subscription) = subscription {
        if let Err(e) = subscription.unsubscribe().await {
            warn!(error = %e, "Realtime subscription did not stop cleanly");
        }
    }
    if let Err(e) = loop_handle.shutdown().await {
        warn!(error = %e, "Sync loop did not stop cleanly");
    }
    db.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// - `RUST_LOG=debug` - everything at debug
/// - `RUST_LOG=inventra_sync=trace` - one crate only
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,inventra=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown...");
}
