//! Expiry Cache Sweeper
//!
//! Keeps a durable cache directory tidy: recovers its size, prunes it if it
//! is over capacity, then sweeps expired entries until shut down.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use expiry_cache::{spawn_sweep_task, Cache, Config, DurableStore};

/// Main entry point for the sweeper.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Open the durable store and recover its size
/// 4. Run an initial prune
/// 5. Start the periodic expiry sweep
/// 6. Flush and stop on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "expiry_cache=info,expiry_cache_sweeper=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(
        path = %config.store.storage_path.display(),
        max_size_bytes = config.store.max_size_bytes,
        namespace = %config.store.namespace,
        sweep_interval = config.sweep_interval,
        "Configuration loaded"
    );

    let store = Arc::new(DurableStore::open(config.store.clone()));
    if let Some(reason) = store.open_error() {
        bail!("cannot open cache at {}: {}", config.store.storage_path.display(), reason);
    }
    info!(size_bytes = store.size_in_bytes(), "Durable cache ready");

    let report = store.prune().await.context("initial prune failed")?;
    info!(
        expired = report.expired,
        evicted = report.evicted,
        size_bytes = report.size_after,
        "Initial prune complete"
    );

    let cache: Arc<dyn Cache> = store.clone();
    let sweep_handle = spawn_sweep_task(cache, config.sweep_interval);

    shutdown_signal().await;

    sweep_handle.abort();
    warn!("Sweep task aborted");

    store.flush().await.context("flushing cache on shutdown")?;
    info!(size_bytes = store.size_in_bytes(), "Sweeper shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
