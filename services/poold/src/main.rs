//! warmpool daemon.
//!
//! Keeps a pool of pre-booted CI nodes warm across cloud providers:
//! reconciles demand against per-label targets, builds and refreshes
//! bootable image snapshots, and garbage-collects everything the fast
//! paths leave behind. All durable state lives in a local SQLite store;
//! the daemon recovers in-flight work after a restart.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warmpool_provider::{MockProvider, ProviderAdapter};

use poold::builder::{BuilderConfig, ImageBuilder};
use poold::cleanup::{Cleanup, CleanupConfig};
use poold::config::{self, Config, ConfigSnapshot};
use poold::launcher::{AdapterFactory, LauncherConfig, ProviderRegistry};
use poold::reconciler::{DemandReconciler, ReconcilerConfig};
use poold::state::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        pool_config = %config.pool_config_path.display(),
        state_path = %config.state_path.display(),
        "Starting warmpool daemon"
    );

    let store = Arc::new(
        StateStore::open(&config.state_path)
            .with_context(|| format!("opening state store at {}", config.state_path.display()))?,
    );

    // First load is fatal on error; later reloads fall back to the
    // previous snapshot.
    let snapshot = ConfigSnapshot::load(&config.pool_config_path, 1)
        .with_context(|| format!("loading pool config {}", config.pool_config_path.display()))?;
    info!(
        version = snapshot.version,
        providers = snapshot.providers.len(),
        "Pool config loaded"
    );
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(snapshot));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(ProviderRegistry::new(
        Arc::clone(&store),
        LauncherConfig::default(),
        adapter_factory(),
        shutdown_rx.clone(),
    ));

    let reload_handle = tokio::spawn({
        let path = config.pool_config_path.clone();
        let interval = config.reload_interval;
        let shutdown_rx = shutdown_rx.clone();
        async move {
            config::run_reload_loop(path, interval, snapshot_tx, shutdown_rx).await;
        }
    });

    let reconciler = DemandReconciler::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        snapshot_rx.clone(),
        ReconcilerConfig {
            tick_interval: config.reconcile_interval,
            ..Default::default()
        },
    );
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    let builder = ImageBuilder::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        snapshot_rx.clone(),
        BuilderConfig {
            tick_interval: config.builder_interval,
            ..Default::default()
        },
    );
    let builder_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            builder.run(shutdown_rx).await;
        }
    });

    let cleanup = Cleanup::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        CleanupConfig {
            tick_interval: config.cleanup_interval,
            ..Default::default()
        },
    );
    let cleanup_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            cleanup.run(shutdown_rx).await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = reconciler_handle => {
            warn!("Reconciler exited unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = builder_handle.await;
        let _ = cleanup_handle.await;
        let _ = reload_handle.await;
    })
    .await;

    info!("Warmpool daemon shutdown complete");
    Ok(())
}

/// Build provider adapters from config entries, keyed on `driver`.
fn adapter_factory() -> AdapterFactory {
    Box::new(|provider: &config::Provider| -> Result<Arc<dyn ProviderAdapter>> {
        match provider.driver.as_str() {
            "mock" => Ok(Arc::new(MockProvider::new(provider.name.clone()))),
            other => bail!("unknown provider driver: {other}"),
        }
    })
}
