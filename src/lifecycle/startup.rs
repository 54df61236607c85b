//! Startup orchestration.
//!
//! # Order
//! ```text
//! load config → logging → metrics → gateway → background tasks
//!     → admin listener → wait for signal → drain
//! ```
//!
//! Any startup error is fatal; the admin listener binds last so the API is
//! only reachable once the gateway is ready.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::{self, AdminState};
use crate::config::watcher::ConfigWatcher;
use crate::config::{load_config, GatewayConfig};
use crate::gateway::Gateway;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::{spawn_signal_listener, Signal};
use crate::observability::{logging, metrics};
use crate::security::store::MemoryCounterStore;

const DRAIN_GRACE: Duration = Duration::from_secs(30);
const STORE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Run the gateway until SIGINT/SIGTERM.
///
/// Without a config path the built-in defaults are used and hot reload is off.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let config = match &config_path {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    logging::init(&config.observability)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        "resilience-gateway starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let store = Arc::new(MemoryCounterStore::new());
    let gateway = Arc::new(Gateway::with_store(config.clone(), store.clone()));
    let shutdown = Shutdown::new();
    let mut tasks: Vec<JoinHandle<()>> = vec![gateway.spawn_health_monitor(&shutdown)];
    tasks.push(spawn_store_purge(store, &shutdown));

    // The watcher handle must stay alive for events to keep flowing.
    let _watcher = match &config_path {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            tasks.push(spawn_config_applier(gateway.clone(), updates, &shutdown));
            Some(watcher.run()?)
        }
        None => None,
    };

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let router = admin::setup_admin_router(
            AdminState::new(gateway.clone(), &config.admin.api_key),
            Duration::from_secs(config.admin.request_timeout_secs),
        );
        let stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, router, stop).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }));
    } else {
        tracing::info!("Admin API disabled");
    }

    let mut signals = spawn_signal_listener();
    loop {
        match signals.recv().await {
            Some(Signal::Reload) => reload(config_path.as_deref(), &gateway),
            Some(Signal::Shutdown) | None => break,
        }
    }

    tracing::info!("Shutting down");
    let aborted = shutdown.drain(tasks, DRAIN_GRACE).await;
    tracing::info!(aborted, "Shutdown complete");
    Ok(())
}

fn reload(path: Option<&Path>, gateway: &Gateway) {
    let Some(path) = path else {
        tracing::warn!("Reload requested but no config file is in use");
        return;
    };
    match load_config(path) {
        Ok(config) => gateway.apply_config(config),
        Err(e) => tracing::error!(error = %e, "Reload failed, keeping current configuration"),
    }
}

fn spawn_config_applier(
    gateway: Arc<Gateway>,
    mut updates: tokio::sync::mpsc::UnboundedReceiver<GatewayConfig>,
    shutdown: &Shutdown,
) -> JoinHandle<()> {
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(config) => gateway.apply_config(config),
                    None => break,
                },
                _ = stop.recv() => break,
            }
        }
    })
}

fn spawn_store_purge(store: Arc<MemoryCounterStore>, shutdown: &Shutdown) -> JoinHandle<()> {
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STORE_PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, remaining = store.len(), "Purged expired counters");
                    }
                }
                _ = stop.recv() => break,
            }
        }
    })
}
