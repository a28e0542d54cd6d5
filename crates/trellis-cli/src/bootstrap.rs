//! The composition root.
//!
//! This is the only place where infrastructure is wired together: the
//! broadcast event bus, the service supervisor, and the proxy listener set
//! are built from the loaded configuration, started together, and torn
//! down on the first shutdown signal.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};

use trellis_proxy::ProxyManager;
use trellis_runtime::bus::BroadcastEventBus;
use trellis_runtime::supervisor::ServiceSupervisor;

use crate::config_file;

/// Load the configuration, run supervisor and proxy until a shutdown
/// signal arrives, then drain both.
pub async fn run(config_path: &Path) -> Result<()> {
    let config = config_file::load(config_path)?;
    info!(
        services = config.services.len(),
        proxies = config.proxies.len(),
        "configuration loaded"
    );

    let bus = Arc::new(BroadcastEventBus::new());
    spawn_event_logger(&bus);

    let supervisor = ServiceSupervisor::new(config.services, bus);
    let mut proxy = ProxyManager::build(&config.proxies, None)
        .await
        .context("building proxy listeners")?;

    // Both halves come up together; a service that fails to spawn is
    // reported but does not keep the rest of the workstation down.
    proxy.start();
    if let Err(e) = supervisor.start_all().await {
        error!(error = %e, "some services failed to start");
    }
    for addr in proxy.addresses().await {
        info!(%addr, "proxy listening");
    }

    wait_for_shutdown().await;
    info!("shutting down");

    if let Err(e) = proxy.shutdown().await {
        error!(error = %e, "proxy shutdown failed");
    }
    if let Err(e) = supervisor.stop_all().await {
        error!(error = %e, "stopping services failed");
    }
    Ok(())
}

/// Mirror lifecycle events into the log so `trellis run` output tells the
/// whole story without a separate consumer.
fn spawn_event_logger(bus: &Arc<BroadcastEventBus>) {
    use tokio::sync::broadcast::error::RecvError;

    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        info!(event = %json, "lifecycle");
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    info!(missed, "event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
