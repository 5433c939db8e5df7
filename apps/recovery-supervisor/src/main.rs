//! Recovery Supervisor - Entry Point
//!
//! Runs the stale-worker, orphaned-job, and worker-graveyard sweeps
//! (spec.md §4.5) as a standalone process, independent of any
//! `broker-server` replica. Deployable as a single instance per store, or
//! scaled with advisory locking left for a future iteration.

use std::collections::HashMap;
use std::sync::Arc;

use broker::{BrokerConfig, EventFabric, MonitorRegistry, RecoverySupervisor, Store};
use connectors::{Connector, SimulationConnector};
use core_config::{app_info, Environment, FromEnv};
use eyre::{Result, WrapErr};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    broker::metrics::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "starting recovery supervisor");

    let config = BrokerConfig::from_env().wrap_err("failed to load broker configuration")?;

    let client = redis::Client::open(config.store.url.clone()).wrap_err("invalid store URL")?;
    let conn = client
        .get_connection_manager()
        .await
        .wrap_err("failed to connect to store backend")?;

    let store = Store::new(conn.clone(), config.store.prefix.clone());
    let events = EventFabric::new(conn, store.keys().clone(), config.events);
    let monitors = Arc::new(MonitorRegistry::new());

    let sim_connector: Arc<dyn Connector> = Arc::new(SimulationConnector::new("simulation", std::time::Duration::from_secs(5)));
    let mut connectors: HashMap<String, Arc<dyn Connector>> = HashMap::new();
    connectors.insert("simulation".to_string(), sim_connector);

    let supervisor = RecoverySupervisor::new(store, events, monitors, connectors, config.recovery, config.monitor);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!(error = %e, "error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    supervisor.run(shutdown_rx).await;

    info!("recovery supervisor stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("received SIGTERM, initiating shutdown..."),
    }

    Ok(())
}
