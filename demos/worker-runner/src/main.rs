//! Worker Runner - Demo
//!
//! A minimal standalone worker: registers with the broker, polls
//! `ClaimNext`, and for every claimed job submits the payload to a
//! [`SimulationConnector`], reports the connector's correlation id,
//! polls it for completion while publishing progress, and reports the
//! outcome back to the broker. Exists to exercise the kernel end to
//! end; no production worker would be this simple (no batching, no
//! concurrent job slots, one connector wired for one service).

use std::sync::Arc;
use std::time::Duration;

use broker::{BrokerConfig, Capabilities, EventFabric, JobBroker, ProgressEngine, Store, WorkerRegistry, WorkerStatus};
use connectors::{Connector, RemoteJobState, SimulationConnector};
use core_config::{app_info, Environment, FromEnv};
use eyre::{Result, WrapErr};
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let app_info = app_info!();
    let worker_id = format!("demo-worker-{}", Uuid::new_v4());
    info!(name = %app_info.name, %worker_id, "starting demo worker");

    let config = BrokerConfig::from_env().wrap_err("failed to load broker configuration")?;

    let client = redis::Client::open(config.store.url.clone()).wrap_err("invalid store URL")?;
    let conn = client
        .get_connection_manager()
        .await
        .wrap_err("failed to connect to store backend")?;

    let store = Store::new(conn.clone(), config.store.prefix.clone());
    let events = EventFabric::new(conn, store.keys().clone(), config.events.clone());

    let broker = JobBroker::new(store.clone(), events.clone(), config.broker.clone());
    let registry = WorkerRegistry::new(store.clone(), events.clone());
    let progress = ProgressEngine::new(store, events);

    let service = std::env::var("WORKER_SERVICE").unwrap_or_else(|_| "simulation".to_string());
    let connector: Arc<dyn Connector> = Arc::new(SimulationConnector::new(service.clone(), Duration::from_secs(3)));
    let capabilities = Capabilities::new([service.clone()], ["demo".to_string()]);

    registry.register(&worker_id, capabilities.clone()).await.wrap_err("failed to register worker")?;
    info!(%worker_id, services = ?capabilities.services, "worker registered");

    let mut shutdown = Box::pin(wait_for_signal());

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, disconnecting");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                registry.heartbeat(&worker_id, None).await.ok();

                match broker.claim_next(&worker_id, &capabilities).await {
                    Ok(Some(job)) => {
                        info!(job_id = %job.job_id, service = %job.service_required, "claimed job");
                        registry.update_status(&worker_id, WorkerStatus::Busy).await.ok();
                        if let Err(e) = run_job(&broker, &progress, &*connector, &worker_id, job.job_id, &job.payload).await {
                            warn!(job_id = %job.job_id, error = %e, "job run failed");
                        }
                        registry.update_status(&worker_id, WorkerStatus::Idle).await.ok();
                    }
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "claim_next failed"),
                }
            }
        }
    }

    registry.remove(&worker_id).await.wrap_err("failed to deregister worker")?;
    info!("demo worker stopped");
    Ok(())
}

/// Drives one job end to end: submit to the connector, poll for
/// completion while reporting progress, then complete or fail it on
/// the broker.
async fn run_job(
    broker: &JobBroker,
    progress: &ProgressEngine,
    connector: &dyn Connector,
    worker_id: &str,
    job_id: Uuid,
    payload: &serde_json::Value,
) -> Result<()> {
    let service_job_id = connector.submit(payload).await.map_err(|e| eyre::eyre!(e.to_string()))?;

    progress
        .update_progress(job_id, worker_id, 0, Some("submitted to connector"), None)
        .await?;
    broker.set_service_job_id(job_id, worker_id, &service_job_id).await?;

    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let status = connector.query_status(&service_job_id).await.map_err(|e| eyre::eyre!(e.to_string()))?;

        match status.state {
            RemoteJobState::Running => {
                progress.update_progress(job_id, worker_id, 50, Some("running"), None).await?;
            }
            RemoteJobState::Completed => {
                let result = status.result.unwrap_or_else(|| serde_json::json!({}));
                progress.complete_job(broker, job_id, worker_id, &result).await?;
                return Ok(());
            }
            RemoteJobState::Failed | RemoteJobState::NotFound => {
                let error = status.error.unwrap_or_else(|| "connector reported failure".to_string());
                progress.fail_job(job_id, worker_id, &error, true).await?;
                return Ok(());
            }
        }
    }
}

async fn wait_for_signal() {
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
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
