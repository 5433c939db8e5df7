//! Recovery Supervisor (C5, spec.md §4.5): a `tokio::time::interval` loop
//! running three sweeps. Each sweep is isolated so one sweep's failure
//! never aborts the loop, following the teacher's worker-loop shape
//! (`StreamWorker::run`) generalized from stream polling to a fixed tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use connectors::{Connector, RemoteJobState};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{MonitorConfig, RecoveryConfig};
use crate::events::{EventFabric, MonitorRegistry};
use crate::model::{Worker, WorkerStatus};
use crate::store::{now_ms, FailOutcome, Store};

/// Deadline for a single connector `query_status` call during Sweep B, so a
/// hanging connector can't stall reconciliation of every other orphaned job.
const CONNECTOR_QUERY_DEADLINE: Duration = Duration::from_secs(5);

pub struct RecoverySupervisor {
    store: Store,
    events: EventFabric,
    monitors: Arc<MonitorRegistry>,
    connectors: HashMap<String, Arc<dyn Connector>>,
    config: RecoveryConfig,
    monitor_config: MonitorConfig,
}

impl RecoverySupervisor {
    pub fn new(
        store: Store,
        events: EventFabric,
        monitors: Arc<MonitorRegistry>,
        connectors: HashMap<String, Arc<dyn Connector>>,
        config: RecoveryConfig,
        monitor_config: MonitorConfig,
    ) -> Self {
        Self { store, events, monitors, connectors, config, monitor_config }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.config.tick_ms, "starting recovery supervisor");
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_ms));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("recovery supervisor received shutdown signal");
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Runs the three sweeps once, outside the ticking loop. Used by
    /// integration tests that need a deterministic sweep instead of
    /// waiting on `tick_ms`.
    pub async fn run_once(&self) {
        self.tick().await;
    }

    async fn tick(&self) {
        if let Err(e) = self.sweep_stale_workers().await {
            error!(error = %e, "sweep A (stale workers) failed");
        }
        if let Err(e) = self.sweep_orphaned_jobs().await {
            error!(error = %e, "sweep B (orphaned/stuck jobs) failed");
        }
        if let Err(e) = self.sweep_worker_graveyard().await {
            error!(error = %e, "sweep C (worker graveyard) failed");
        }
        if let Err(e) = self.refresh_gauges().await {
            error!(error = %e, "gauge refresh failed");
        }

        let dropped = self.monitors.drop_stale(now_ms(), self.monitor_config.heartbeat_timeout_ms);
        for monitor_id in dropped {
            warn!(%monitor_id, "dropped silent monitor");
        }
    }

    /// Sweep A: workers silent for longer than `worker_stale_ms` are marked
    /// offline; their active jobs are then handed to Sweep B's reconciliation.
    async fn sweep_stale_workers(&self) -> crate::error::BrokerResult<()> {
        crate::metrics::record_recovery_sweep("stale_workers");
        let stale = self.store.get_stale_workers(self.config.worker_stale_ms).await?;

        for worker in &stale {
            self.store.update_worker_status(&worker.worker_id, WorkerStatus::Offline).await?;
            self.events
                .emit_lifecycle("broker", "worker.offline", uuid::Uuid::nil(), Some(&worker.worker_id), serde_json::json!({}))
                .await;
        }

        if !stale.is_empty() {
            crate::metrics::record_recovery_reclaimed("stale_workers", stale.len() as u64);
        }
        Ok(())
    }

    /// Sweep B: reclaims jobs left active by a worker that is gone, timed
    /// out, or silent past `progress_silence_ms`, reconciling with the
    /// connector before counting a retry when possible.
    async fn sweep_orphaned_jobs(&self) -> crate::error::BrokerResult<()> {
        crate::metrics::record_recovery_sweep("orphaned_jobs");
        let now = now_ms();
        let active = self.store.get_active_jobs(None).await?;
        let mut reclaimed = 0u64;

        for job in active {
            if !job.status.is_active() {
                continue;
            }

            let worker_alive = match &job.worker_id {
                Some(worker_id) => match self.store.get_worker(worker_id).await? {
                    Some(w) => w.status != WorkerStatus::Offline,
                    None => false,
                },
                None => false,
            };

            let timed_out = job.started_at.map(|s| s + job.timeout_ms < now).unwrap_or(false);
            let stuck = job.updated_at + self.config.progress_silence_ms < now && worker_alive;

            if worker_alive && !timed_out && !stuck {
                continue;
            }

            let worker_id = job.worker_id.clone().unwrap_or_default();

            // Try a connector status query before counting a retry, only
            // when the job has a service_job_id and the connector supports it.
            let connector = self.connectors.get(&job.service_required);
            if let Some(service_job_id) = &job.service_job_id {
                if let Some(connector) = connector {
                    if connector.capabilities().supports_status_query {
                        match timeout(CONNECTOR_QUERY_DEADLINE, connector.query_status(service_job_id)).await {
                            Ok(Ok(status)) if status.state == RemoteJobState::Completed => {
                                self.store
                                    .complete_job(job.job_id, &worker_id, &status.result.unwrap_or(serde_json::Value::Null))
                                    .await?;
                                self.events
                                    .emit_lifecycle(
                                        "broker",
                                        "job.completed",
                                        job.job_id,
                                        Some(&worker_id),
                                        serde_json::json!({ "reconciled": true }),
                                    )
                                    .await;
                                reclaimed += 1;
                                continue;
                            }
                            // Failed/not_found: fall through to terminalization below.
                            // Unknown/transient query error: also falls through, conservatively.
                            _ => {}
                        }
                    }
                }
            }

            // Timeout is terminal, never retried (spec.md §4.4 "Per-job
            // timeout"). Orphaned/stuck jobs still go through fail_job's
            // retry accounting (spec.md §4.5 Sweep B).
            if timed_out {
                match self.store.timeout_job(job.job_id).await {
                    Ok(true) => {
                        reclaimed += 1;
                        if let (Some(service_job_id), Some(connector)) = (&job.service_job_id, connector) {
                            if connector.capabilities().supports_cancel {
                                let _ = connector.cancel(service_job_id).await;
                            }
                        }
                        self.events
                            .emit_error("broker", "job.timeout", Some(job.job_id), serde_json::json!({ "worker_id": worker_id }))
                            .await;
                    }
                    Ok(false) => {
                        // already terminal by the time we ran (e.g. it just completed)
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            let reason = if !worker_alive { "orphaned" } else { "stuck" };
            match self.store.fail_job(job.job_id, &worker_id, reason, true).await {
                Ok(FailOutcome::Retried) => {
                    reclaimed += 1;
                    self.events
                        .emit_lifecycle("broker", "job.retry", job.job_id, Some(&worker_id), serde_json::json!({ "reason": reason }))
                        .await;
                }
                Ok(FailOutcome::Failed) => {
                    reclaimed += 1;
                    self.events
                        .emit_error("broker", "job.failed", Some(job.job_id), serde_json::json!({ "worker_id": worker_id, "reason": reason }))
                        .await;
                }
                Err(crate::error::BrokerError::StaleUpdate(_)) => {
                    // job already transitioned (e.g. completed) between our read and this call
                }
                Err(e) => return Err(e),
            }
        }

        if reclaimed > 0 {
            crate::metrics::record_recovery_reclaimed("orphaned_jobs", reclaimed);
        }
        Ok(())
    }

    /// Refreshes the point-in-time gauges (`broker_active_jobs`,
    /// `broker_pending_jobs`, `broker_active_workers`) from the current
    /// queue/set sizes, since these are cheapest to sample on the same
    /// cadence as the sweeps rather than on every mutation.
    async fn refresh_gauges(&self) -> crate::error::BrokerResult<()> {
        let active = self.store.get_active_jobs(None).await?;
        let pending = self.store.get_pending_jobs(isize::MAX).await?;
        let workers = self.store.get_active_workers().await?;

        crate::metrics::set_active_jobs(active.len() as f64);
        crate::metrics::set_pending_jobs(pending.len() as f64);
        crate::metrics::set_active_workers(workers.len() as f64);
        Ok(())
    }

    /// Sweep C: workers offline for longer than `worker_gc_ms` are removed
    /// from the registry; their counters are preserved in an archive key.
    async fn sweep_worker_graveyard(&self) -> crate::error::BrokerResult<()> {
        crate::metrics::record_recovery_sweep("worker_graveyard");
        let now = now_ms();
        let mut gc_count = 0u64;

        for worker_id in self.store.get_active_workers().await? {
            let Some(worker) = self.store.get_worker(&worker_id).await? else { continue };
            if is_gc_eligible(&worker, now, self.config.worker_gc_ms) {
                self.store.archive_worker(&worker).await?;
                self.store.remove_worker(&worker_id).await?;
                gc_count += 1;
            }
        }

        if gc_count > 0 {
            crate::metrics::record_recovery_reclaimed("worker_graveyard", gc_count);
        }
        Ok(())
    }
}

fn is_gc_eligible(worker: &Worker, now: i64, worker_gc_ms: i64) -> bool {
    worker.status == WorkerStatus::Offline && now - worker.last_heartbeat_at > worker_gc_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn worker(status: WorkerStatus, last_heartbeat_at: i64) -> Worker {
        Worker {
            worker_id: "w1".into(),
            capabilities: crate::model::Capabilities::default(),
            status,
            current_jobs: BTreeSet::new(),
            connected_at: 0,
            last_heartbeat_at,
            system_info: None,
            jobs_completed: 0,
            jobs_failed: 0,
        }
    }

    #[test]
    fn gc_eligible_only_when_offline_and_past_gc_window() {
        assert!(is_gc_eligible(&worker(WorkerStatus::Offline, 0), 3_600_001, 3_600_000));
        assert!(!is_gc_eligible(&worker(WorkerStatus::Offline, 0), 3_599_999, 3_600_000));
        assert!(!is_gc_eligible(&worker(WorkerStatus::Idle, 0), 3_600_001, 3_600_000));
    }
}
