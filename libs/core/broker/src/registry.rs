//! Worker Registry (C3): connect/heartbeat/disconnect lifecycle (spec.md §4.3).

use uuid::Uuid;

use crate::error::BrokerResult;
use crate::events::EventFabric;
use crate::model::{Capabilities, Worker, WorkerStatus};
use crate::store::Store;

#[derive(Clone)]
pub struct WorkerRegistry {
    store: Store,
    events: EventFabric,
}

impl WorkerRegistry {
    pub fn new(store: Store, events: EventFabric) -> Self {
        Self { store, events }
    }

    /// `RegisterWorker(worker_id, capabilities)`. A second call for the same
    /// `worker_id` is a no-op success: it overwrites capabilities but does
    /// not reset counters or current assignments.
    pub async fn register(&self, worker_id: &str, capabilities: Capabilities) -> BrokerResult<()> {
        self.store.register_worker(worker_id, capabilities).await?;
        self.events
            .emit_lifecycle("broker", "worker.connected", Uuid::nil(), Some(worker_id), serde_json::json!({}))
            .await;
        Ok(())
    }

    pub async fn update_status(&self, worker_id: &str, status: WorkerStatus) -> BrokerResult<()> {
        self.store.update_worker_status(worker_id, status).await
    }

    pub async fn heartbeat(&self, worker_id: &str, system_info: Option<&serde_json::Value>) -> BrokerResult<()> {
        self.store.update_worker_heartbeat(worker_id, system_info).await
    }

    /// `RemoveWorker(id)` (spec.md §4.3). Releases any jobs still owned back
    /// to `queue:pending` before dropping the registry entry — but only ones
    /// that haven't already terminated by the time this runs, since a
    /// release on a terminal job is a harmless no-op the store rejects.
    pub async fn remove(&self, worker_id: &str) -> BrokerResult<()> {
        if let Some(worker) = self.store.get_worker(worker_id).await? {
            for job in self.store.get_active_jobs(Some(worker_id)).await? {
                match self.store.release_job(job.job_id).await {
                    Ok(()) | Err(crate::error::BrokerError::StaleUpdate(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            self.store.archive_worker(&worker).await?;
        }
        self.store.remove_worker(worker_id).await?;
        self.events
            .emit_lifecycle("broker", "worker.disconnected", Uuid::nil(), Some(worker_id), serde_json::json!({}))
            .await;
        Ok(())
    }

    pub async fn get(&self, worker_id: &str) -> BrokerResult<Option<Worker>> {
        self.store.get_worker(worker_id).await
    }

    pub async fn stale_workers(&self, threshold_ms: i64) -> BrokerResult<Vec<Worker>> {
        self.store.get_stale_workers(threshold_ms).await
    }
}
