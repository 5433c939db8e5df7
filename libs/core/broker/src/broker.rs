//! Job Broker (C2): submission and claim orchestration over the [`Store`].

use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use crate::config::BrokerTuning;
use crate::error::{BrokerError, BrokerResult};
use crate::events::EventFabric;
use crate::model::{Capabilities, Job, SubmitJobRequest};
use crate::store::Store;

#[derive(Clone)]
pub struct JobBroker {
    store: Store,
    events: EventFabric,
    tuning: BrokerTuning,
}

impl JobBroker {
    pub fn new(store: Store, events: EventFabric, tuning: BrokerTuning) -> Self {
        Self { store, events, tuning }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// `SubmitJob(request) -> job_id` (spec.md §4.1). Creates the owning
    /// workflow on first reference, then writes the job and enqueues it,
    /// and publishes `job.submitted` on the event stream.
    pub async fn submit_job(&self, request: SubmitJobRequest) -> BrokerResult<Uuid> {
        if request.service_required.trim().is_empty() {
            return Err(BrokerError::Validation("service_required must not be empty".into()));
        }

        if let Some(workflow_id) = request.workflow_id {
            self.store
                .ensure_workflow(
                    workflow_id,
                    request.workflow_priority,
                    request.workflow_datetime,
                    request.customer_id.as_deref(),
                )
                .await?;
        }

        let service = request.service_required.clone();
        let job_id = self
            .store
            .submit_job(request, self.tuning.default_max_retries, self.tuning.default_timeout_ms)
            .await?;

        crate::metrics::record_job_submitted(&service);
        self.events
            .emit_lifecycle("broker", "job.submitted", job_id, None, serde_json::json!({ "service_required": service }))
            .await;

        Ok(job_id)
    }

    /// `ClaimNext(worker_id, capabilities) -> job | none` (spec.md §4.2).
    /// Publishes `job.assigned` on the event stream when a job is claimed.
    pub async fn claim_next(&self, worker_id: &str, capabilities: &Capabilities) -> BrokerResult<Option<Job>> {
        let started = Instant::now();
        let claimed = self
            .store
            .claim_next(worker_id, capabilities, self.tuning.claim_scan_depth)
            .await?;
        crate::metrics::record_claim_duration(started.elapsed());

        if let Some(job) = &claimed {
            crate::metrics::record_job_claimed(&job.service_required, worker_id);
            self.events
                .emit_lifecycle("broker", "job.assigned", job.job_id, Some(worker_id), serde_json::json!({}))
                .await;
        }

        Ok(claimed)
    }

    pub async fn get_job(&self, job_id: Uuid) -> BrokerResult<Option<Job>> {
        self.store.get_job(job_id).await
    }

    /// `CancelJob(job_id, reason)` (spec.md §4.1). A cancellation delivered
    /// after the job has already terminated is a no-op success; no event is
    /// emitted for that case since no state actually changed.
    pub async fn cancel_job(&self, job_id: Uuid, reason: &str) -> BrokerResult<()> {
        let job_before = self.store.get_job(job_id).await?;
        self.store.cancel_job(job_id, reason).await?;

        if let Some(job) = job_before {
            if !job.status.is_terminal() {
                crate::metrics::record_job_terminal("cancelled");
                self.events
                    .emit_lifecycle("broker", "job.cancelled", job_id, job.worker_id.as_deref(), serde_json::json!({ "reason": reason }))
                    .await;
            }
        }

        Ok(())
    }

    /// Records the connector-assigned `service_job_id` once, via
    /// [`Store::set_service_job_id`].
    pub async fn set_service_job_id(&self, job_id: Uuid, worker_id: &str, service_job_id: &str) -> BrokerResult<()> {
        self.store.set_service_job_id(job_id, worker_id, service_job_id).await
    }

    /// Returns a job to `queue:pending` unchanged, for a graceful worker
    /// disconnect (spec.md §4.4) rather than a failure.
    pub async fn release_job(&self, job_id: Uuid) -> BrokerResult<()> {
        self.store.release_job(job_id).await
    }

    /// Reinserts a job no currently connected worker can serve, clearing
    /// `last_failed_worker` so any worker (including the one that previously
    /// failed it) is eligible again.
    pub async fn requeue_unworkable(&self, job_id: Uuid) -> BrokerResult<()> {
        self.store.requeue_unworkable(job_id).await
    }

    pub fn validate_result(&self, result: &Value) -> BrokerResult<()> {
        if result.is_null() {
            return Err(BrokerError::Validation("completion result must not be null".into()));
        }
        Ok(())
    }
}
