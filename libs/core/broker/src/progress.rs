//! Progress and Completion Engine (C4): `UpdateProgress`/`CompleteJob`/
//! `FailJob` ownership and monotonicity rules (spec.md §4.4).

use serde_json::Value;
use uuid::Uuid;

use crate::broker::JobBroker;
use crate::error::BrokerResult;
use crate::events::EventFabric;
use crate::store::{FailOutcome, Store};

#[derive(Clone)]
pub struct ProgressEngine {
    store: Store,
    events: EventFabric,
}

impl ProgressEngine {
    pub fn new(store: Store, events: EventFabric) -> Self {
        Self { store, events }
    }

    /// `UpdateProgress(job_id, worker_id, pct, text?, eta?)`. First call for
    /// an `assigned` job transitions it to `in_progress`. Rejected (returns
    /// `StaleUpdate`) if `worker_id` isn't the current owner, the job is
    /// terminal, or the timestamp doesn't advance the stored one. Published
    /// only on the ephemeral `job:{id}:status` channel — progress never
    /// touches the persistent event stream (spec.md §4.4/§4.6).
    pub async fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress_pct: u8,
        status_text: Option<&str>,
        eta: Option<i64>,
    ) -> BrokerResult<()> {
        self.store
            .update_progress(job_id, worker_id, progress_pct, status_text, eta)
            .await?;

        self.events
            .publish_status(
                job_id,
                &serde_json::json!({
                    "job_id": job_id,
                    "worker_id": worker_id,
                    "progress": progress_pct,
                    "status_text": status_text,
                    "estimated_completion": eta,
                }),
            )
            .await;

        Ok(())
    }

    /// `CompleteJob(job_id, worker_id, result)`. Idempotent: a second call
    /// with the same `(job_id, worker_id)` after success is a no-op.
    pub async fn complete_job(&self, broker: &JobBroker, job_id: Uuid, worker_id: &str, result: &Value) -> BrokerResult<()> {
        broker.validate_result(result)?;
        self.store.complete_job(job_id, worker_id, result).await?;

        crate::metrics::record_job_terminal("completed");
        self.events
            .emit_lifecycle("broker", "job.completed", job_id, Some(worker_id), serde_json::json!({}))
            .await;
        self.events
            .publish_status(job_id, &serde_json::json!({ "job_id": job_id, "status": "completed" }))
            .await;

        Ok(())
    }

    /// `FailJob(job_id, worker_id, error, can_retry)`. Applies the retry
    /// policy: `next_retry = retry_count + 1`; terminal `failed` if
    /// `!can_retry || next_retry > max_retries`, otherwise reinserted into
    /// `queue:pending` with its original score preserved.
    pub async fn fail_job(&self, job_id: Uuid, worker_id: &str, error: &str, can_retry: bool) -> BrokerResult<FailOutcome> {
        let outcome = self.store.fail_job(job_id, worker_id, error, can_retry).await?;

        match outcome {
            FailOutcome::Retried => {
                crate::metrics::record_job_terminal("retried");
                self.events
                    .emit_lifecycle("broker", "job.retry", job_id, Some(worker_id), serde_json::json!({ "error": error }))
                    .await;
            }
            FailOutcome::Failed => {
                crate::metrics::record_job_terminal("failed");
                self.events
                    .emit_error("broker", "job.failed", Some(job_id), serde_json::json!({ "worker_id": worker_id, "error": error }))
                    .await;
                self.events
                    .publish_status(job_id, &serde_json::json!({ "job_id": job_id, "status": "failed" }))
                    .await;
            }
        }

        Ok(outcome)
    }
}
