//! State Store (C1): the only component allowed to touch the underlying
//! Redis instance. Every multi-key mutation is a server-side atomic script,
//! loaded once at construction and invoked by key/arg, mirroring the
//! `RedisScript`/`include_str!` idiom used for Redis-side atomicity
//! elsewhere in this workspace's job-queue tooling.

use std::collections::BTreeSet;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult};
use crate::keys::StoreKeys;
use crate::model::{Capabilities, Job, JobStatus, SubmitJobRequest, Worker, WorkerStatus, Workflow, WorkflowStatus};
use crate::scoring::{job_score, ScoreInput};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

struct Scripts {
    submit_job: Script,
    claim_next: Script,
    complete_job: Script,
    fail_job: Script,
    release_job: Script,
    requeue_unworkable: Script,
    cancel_job: Script,
    update_progress: Script,
    set_service_job_id: Script,
    timeout_job: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            submit_job: Script::new(include_str!("scripts/submit_job.lua")),
            claim_next: Script::new(include_str!("scripts/claim_next.lua")),
            complete_job: Script::new(include_str!("scripts/complete_job.lua")),
            fail_job: Script::new(include_str!("scripts/fail_job.lua")),
            release_job: Script::new(include_str!("scripts/release_job.lua")),
            requeue_unworkable: Script::new(include_str!("scripts/requeue_unworkable.lua")),
            cancel_job: Script::new(include_str!("scripts/cancel_job.lua")),
            update_progress: Script::new(include_str!("scripts/update_progress.lua")),
            set_service_job_id: Script::new(include_str!("scripts/set_service_job_id.lua")),
            timeout_job: Script::new(include_str!("scripts/timeout_job.lua")),
        }
    }
}

/// Outcome of [`Store::fail_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retried,
    Failed,
}

/// Typed wrapper over Redis exposing the atomic primitives from spec.md
/// §4.1. Cloning is cheap: `ConnectionManager` is an `Arc`-backed handle,
/// following the same "clone per call" convention the rest of this
/// workspace uses for Redis connections.
#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
    keys: StoreKeys,
    scripts: std::sync::Arc<Scripts>,
}

impl Store {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            keys: StoreKeys::new(prefix),
            scripts: std::sync::Arc::new(Scripts::load()),
        }
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    pub fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// `SubmitJob(request) -> job_id`. Writes the job record and pushes it
    /// onto `Q_pending` atomically.
    pub async fn submit_job(
        &self,
        request: SubmitJobRequest,
        default_max_retries: u32,
        default_timeout_ms: i64,
    ) -> BrokerResult<Uuid> {
        let job_id = Uuid::now_v7();
        let now = now_ms();

        let job = Job {
            job_id,
            service_required: request.service_required,
            priority: request.priority,
            payload: request.payload,
            requirements: request.requirements,
            customer_id: request.customer_id,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            retry_count: 0,
            timeout_ms: request.timeout_ms.unwrap_or(default_timeout_ms),
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            workflow_id: request.workflow_id,
            workflow_priority: request.workflow_priority,
            workflow_datetime: request.workflow_datetime,
            step_number: request.step_number,
            status: JobStatus::Pending,
            worker_id: None,
            service_job_id: None,
            last_error: None,
            last_failed_worker: None,
            progress: None,
            status_text: None,
            estimated_completion: None,
            result: None,
        };

        let score = job_score(ScoreInput {
            priority: job.priority,
            workflow_priority: job.workflow_priority,
            workflow_datetime: job.workflow_datetime,
            created_at: job.created_at,
        });

        let fields = job_to_fields(&job)?;
        let mut flat: Vec<String> = Vec::with_capacity(fields.len() * 2 + 1);
        flat.push(job_id.to_string());
        for (k, v) in fields {
            flat.push(k);
            flat.push(v);
        }

        let mut conn = self.conn.clone();
        let _: redis::Value = self
            .scripts
            .submit_job
            .key(self.keys.job(job_id))
            .key(self.keys.queue_pending())
            .arg(score)
            .arg(flat)
            .invoke_async(&mut conn)
            .await?;

        Ok(job_id)
    }

    /// `ClaimNext(worker_id, capabilities) -> job | none` (spec.md §4.2).
    pub async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &Capabilities,
        scan_depth: usize,
    ) -> BrokerResult<Option<Job>> {
        let services_json = serde_json::to_string(&capabilities.services)?;
        let tags_json = serde_json::to_string(&capabilities.tags)?;

        let mut conn = self.conn.clone();
        let result: redis::Value = self
            .scripts
            .claim_next
            .key(self.keys.queue_pending())
            .key(self.keys.set_active())
            .arg(worker_id)
            .arg(now_ms())
            .arg(scan_depth as i64)
            .arg(services_json)
            .arg(tags_json)
            .arg(self.keys.prefix())
            .invoke_async(&mut conn)
            .await?;

        match result {
            redis::Value::Nil => Ok(None),
            redis::Value::BulkString(bytes) => {
                let job_id_str = String::from_utf8_lossy(&bytes).to_string();
                let job_id = Uuid::parse_str(&job_id_str)
                    .map_err(|e| BrokerError::Internal(format!("bad job id from claim script: {e}")))?;
                self.get_job(job_id).await?.ok_or_else(|| {
                    BrokerError::Internal(format!("claimed job {job_id} vanished before read-back"))
                }).map(Some)
            }
            other => Err(BrokerError::Internal(format!(
                "unexpected claim_next reply: {other:?}"
            ))),
        }
    }

    pub async fn get_job(&self, job_id: Uuid) -> BrokerResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(self.keys.job(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(job_from_fields(job_id, fields)?))
    }

    pub async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: &serde_json::Value,
    ) -> BrokerResult<()> {
        let result_json = serde_json::to_string(result)?;
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .complete_job
            .key(self.keys.job(job_id))
            .key(self.keys.set_active())
            .key(self.keys.set_completed())
            .key(self.keys.worker(worker_id))
            .arg(worker_id)
            .arg(now_ms())
            .arg(result_json)
            .arg(self.keys.prefix())
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "completed" => Ok(()),
            "stale" => Err(BrokerError::StaleUpdate(format!(
                "job {job_id} not owned by {worker_id} or already terminal"
            ))),
            "not_found" => Err(BrokerError::NotFound(format!("job {job_id}"))),
            other => Err(BrokerError::Internal(format!("unexpected complete_job outcome: {other}"))),
        }
    }

    pub async fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        can_retry: bool,
    ) -> BrokerResult<FailOutcome> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("job {job_id}")))?;

        let score = job_score(ScoreInput {
            priority: job.priority,
            workflow_priority: job.workflow_priority,
            workflow_datetime: job.workflow_datetime,
            created_at: job.created_at,
        });

        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .fail_job
            .key(self.keys.job(job_id))
            .key(self.keys.set_active())
            .key(self.keys.set_failed())
            .key(self.keys.queue_pending())
            .key(self.keys.worker(worker_id))
            .arg(worker_id)
            .arg(now_ms())
            .arg(error)
            .arg(if can_retry { "1" } else { "0" })
            .arg(self.keys.prefix())
            .arg(job_id.to_string())
            .arg(score)
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "retried" => Ok(FailOutcome::Retried),
            "failed" => Ok(FailOutcome::Failed),
            "stale" => Err(BrokerError::StaleUpdate(format!(
                "job {job_id} not owned by {worker_id} or already terminal"
            ))),
            "not_found" => Err(BrokerError::NotFound(format!("job {job_id}"))),
            other => Err(BrokerError::Internal(format!("unexpected fail_job outcome: {other}"))),
        }
    }

    pub async fn release_job(&self, job_id: Uuid) -> BrokerResult<()> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("job {job_id}")))?;

        let score = job_score(ScoreInput {
            priority: job.priority,
            workflow_priority: job.workflow_priority,
            workflow_datetime: job.workflow_datetime,
            created_at: job.created_at,
        });

        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .release_job
            .key(self.keys.job(job_id))
            .key(self.keys.set_active())
            .key(self.keys.queue_pending())
            .arg(now_ms())
            .arg(self.keys.prefix())
            .arg(job_id.to_string())
            .arg(score)
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "released" => Ok(()),
            "terminal" => Err(BrokerError::StaleUpdate(format!("job {job_id} already terminal"))),
            "not_found" => Err(BrokerError::NotFound(format!("job {job_id}"))),
            other => Err(BrokerError::Internal(format!("unexpected release_job outcome: {other}"))),
        }
    }

    /// Terminalizes a job that exceeded `timeout_ms` directly to `timeout`
    /// (spec.md §4.4), without touching `retry_count` — a timeout is not a
    /// retryable failure. Returns `false` if the job had already reached a
    /// terminal state by the time this ran (a harmless race with the job's
    /// own completion/failure).
    pub async fn timeout_job(&self, job_id: Uuid) -> BrokerResult<bool> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .timeout_job
            .key(self.keys.job(job_id))
            .key(self.keys.set_active())
            .key(self.keys.set_failed())
            .arg(now_ms())
            .arg(self.keys.prefix())
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "timeout" => Ok(true),
            "already_terminal" => Ok(false),
            "not_found" => Err(BrokerError::NotFound(format!("job {job_id}"))),
            other => Err(BrokerError::Internal(format!("unexpected timeout_job outcome: {other}"))),
        }
    }

    pub async fn requeue_unworkable(&self, job_id: Uuid) -> BrokerResult<()> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("job {job_id}")))?;

        let score = job_score(ScoreInput {
            priority: job.priority,
            workflow_priority: job.workflow_priority,
            workflow_datetime: job.workflow_datetime,
            created_at: job.created_at,
        });

        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .requeue_unworkable
            .key(self.keys.job(job_id))
            .key(self.keys.queue_pending())
            .arg(now_ms())
            .arg(job_id.to_string())
            .arg(score)
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "requeued" => Ok(()),
            "not_found" => Err(BrokerError::NotFound(format!("job {job_id}"))),
            other => Err(BrokerError::Internal(format!("unexpected requeue_unworkable outcome: {other}"))),
        }
    }

    pub async fn cancel_job(&self, job_id: Uuid, reason: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .cancel_job
            .key(self.keys.job(job_id))
            .key(self.keys.queue_pending())
            .key(self.keys.set_active())
            .key(self.keys.set_cancelled())
            .arg(now_ms())
            .arg(reason)
            .arg(self.keys.prefix())
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            // A cancellation request delivered after a job has terminated
            // is a no-op success (spec.md §5).
            "cancelled" | "already_terminal" => Ok(()),
            "not_found" => Err(BrokerError::NotFound(format!("job {job_id}"))),
            other => Err(BrokerError::Internal(format!("unexpected cancel_job outcome: {other}"))),
        }
    }

    pub async fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress_pct: u8,
        status_text: Option<&str>,
        eta: Option<i64>,
    ) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .update_progress
            .key(self.keys.job(job_id))
            .arg(worker_id)
            .arg(now_ms())
            .arg(progress_pct)
            .arg(status_text.unwrap_or(""))
            .arg(eta.map(|e| e.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "updated" => Ok(()),
            "stale" => Err(BrokerError::StaleUpdate(format!(
                "job {job_id} not owned by {worker_id} or already terminal"
            ))),
            "not_found" => Err(BrokerError::NotFound(format!("job {job_id}"))),
            other => Err(BrokerError::Internal(format!("unexpected update_progress outcome: {other}"))),
        }
    }

    /// Records the connector-assigned external correlation id on a job's
    /// owner path, once. A no-op if already set (spec.md §3 invariant).
    pub async fn set_service_job_id(&self, job_id: Uuid, worker_id: &str, service_job_id: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .set_service_job_id
            .key(self.keys.job(job_id))
            .arg(worker_id)
            .arg(now_ms())
            .arg(service_job_id)
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "set" | "unchanged" => Ok(()),
            "stale" => Err(BrokerError::StaleUpdate(format!(
                "job {job_id} not owned by {worker_id} or already terminal"
            ))),
            "not_found" => Err(BrokerError::NotFound(format!("job {job_id}"))),
            other => Err(BrokerError::Internal(format!("unexpected set_service_job_id outcome: {other}"))),
        }
    }

    // -- Worker registry --------------------------------------------------

    /// Idempotent upsert: a worker reconnecting with the same `worker_id`
    /// keeps its accumulated counters and `connected_at`, only its
    /// capabilities and heartbeat move. A genuinely new worker is seeded
    /// fresh. Either way the worker is left `idle` and in `workers:active`.
    pub async fn register_worker(&self, worker_id: &str, capabilities: Capabilities) -> BrokerResult<()> {
        let now = now_ms();
        let existing = self.get_worker(worker_id).await?;

        let worker = match existing {
            Some(mut w) => {
                w.capabilities = capabilities;
                w.status = WorkerStatus::Idle;
                w.last_heartbeat_at = now;
                w
            }
            None => Worker {
                worker_id: worker_id.to_string(),
                capabilities,
                status: WorkerStatus::Idle,
                current_jobs: BTreeSet::new(),
                connected_at: now,
                last_heartbeat_at: now,
                system_info: None,
                jobs_completed: 0,
                jobs_failed: 0,
            },
        };

        let mut conn = self.conn.clone();
        let fields = worker_to_fields(&worker)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        {
            let mut cmd = pipe.cmd("HSET").arg(self.keys.worker(worker_id));
            for (k, v) in &fields {
                cmd = cmd.arg(k).arg(v);
            }
        }
        pipe.sadd(self.keys.workers_active(), worker_id);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn update_worker_status(&self, worker_id: &str, status: WorkerStatus) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(self.keys.worker(worker_id), "status", status.to_string())
            .await?;
        Ok(())
    }

    pub async fn update_worker_heartbeat(
        &self,
        worker_id: &str,
        system_info: Option<&serde_json::Value>,
    ) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(self.keys.worker(worker_id), "last_heartbeat_at", now);
        if let Some(info) = system_info {
            pipe.hset(self.keys.worker(worker_id), "system_info", serde_json::to_string(info)?);
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn remove_worker(&self, worker_id: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.srem(self.keys.workers_active(), worker_id);
        pipe.del(self.keys.worker(worker_id));
        pipe.del(self.keys.worker_jobs(worker_id));
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn get_worker(&self, worker_id: &str) -> BrokerResult<Option<Worker>> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(self.keys.worker(worker_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(worker_from_fields(worker_id, fields)?))
    }

    pub async fn get_active_workers(&self) -> BrokerResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.keys.workers_active()).await?;
        Ok(ids)
    }

    pub async fn get_stale_workers(&self, threshold_ms: i64) -> BrokerResult<Vec<Worker>> {
        let now = now_ms();
        let mut stale = Vec::new();
        for worker_id in self.get_active_workers().await? {
            if let Some(worker) = self.get_worker(&worker_id).await? {
                if now - worker.last_heartbeat_at > threshold_ms {
                    stale.push(worker);
                }
            }
        }
        Ok(stale)
    }

    pub async fn archive_worker(&self, worker: &Worker) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                self.keys.worker_archive(&worker.worker_id),
                &[
                    ("jobs_completed", worker.jobs_completed.to_string()),
                    ("jobs_failed", worker.jobs_failed.to_string()),
                    ("connected_at", worker.connected_at.to_string()),
                    ("archived_at", now_ms().to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    // -- Scans --------------------------------------------------------------

    pub async fn get_pending_jobs(&self, limit: isize) -> BrokerResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrange(self.keys.queue_pending(), 0, limit.saturating_sub(1))
            .await?;
        self.load_jobs(ids).await
    }

    pub async fn get_active_jobs(&self, worker_id: Option<&str>) -> BrokerResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.keys.set_active()).await?;
        let jobs = self.load_jobs(ids).await?;
        Ok(match worker_id {
            Some(w) => jobs
                .into_iter()
                .filter(|j| j.worker_id.as_deref() == Some(w))
                .collect(),
            None => jobs,
        })
    }

    pub async fn get_jobs_by_status(&self, statuses: &[JobStatus]) -> BrokerResult<Vec<Job>> {
        let set_key = |s: JobStatus| match s {
            JobStatus::Completed => Some(self.keys.set_completed()),
            JobStatus::Failed | JobStatus::Timeout => Some(self.keys.set_failed()),
            JobStatus::Cancelled => Some(self.keys.set_cancelled()),
            _ => None,
        };

        let mut conn = self.conn.clone();
        let mut all_ids = Vec::new();
        for status in statuses {
            if let Some(key) = set_key(*status) {
                let ids: Vec<String> = conn.smembers(key).await?;
                all_ids.extend(ids);
            }
        }
        all_ids.sort();
        all_ids.dedup();
        let jobs = self.load_jobs(all_ids).await?;
        Ok(jobs.into_iter().filter(|j| statuses.contains(&j.status)).collect())
    }

    async fn load_jobs(&self, ids: Vec<String>) -> BrokerResult<Vec<Job>> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(uuid) = Uuid::parse_str(&id) {
                if let Some(job) = self.get_job(uuid).await? {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    // -- Workflow -------------------------------------------------------------

    pub async fn ensure_workflow(
        &self,
        workflow_id: Uuid,
        workflow_priority: Option<i32>,
        workflow_datetime: Option<i64>,
        customer_id: Option<&str>,
    ) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.workflow(workflow_id);
        let exists: bool = conn.exists(&key).await?;
        if exists {
            return Ok(());
        }

        let workflow = Workflow {
            workflow_id,
            workflow_priority: workflow_priority.unwrap_or(0),
            workflow_datetime: workflow_datetime.unwrap_or_else(now_ms),
            status: WorkflowStatus::Active,
            customer_id: customer_id.map(str::to_string),
        };

        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("workflow_priority", workflow.workflow_priority.to_string()),
                    ("workflow_datetime", workflow.workflow_datetime.to_string()),
                    ("status", workflow.status.to_string()),
                    ("customer_id", workflow.customer_id.clone().unwrap_or_default()),
                ],
            )
            .await?;
        Ok(())
    }
}

fn job_to_fields(job: &Job) -> BrokerResult<Vec<(String, String)>> {
    let mut fields = vec![
        ("service_required".into(), job.service_required.clone()),
        ("priority".into(), job.priority.to_string()),
        ("payload".into(), serde_json::to_string(&job.payload)?),
        ("requirements".into(), serde_json::to_string(&job.requirements)?),
        ("max_retries".into(), job.max_retries.to_string()),
        ("retry_count".into(), job.retry_count.to_string()),
        ("timeout_ms".into(), job.timeout_ms.to_string()),
        ("created_at".into(), job.created_at.to_string()),
        ("updated_at".into(), job.updated_at.to_string()),
        ("status".into(), job.status.to_string()),
    ];
    if let Some(v) = &job.customer_id {
        fields.push(("customer_id".into(), v.clone()));
    }
    if let Some(v) = job.workflow_id {
        fields.push(("workflow_id".into(), v.to_string()));
    }
    if let Some(v) = job.workflow_priority {
        fields.push(("workflow_priority".into(), v.to_string()));
    }
    if let Some(v) = job.workflow_datetime {
        fields.push(("workflow_datetime".into(), v.to_string()));
    }
    if let Some(v) = job.step_number {
        fields.push(("step_number".into(), v.to_string()));
    }
    Ok(fields)
}

fn job_from_fields(job_id: Uuid, mut fields: std::collections::HashMap<String, String>) -> BrokerResult<Job> {
    let mut take = |key: &str| fields.remove(key);
    let status: JobStatus = take("status")
        .ok_or_else(|| BrokerError::Internal(format!("job {job_id} missing status field")))?
        .parse()
        .map_err(|_| BrokerError::Internal(format!("job {job_id} has unparseable status")))?;

    Ok(Job {
        job_id,
        service_required: take("service_required").unwrap_or_default(),
        priority: take("priority").and_then(|v| v.parse().ok()).unwrap_or(0),
        payload: take("payload")
            .map(|v| serde_json::from_str(&v))
            .transpose()?
            .unwrap_or(serde_json::Value::Null),
        requirements: take("requirements")
            .map(|v| serde_json::from_str(&v))
            .transpose()?
            .unwrap_or_default(),
        customer_id: take("customer_id").filter(|v| !v.is_empty()),
        max_retries: take("max_retries").and_then(|v| v.parse().ok()).unwrap_or(3),
        retry_count: take("retry_count").and_then(|v| v.parse().ok()).unwrap_or(0),
        timeout_ms: take("timeout_ms").and_then(|v| v.parse().ok()).unwrap_or(300_000),
        created_at: take("created_at").and_then(|v| v.parse().ok()).unwrap_or(0),
        started_at: take("started_at").and_then(|v| v.parse().ok()),
        updated_at: take("updated_at").and_then(|v| v.parse().ok()).unwrap_or(0),
        completed_at: take("completed_at").and_then(|v| v.parse().ok()),
        workflow_id: take("workflow_id").and_then(|v| Uuid::parse_str(&v).ok()),
        workflow_priority: take("workflow_priority").and_then(|v| v.parse().ok()),
        workflow_datetime: take("workflow_datetime").and_then(|v| v.parse().ok()),
        step_number: take("step_number").and_then(|v| v.parse().ok()),
        status,
        worker_id: take("worker_id").filter(|v| !v.is_empty()),
        service_job_id: take("service_job_id").filter(|v| !v.is_empty()),
        last_error: take("last_error").filter(|v| !v.is_empty()),
        last_failed_worker: take("last_failed_worker").filter(|v| !v.is_empty()),
        progress: take("progress").and_then(|v| v.parse().ok()),
        status_text: take("status_text").filter(|v| !v.is_empty()),
        estimated_completion: take("estimated_completion").and_then(|v| v.parse().ok()),
        result: take("result").map(|v| serde_json::from_str(&v)).transpose()?,
    })
}

fn worker_to_fields(worker: &Worker) -> BrokerResult<Vec<(String, String)>> {
    Ok(vec![
        ("capabilities".into(), serde_json::to_string(&worker.capabilities)?),
        ("status".into(), worker.status.to_string()),
        ("connected_at".into(), worker.connected_at.to_string()),
        ("last_heartbeat_at".into(), worker.last_heartbeat_at.to_string()),
        ("jobs_completed".into(), worker.jobs_completed.to_string()),
        ("jobs_failed".into(), worker.jobs_failed.to_string()),
    ])
}

fn worker_from_fields(
    worker_id: &str,
    mut fields: std::collections::HashMap<String, String>,
) -> BrokerResult<Worker> {
    let mut take = |key: &str| fields.remove(key);
    let status: WorkerStatus = take("status")
        .ok_or_else(|| BrokerError::Internal(format!("worker {worker_id} missing status field")))?
        .parse()
        .map_err(|_| BrokerError::Internal(format!("worker {worker_id} has unparseable status")))?;
    let capabilities: Capabilities = take("capabilities")
        .map(|v| serde_json::from_str(&v))
        .transpose()?
        .unwrap_or_default();

    Ok(Worker {
        worker_id: worker_id.to_string(),
        capabilities,
        status,
        current_jobs: BTreeSet::new(),
        connected_at: take("connected_at").and_then(|v| v.parse().ok()).unwrap_or(0),
        last_heartbeat_at: take("last_heartbeat_at").and_then(|v| v.parse().ok()).unwrap_or(0),
        system_info: take("system_info").map(|v| serde_json::from_str(&v)).transpose()?,
        jobs_completed: take("jobs_completed").and_then(|v| v.parse().ok()).unwrap_or(0),
        jobs_failed: take("jobs_failed").and_then(|v| v.parse().ok()).unwrap_or(0),
    })
}
