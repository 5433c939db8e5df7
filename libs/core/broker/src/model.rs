//! Core entities: Job, Workflow, Worker, and the enums that drive the
//! lifecycle state machine.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// `pending -> queued -> assigned -> in_progress -> {completed | failed | cancelled | timeout}`
///
/// `queued` and `pending` are treated as the same observable state in this
/// port: a job is `pending` from the moment it's written until claimed.
/// `Queued` is kept as a distinct variant only because the wire protocol and
/// monitor UIs reference it; the store never emits it as a stable resting
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Completed,
    Failed,
}

/// A unit of work submitted by a client, executed by exactly one worker at a
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub service_required: String,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub requirements: BTreeSet<String>,
    pub customer_id: Option<String>,
    pub max_retries: u32,
    pub retry_count: u32,
    pub timeout_ms: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub workflow_id: Option<Uuid>,
    pub workflow_priority: Option<i32>,
    pub workflow_datetime: Option<i64>,
    pub step_number: Option<u32>,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub service_job_id: Option<String>,
    pub last_error: Option<String>,
    pub last_failed_worker: Option<String>,
    pub progress: Option<u8>,
    pub status_text: Option<String>,
    pub estimated_completion: Option<i64>,
    pub result: Option<serde_json::Value>,
}

/// Request payload for [`crate::broker::JobBroker::submit_job`].
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJobRequest {
    pub service_required: String,
    #[serde(default)]
    pub priority: i32,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub requirements: BTreeSet<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub workflow_priority: Option<i32>,
    #[serde(default)]
    pub workflow_datetime: Option<i64>,
    #[serde(default)]
    pub step_number: Option<u32>,
}

/// Optional grouping of jobs sharing a priority and submission timestamp,
/// used to age-bias scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: Uuid,
    pub workflow_priority: i32,
    pub workflow_datetime: i64,
    pub status: WorkflowStatus,
    pub customer_id: Option<String>,
}

/// A process that advertises capabilities, claims jobs, and reports
/// progress/completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub capabilities: Capabilities,
    pub status: WorkerStatus,
    pub current_jobs: BTreeSet<Uuid>,
    pub connected_at: i64,
    pub last_heartbeat_at: i64,
    pub system_info: Option<serde_json::Value>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

/// Capability advertisement: service tags plus resource tags (e.g.
/// `{comfyui, gpu, sdxl}`). Opaque to the broker beyond set membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub services: BTreeSet<String>,
    pub tags: BTreeSet<String>,
}

impl Capabilities {
    pub fn new(services: impl IntoIterator<Item = String>, tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            services: services.into_iter().collect(),
            tags: tags.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_terminal_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Assigned.is_terminal());
    }

    #[test]
    fn job_status_active_classification() {
        assert!(JobStatus::Assigned.is_active());
        assert!(JobStatus::InProgress.is_active());
        assert!(!JobStatus::Pending.is_active());
        assert!(!JobStatus::Completed.is_active());
    }

    #[test]
    fn job_status_round_trips_through_display_and_from_str() {
        use std::str::FromStr;
        assert_eq!(JobStatus::InProgress.to_string(), "in_progress");
        assert_eq!(JobStatus::from_str("in_progress").unwrap(), JobStatus::InProgress);
    }
}
