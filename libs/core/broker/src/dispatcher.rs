//! Message Dispatcher (C7, spec.md §4.7): the only component that calls
//! across C1-C6. Message types are a closed, serde-tagged enum rather than
//! an open string-keyed map, so routing is an exhaustive `match` built once
//! at startup — a second handler for the same variant is a compile error,
//! not a runtime registration bug.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::JobBroker;
use crate::config::{DispatcherConfig, UnknownTypePolicy};
use crate::error::BrokerError;
use crate::model::{Capabilities, JobStatus, SubmitJobRequest, WorkerStatus};
use crate::progress::ProgressEngine;
use crate::registry::WorkerRegistry;

/// Inbound envelope. `source` identifies the sender kind (e.g. `"api"`,
/// `"worker"`); `worker_id` is only populated for worker-originated
/// messages. These are deliberately two separate fields, not one
/// overloaded identity field.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    pub id: String,
    pub timestamp: i64,
    pub source: String,
    pub worker_id: Option<Uuid>,
    #[serde(flatten)]
    pub message: InboundMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    SubmitJob(SubmitJobRequest),
    UpdateProgress {
        job_id: Uuid,
        worker_id: String,
        progress: u8,
        #[serde(default)]
        status_text: Option<String>,
        #[serde(default)]
        estimated_completion: Option<i64>,
        /// Connector correlation id, reported by the worker once it has
        /// submitted the job to the external service. Set-once: ignored on
        /// every call after the first that carries it (spec.md §3).
        #[serde(default)]
        service_job_id: Option<String>,
    },
    CompleteJob {
        job_id: Uuid,
        worker_id: String,
        result: serde_json::Value,
    },
    FailJob {
        job_id: Uuid,
        worker_id: String,
        error: String,
        #[serde(default = "default_true")]
        can_retry: bool,
    },
    CancelJob {
        job_id: Uuid,
        #[serde(default)]
        reason: Option<String>,
    },
    SyncJobState {
        job_id: Uuid,
    },
    RegisterWorker {
        worker_id: String,
        capabilities: Capabilities,
    },
    WorkerStatus {
        worker_id: String,
        status: WorkerStatus,
    },
    WorkerHeartbeat {
        worker_id: String,
        #[serde(default)]
        system_info: Option<serde_json::Value>,
    },
    ServiceRequest {
        worker_id: String,
        #[serde(flatten)]
        body: serde_json::Value,
    },
    Ack {
        ref_id: String,
    },
    Error {
        message: String,
    },
}

fn default_true() -> bool {
    true
}

/// The `type` tags `InboundMessage`'s `#[serde(tag = "type")]` recognizes,
/// kept in lockstep with its variants. Used by [`Dispatcher::dispatch_value`]
/// to tell an unrecognized type from a malformed recognized one before serde
/// ever gets a chance to reject the whole envelope.
const KNOWN_MESSAGE_TYPES: &[&str] = &[
    "submit_job",
    "update_progress",
    "complete_job",
    "fail_job",
    "cancel_job",
    "sync_job_state",
    "register_worker",
    "worker_status",
    "worker_heartbeat",
    "service_request",
    "ack",
    "error",
];

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    JobSubmitted { job_id: Uuid },
    JobState { job_id: Uuid, status: JobStatus },
    Ack { ref_id: String },
    Error { ref_id: String, message: String },
}

/// Routes validated [`InboundMessage`]s to the owning component. Holds no
/// mutable handler table: the `match` in [`Dispatcher::dispatch`] *is* the
/// routing table, fixed at compile time.
pub struct Dispatcher {
    broker: JobBroker,
    registry: WorkerRegistry,
    progress: ProgressEngine,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(broker: JobBroker, registry: WorkerRegistry, progress: ProgressEngine, config: DispatcherConfig) -> Self {
        Self { broker, registry, progress, config }
    }

    /// Entry point for untyped transport (e.g. an HTTP body): the edge
    /// hands over a raw JSON value instead of a pre-validated
    /// `InboundEnvelope`, since `serde`'s tagged-enum deserialization would
    /// otherwise reject an unrecognized `type` before this dispatcher ever
    /// saw it, bypassing `unknown_type` and `DispatcherConfig::unknown_type_policy`
    /// entirely (spec.md §4.7 "never raises"). Sniffs the `type` tag against
    /// the closed set of known message types first; only a recognized type
    /// is handed to serde for full deserialization.
    pub async fn dispatch_value(&self, value: serde_json::Value) -> OutboundMessage {
        let ref_id = value.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let type_name = value.get("type").and_then(|v| v.as_str()).map(str::to_string);

        let recognized = type_name.as_deref().is_some_and(|t| KNOWN_MESSAGE_TYPES.contains(&t));
        if !recognized {
            let type_name = type_name.unwrap_or_else(|| "<missing>".to_string());
            crate::metrics::record_message(&type_name, "unknown_type");
            return self
                .unknown_type(ref_id.clone(), &type_name)
                .unwrap_or_else(|e| OutboundMessage::Error { ref_id, message: e.to_string() });
        }

        match serde_json::from_value::<InboundEnvelope>(value) {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(e) => {
                crate::metrics::record_message(type_name.as_deref().unwrap_or("unknown"), "validation_error");
                OutboundMessage::Error { ref_id, message: format!("malformed message: {e}") }
            }
        }
    }

    pub async fn dispatch(&self, envelope: InboundEnvelope) -> OutboundMessage {
        if let Err(e) = validate(&envelope) {
            crate::metrics::record_message(message_type_label(&envelope.message), "validation_error");
            return OutboundMessage::Error { ref_id: envelope.id, message: e.to_string() };
        }

        let ref_id = envelope.id.clone();
        let message_type = message_type_label(&envelope.message);

        let result = self.handle(envelope).await;

        match result {
            Ok(outbound) => {
                crate::metrics::record_message(message_type, "ok");
                outbound
            }
            Err(e) => {
                crate::metrics::record_message(message_type, "error");
                OutboundMessage::Error { ref_id, message: e.to_string() }
            }
        }
    }

    async fn handle(&self, envelope: InboundEnvelope) -> Result<OutboundMessage, BrokerError> {
        match envelope.message {
            InboundMessage::SubmitJob(request) => {
                let job_id = self.broker.submit_job(request).await?;
                Ok(OutboundMessage::JobSubmitted { job_id })
            }
            InboundMessage::UpdateProgress { job_id, worker_id, progress, status_text, estimated_completion, service_job_id } => {
                // Ownership is checked unconditionally regardless of who claims
                // to be the sender: `worker_id` in the message body must match
                // the job's recorded owner, enforced inside the store script.
                self.progress
                    .update_progress(job_id, &worker_id, progress, status_text.as_deref(), estimated_completion)
                    .await?;
                if let Some(service_job_id) = service_job_id {
                    self.broker.set_service_job_id(job_id, &worker_id, &service_job_id).await?;
                }
                Ok(OutboundMessage::Ack { ref_id: envelope.id })
            }
            InboundMessage::CompleteJob { job_id, worker_id, result } => {
                self.progress.complete_job(&self.broker, job_id, &worker_id, &result).await?;
                Ok(OutboundMessage::JobState { job_id, status: JobStatus::Completed })
            }
            InboundMessage::FailJob { job_id, worker_id, error, can_retry } => {
                let outcome = self.progress.fail_job(job_id, &worker_id, &error, can_retry).await?;
                let status = match outcome {
                    crate::store::FailOutcome::Retried => JobStatus::Pending,
                    crate::store::FailOutcome::Failed => JobStatus::Failed,
                };
                Ok(OutboundMessage::JobState { job_id, status })
            }
            InboundMessage::CancelJob { job_id, reason } => {
                self.broker.cancel_job(job_id, reason.as_deref().unwrap_or("cancelled by request")).await?;
                Ok(OutboundMessage::JobState { job_id, status: JobStatus::Cancelled })
            }
            InboundMessage::SyncJobState { job_id } => {
                let job = self.broker.get_job(job_id).await?.ok_or_else(|| BrokerError::NotFound(job_id.to_string()))?;
                Ok(OutboundMessage::JobState { job_id, status: job.status })
            }
            InboundMessage::RegisterWorker { worker_id, capabilities } => {
                self.registry.register(&worker_id, capabilities).await?;
                Ok(OutboundMessage::Ack { ref_id: envelope.id })
            }
            InboundMessage::WorkerStatus { worker_id, status } => {
                self.registry.update_status(&worker_id, status).await?;
                Ok(OutboundMessage::Ack { ref_id: envelope.id })
            }
            InboundMessage::WorkerHeartbeat { worker_id, system_info } => {
                self.registry.heartbeat(&worker_id, system_info.as_ref()).await?;
                Ok(OutboundMessage::Ack { ref_id: envelope.id })
            }
            InboundMessage::ServiceRequest { .. } => Ok(OutboundMessage::Ack { ref_id: envelope.id }),
            InboundMessage::Ack { ref_id } => Ok(OutboundMessage::Ack { ref_id }),
            InboundMessage::Error { message } => {
                tracing::warn!(%message, "received error message from peer");
                Ok(OutboundMessage::Ack { ref_id: envelope.id })
            }
        }
    }

    /// Handles an unknown message type: logs and responds with an error,
    /// per spec.md §4.7 ("never raises"). Escalates to a hard error instead
    /// only when `DispatcherConfig::unknown_type_policy` is `Error`.
    pub fn unknown_type(&self, ref_id: String, type_name: &str) -> Result<OutboundMessage, BrokerError> {
        match self.config.unknown_type_policy {
            UnknownTypePolicy::Warn => {
                tracing::warn!(message_type = %type_name, "unknown message type");
                Ok(OutboundMessage::Error { ref_id, message: format!("unknown message type: {type_name}") })
            }
            UnknownTypePolicy::Error => Err(BrokerError::Validation(format!("unknown message type: {type_name}"))),
        }
    }
}

fn validate(envelope: &InboundEnvelope) -> Result<(), BrokerError> {
    if envelope.id.trim().is_empty() {
        return Err(BrokerError::Validation("message id must not be empty".into()));
    }
    if envelope.timestamp <= 0 {
        return Err(BrokerError::Validation("message timestamp must be positive".into()));
    }
    Ok(())
}

fn message_type_label(message: &InboundMessage) -> &'static str {
    match message {
        InboundMessage::SubmitJob(_) => "submit_job",
        InboundMessage::UpdateProgress { .. } => "update_progress",
        InboundMessage::CompleteJob { .. } => "complete_job",
        InboundMessage::FailJob { .. } => "fail_job",
        InboundMessage::CancelJob { .. } => "cancel_job",
        InboundMessage::SyncJobState { .. } => "sync_job_state",
        InboundMessage::RegisterWorker { .. } => "register_worker",
        InboundMessage::WorkerStatus { .. } => "worker_status",
        InboundMessage::WorkerHeartbeat { .. } => "worker_heartbeat",
        InboundMessage::ServiceRequest { .. } => "service_request",
        InboundMessage::Ack { .. } => "ack",
        InboundMessage::Error { .. } => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_message_id() {
        let envelope = InboundEnvelope {
            id: "".into(),
            timestamp: 1,
            source: "api".into(),
            worker_id: None,
            message: InboundMessage::Ack { ref_id: "x".into() },
        };
        assert!(validate(&envelope).is_err());
    }

    #[test]
    fn rejects_nonpositive_timestamp() {
        let envelope = InboundEnvelope {
            id: "m1".into(),
            timestamp: 0,
            source: "api".into(),
            worker_id: None,
            message: InboundMessage::Ack { ref_id: "x".into() },
        };
        assert!(validate(&envelope).is_err());
    }

    #[test]
    fn message_type_label_covers_submit_job() {
        assert_eq!(
            message_type_label(&InboundMessage::SubmitJob(SubmitJobRequest {
                service_required: "sdxl".into(),
                priority: 0,
                payload: serde_json::Value::Null,
                requirements: Default::default(),
                customer_id: None,
                max_retries: None,
                timeout_ms: None,
                workflow_id: None,
                workflow_priority: None,
                workflow_datetime: None,
                step_number: None,
            })),
            "submit_job"
        );
    }

    #[test]
    fn known_message_types_match_message_type_label() {
        let sample = InboundMessage::Ack { ref_id: "x".into() };
        assert!(KNOWN_MESSAGE_TYPES.contains(&message_type_label(&sample)));
        assert_eq!(KNOWN_MESSAGE_TYPES.len(), 12);
    }
}
