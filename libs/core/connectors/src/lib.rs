//! Connector contract (spec.md §6): the worker-side adapter to an external
//! execution service (ComfyUI, OpenAI, etc). Connector internals are out of
//! scope; only the contract and a simulation implementation live here.

mod simulation;

pub use simulation::SimulationConnector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorCapabilities {
    pub services: Vec<String>,
    pub tags: Vec<String>,
    pub supports_status_query: bool,
    pub supports_cancel: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteJobState {
    Running,
    Completed,
    Failed,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub state: RemoteJobState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connector does not support status queries")]
    StatusQueryUnsupported,
    #[error("connector does not support cancellation")]
    CancelUnsupported,
    #[error("remote service error: {0}")]
    Remote(String),
}

/// Worker-side adapter to an external execution service. A worker process
/// submits a job's payload and reports progress through its own embedded
/// implementation of this trait; the Recovery Supervisor additionally holds
/// `Arc<dyn Connector>` instances directly and calls `query_status`/`cancel`
/// on them during Sweep B reconciliation (spec.md §4.5), to confirm a job's
/// true external state before counting a retry.
#[async_trait]
pub trait Connector: Send + Sync {
    fn capabilities(&self) -> ConnectorCapabilities;

    async fn submit(&self, payload: &serde_json::Value) -> Result<String, ConnectorError>;

    /// Mandatory if `capabilities().supports_status_query` is true. Recovery
    /// refuses to reconcile jobs whose connector lacks this (spec.md §4.5).
    async fn query_status(&self, service_job_id: &str) -> Result<RemoteStatus, ConnectorError>;

    /// Best-effort; a connector may not be able to guarantee remote work stops.
    async fn cancel(&self, service_job_id: &str) -> Result<(), ConnectorError>;
}
