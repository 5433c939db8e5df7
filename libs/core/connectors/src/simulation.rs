//! In-memory connector for tests and demos: "submits" a job and reports it
//! complete after a configurable delay, with no external calls.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{Connector, ConnectorCapabilities, ConnectorError, RemoteJobState, RemoteStatus};

struct SimJob {
    finishes_at: Instant,
    result: serde_json::Value,
    cancelled: bool,
}

/// Simulates a remote execution service: jobs "complete" after
/// `processing_time` has elapsed since submission.
pub struct SimulationConnector {
    service: String,
    processing_time: Duration,
    jobs: Mutex<HashMap<String, SimJob>>,
}

impl SimulationConnector {
    pub fn new(service: impl Into<String>, processing_time: Duration) -> Self {
        Self {
            service: service.into(),
            processing_time,
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Connector for SimulationConnector {
    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            services: vec![self.service.clone()],
            tags: vec!["simulation".to_string()],
            supports_status_query: true,
            supports_cancel: true,
        }
    }

    async fn submit(&self, payload: &serde_json::Value) -> Result<String, ConnectorError> {
        let service_job_id = Uuid::new_v4().to_string();
        let mut jobs = self.jobs.lock().expect("simulation connector lock poisoned");
        jobs.insert(
            service_job_id.clone(),
            SimJob {
                finishes_at: Instant::now() + self.processing_time,
                result: serde_json::json!({ "echo": payload }),
                cancelled: false,
            },
        );
        Ok(service_job_id)
    }

    async fn query_status(&self, service_job_id: &str) -> Result<RemoteStatus, ConnectorError> {
        let jobs = self.jobs.lock().expect("simulation connector lock poisoned");
        let Some(job) = jobs.get(service_job_id) else {
            return Ok(RemoteStatus {
                state: RemoteJobState::NotFound,
                result: None,
                error: None,
            });
        };

        if job.cancelled {
            return Ok(RemoteStatus {
                state: RemoteJobState::Failed,
                result: None,
                error: Some("cancelled".to_string()),
            });
        }

        if Instant::now() >= job.finishes_at {
            Ok(RemoteStatus {
                state: RemoteJobState::Completed,
                result: Some(job.result.clone()),
                error: None,
            })
        } else {
            Ok(RemoteStatus {
                state: RemoteJobState::Running,
                result: None,
                error: None,
            })
        }
    }

    async fn cancel(&self, service_job_id: &str) -> Result<(), ConnectorError> {
        let mut jobs = self.jobs.lock().expect("simulation connector lock poisoned");
        if let Some(job) = jobs.get_mut(service_job_id) {
            job.cancelled = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_running_then_completed() {
        let connector = SimulationConnector::new("sdxl", Duration::from_millis(30));
        let id = connector.submit(&serde_json::json!({"prompt": "a cat"})).await.unwrap();

        let status = connector.query_status(&id).await.unwrap();
        assert_eq!(status.state, RemoteJobState::Running);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = connector.query_status(&id).await.unwrap();
        assert_eq!(status.state, RemoteJobState::Completed);
        assert!(status.result.is_some());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let connector = SimulationConnector::new("sdxl", Duration::from_millis(10));
        let status = connector.query_status("does-not-exist").await.unwrap();
        assert_eq!(status.state, RemoteJobState::NotFound);
    }

    #[tokio::test]
    async fn cancel_marks_job_as_failed() {
        let connector = SimulationConnector::new("sdxl", Duration::from_millis(1000));
        let id = connector.submit(&serde_json::json!({})).await.unwrap();
        connector.cancel(&id).await.unwrap();
        let status = connector.query_status(&id).await.unwrap();
        assert_eq!(status.state, RemoteJobState::Failed);
    }
}
