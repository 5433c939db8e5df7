//! Key layout for the persisted state (spec.md §6 "Persisted state layout").
//!
//! All keys share a configurable prefix for multi-tenant isolation.

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn job(&self, job_id: Uuid) -> String {
        format!("{}job:{}", self.prefix, job_id)
    }

    pub fn job_owner(&self, job_id: Uuid) -> String {
        format!("{}job:{}:owner", self.prefix, job_id)
    }

    pub fn queue_pending(&self) -> String {
        format!("{}queue:pending", self.prefix)
    }

    pub fn set_active(&self) -> String {
        format!("{}set:active", self.prefix)
    }

    pub fn set_completed(&self) -> String {
        format!("{}set:completed", self.prefix)
    }

    pub fn set_failed(&self) -> String {
        format!("{}set:failed", self.prefix)
    }

    pub fn set_cancelled(&self) -> String {
        format!("{}set:cancelled", self.prefix)
    }

    pub fn worker(&self, worker_id: &str) -> String {
        format!("{}worker:{}", self.prefix, worker_id)
    }

    pub fn worker_jobs(&self, worker_id: &str) -> String {
        format!("{}worker:{}:jobs", self.prefix, worker_id)
    }

    pub fn worker_archive(&self, worker_id: &str) -> String {
        format!("{}archive:worker:{}", self.prefix, worker_id)
    }

    pub fn workers_active(&self) -> String {
        format!("{}workers:active", self.prefix)
    }

    pub fn workflow(&self, workflow_id: Uuid) -> String {
        format!("{}workflow:{}", self.prefix, workflow_id)
    }

    pub fn events_main(&self) -> String {
        format!("{}events:main", self.prefix)
    }

    pub fn events_errors(&self) -> String {
        format!("{}events:errors", self.prefix)
    }

    pub fn status_channel(&self, job_id: Uuid) -> String {
        format!("{}job:{}:status", self.prefix, job_id)
    }

    pub fn machine_channel(&self, machine_id: &str) -> String {
        format!("{}machine:{}:gpu", self.prefix, machine_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed() {
        let keys = StoreKeys::new("emp:");
        assert_eq!(keys.queue_pending(), "emp:queue:pending");
        assert_eq!(keys.set_active(), "emp:set:active");
        assert_eq!(keys.worker("w1"), "emp:worker:w1");
    }

    #[test]
    fn empty_prefix_is_allowed() {
        let keys = StoreKeys::new("");
        assert_eq!(keys.queue_pending(), "queue:pending");
    }
}
