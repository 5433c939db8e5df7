//! Prometheus metrics for the broker kernel.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const JOBS_SUBMITTED: &str = "broker_jobs_submitted_total";
    pub const JOBS_CLAIMED: &str = "broker_jobs_claimed_total";
    pub const CLAIM_SCAN_DEPTH: &str = "broker_claim_scan_depth";
    pub const CLAIM_DURATION: &str = "broker_claim_duration_seconds";
    pub const JOBS_TERMINAL: &str = "broker_jobs_terminal_total";
    pub const ACTIVE_JOBS: &str = "broker_active_jobs";
    pub const PENDING_JOBS: &str = "broker_pending_jobs";
    pub const RECOVERY_SWEEPS: &str = "broker_recovery_sweeps_total";
    pub const RECOVERY_RECLAIMED: &str = "broker_recovery_reclaimed_total";
    pub const ACTIVE_WORKERS: &str = "broker_active_workers";
    pub const MESSAGES: &str = "broker_messages_total";
}

pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

pub fn record_job_submitted(service: &str) {
    counter!(names::JOBS_SUBMITTED, "service" => service.to_string()).increment(1);
}

pub fn record_job_claimed(service: &str, worker_id: &str) {
    counter!(
        names::JOBS_CLAIMED,
        "service" => service.to_string(),
        "worker_id" => worker_id.to_string()
    )
    .increment(1);
}

pub fn record_claim_scan_depth(depth: usize) {
    gauge!(names::CLAIM_SCAN_DEPTH).set(depth as f64);
}

pub fn record_claim_duration(duration: Duration) {
    histogram!(names::CLAIM_DURATION).record(duration.as_secs_f64());
}

pub fn record_job_terminal(outcome: &str) {
    counter!(names::JOBS_TERMINAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn set_active_jobs(count: f64) {
    gauge!(names::ACTIVE_JOBS).set(count);
}

pub fn set_pending_jobs(count: f64) {
    gauge!(names::PENDING_JOBS).set(count);
}

pub fn record_recovery_sweep(sweep: &str) {
    counter!(names::RECOVERY_SWEEPS, "sweep" => sweep.to_string()).increment(1);
}

pub fn record_recovery_reclaimed(sweep: &str, count: u64) {
    counter!(names::RECOVERY_RECLAIMED, "sweep" => sweep.to_string()).increment(count);
}

pub fn set_active_workers(count: f64) {
    gauge!(names::ACTIVE_WORKERS).set(count);
}

/// Dispatcher message statistics (spec.md §4.7: counts per type, success vs. failure).
pub fn record_message(message_type: &str, outcome: &str) {
    counter!(
        names::MESSAGES,
        "type" => message_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
