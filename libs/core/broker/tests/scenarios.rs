//! End-to-end scenarios and testable invariants from spec.md §8, run
//! against a real Redis container via `test_utils::TestRedis`, matching
//! the teacher's existing integration-test posture (real backend over
//! mocks).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use broker::config::{BrokerTuning, DispatcherConfig, EventsConfig, MonitorConfig, RecoveryConfig, UnknownTypePolicy};
use broker::{Capabilities, Dispatcher, EventFabric, JobBroker, JobStatus, OutboundMessage, ProgressEngine, RecoverySupervisor, Store, SubmitJobRequest, WorkerRegistry, WorkerStatus};
use connectors::{Connector, SimulationConnector};
use test_utils::TestRedis;

struct Harness {
    _redis: TestRedis,
    store: Store,
    broker: JobBroker,
    progress: ProgressEngine,
    registry: WorkerRegistry,
}

async fn harness() -> Harness {
    let redis = TestRedis::new().await;
    let client = redis::Client::open(redis.connection_string().to_string()).expect("valid redis url");
    let conn = client.get_connection_manager().await.expect("connection manager");

    let store = Store::new(conn.clone(), "test");
    let events = EventFabric::new(conn, store.keys().clone(), EventsConfig {
        main_maxlen: 10_000,
        errors_maxlen: 10_000,
        retention_ms_main: 86_400_000,
        retention_ms_errors: 604_800_000,
    });

    let tuning = BrokerTuning { claim_scan_depth: 256, default_max_retries: 3, default_timeout_ms: 300_000 };
    let broker = JobBroker::new(store.clone(), events.clone(), tuning);
    let progress = ProgressEngine::new(store.clone(), events.clone());
    let registry = WorkerRegistry::new(store.clone(), events);

    Harness { _redis: redis, store, broker, progress, registry }
}

fn submit(service: &str, priority: i32) -> SubmitJobRequest {
    SubmitJobRequest {
        service_required: service.to_string(),
        priority,
        payload: serde_json::json!({ "prompt": "x" }),
        requirements: Default::default(),
        customer_id: None,
        max_retries: None,
        timeout_ms: None,
        workflow_id: None,
        workflow_priority: None,
        workflow_datetime: None,
        step_number: None,
    }
}

fn caps(service: &str) -> Capabilities {
    Capabilities::new([service.to_string()], [])
}

#[tokio::test]
async fn s1_basic_happy_path() {
    let h = harness().await;

    let job_id = h.broker.submit_job(submit("comfyui", 50)).await.unwrap();
    let claimed = h.broker.claim_next("w1", &caps("comfyui")).await.unwrap().unwrap();
    assert_eq!(claimed.job_id, job_id);

    h.progress.update_progress(job_id, "w1", 50, None, None).await.unwrap();
    h.progress
        .complete_job(&h.broker, job_id, "w1", &serde_json::json!({ "image": "blob" }))
        .await
        .unwrap();

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(serde_json::json!({ "image": "blob" })));
}

#[tokio::test]
async fn s2_priority_and_workflow_tie_break() {
    let h = harness().await;

    let j2 = h.broker.submit_job(submit("comfyui", 10)).await.unwrap();
    let j3 = h.broker.submit_job(submit("comfyui", 50)).await.unwrap();

    let mut j4_request = submit("comfyui", 50);
    j4_request.workflow_id = Some(uuid::Uuid::now_v7());
    j4_request.workflow_priority = Some(99);
    j4_request.workflow_datetime = Some(0);
    let j4 = h.broker.submit_job(j4_request).await.unwrap();

    let first = h.broker.claim_next("w1", &caps("comfyui")).await.unwrap().unwrap();
    let second = h.broker.claim_next("w1", &caps("comfyui")).await.unwrap().unwrap();
    let third = h.broker.claim_next("w1", &caps("comfyui")).await.unwrap().unwrap();

    assert_eq!(first.job_id, j4);
    assert_eq!(second.job_id, j3);
    assert_eq!(third.job_id, j2);
}

#[tokio::test]
async fn s3_retry_then_success() {
    let h = harness().await;

    let mut request = submit("comfyui", 10);
    request.max_retries = Some(2);
    let job_id = h.broker.submit_job(request).await.unwrap();

    h.broker.claim_next("w1", &caps("comfyui")).await.unwrap().unwrap();
    let outcome = h.progress.fail_job(job_id, "w1", "boom", true).await.unwrap();
    assert_eq!(outcome, broker::store::FailOutcome::Retried);

    let after_fail = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(after_fail.status, JobStatus::Pending);
    assert_eq!(after_fail.retry_count, 1);
    assert_eq!(after_fail.last_failed_worker.as_deref(), Some("w1"));

    // w1 must not be able to reclaim the job it just failed.
    let reclaimed_by_w1 = h.broker.claim_next("w1", &caps("comfyui")).await.unwrap();
    assert!(reclaimed_by_w1.is_none());

    let claimed_by_w2 = h.broker.claim_next("w2", &caps("comfyui")).await.unwrap().unwrap();
    assert_eq!(claimed_by_w2.job_id, job_id);

    h.progress
        .complete_job(&h.broker, job_id, "w2", &serde_json::json!({ "done": true }))
        .await
        .unwrap();

    let final_job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(final_job.status, JobStatus::Completed);
    assert_eq!(final_job.retry_count, 1);
}

#[tokio::test]
async fn s4_retry_exhaustion() {
    let h = harness().await;

    let mut request = submit("comfyui", 10);
    request.max_retries = Some(1);
    let job_id = h.broker.submit_job(request).await.unwrap();

    h.broker.claim_next("w1", &caps("comfyui")).await.unwrap().unwrap();
    let outcome = h.progress.fail_job(job_id, "w1", "boom", true).await.unwrap();
    assert_eq!(outcome, broker::store::FailOutcome::Retried);

    let claimed = h.broker.claim_next("w2", &caps("comfyui")).await.unwrap().unwrap();
    assert_eq!(claimed.job_id, job_id);
    let outcome = h.progress.fail_job(job_id, "w2", "boom again", true).await.unwrap();
    assert_eq!(outcome, broker::store::FailOutcome::Failed);

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);

    // No further requeue: the pending queue must be empty for this job.
    let pending = h.store.get_pending_jobs(10).await.unwrap();
    assert!(pending.iter().all(|j| j.job_id != job_id));
}

#[tokio::test]
async fn s5_orphan_recovery_with_external_completion() {
    let h = harness().await;

    h.registry.register("w3", caps("comfyui")).await.unwrap();
    let job_id = h.broker.submit_job(submit("comfyui", 10)).await.unwrap();
    let claimed = h.broker.claim_next("w3", &caps("comfyui")).await.unwrap().unwrap();
    assert_eq!(claimed.job_id, job_id);

    let connector = SimulationConnector::new("comfyui", Duration::from_millis(10));
    let service_job_id = connector.submit(&serde_json::json!({})).await.unwrap();
    h.broker.set_service_job_id(job_id, "w3", &service_job_id).await.unwrap();

    // w3 goes silent: backdate its heartbeat past the stale threshold.
    let mut conn = h.store.conn();
    let _: () = redis::AsyncCommands::hset(&mut conn, h.store.keys().worker("w3"), "last_heartbeat_at", 0i64)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut connectors: HashMap<String, Arc<dyn Connector>> = HashMap::new();
    connectors.insert("comfyui".to_string(), Arc::new(connector));
    let events = EventFabric::new(
        h.store.conn(),
        h.store.keys().clone(),
        EventsConfig { main_maxlen: 1_000, errors_maxlen: 1_000, retention_ms_main: 1, retention_ms_errors: 1 },
    );
    let monitors = Arc::new(broker::MonitorRegistry::new());
    let recovery = RecoverySupervisor::new(
        h.store.clone(),
        events,
        monitors,
        connectors,
        RecoveryConfig { tick_ms: 1000, worker_stale_ms: 0, progress_silence_ms: 300_000, worker_gc_ms: 3_600_000 },
        MonitorConfig { heartbeat_timeout_ms: 60_000 },
    );

    recovery.run_once().await;

    let worker = h.store.get_worker("w3").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Offline);

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 0);
}

#[tokio::test]
async fn s6_timeout() {
    let h = harness().await;

    let mut request = submit("comfyui", 10);
    request.timeout_ms = Some(50);
    let job_id = h.broker.submit_job(request).await.unwrap();

    h.registry.register("w4", caps("comfyui")).await.unwrap();
    h.broker.claim_next("w4", &caps("comfyui")).await.unwrap().unwrap();
    h.progress.update_progress(job_id, "w4", 10, None, None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;

    let connectors: HashMap<String, Arc<dyn Connector>> = HashMap::new();
    let events = EventFabric::new(
        h.store.conn(),
        h.store.keys().clone(),
        EventsConfig { main_maxlen: 1_000, errors_maxlen: 1_000, retention_ms_main: 1, retention_ms_errors: 1 },
    );
    let monitors = Arc::new(broker::MonitorRegistry::new());
    let recovery = RecoverySupervisor::new(
        h.store.clone(),
        events,
        monitors,
        connectors,
        RecoveryConfig { tick_ms: 1000, worker_stale_ms: 300_000, progress_silence_ms: 300_000, worker_gc_ms: 3_600_000 },
        MonitorConfig { heartbeat_timeout_ms: 60_000 },
    );
    recovery.run_once().await;

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Timeout);
    assert_eq!(job.retry_count, 0, "timeout is terminal, not a counted retry");

    let worker = h.store.get_worker("w4").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
}

#[tokio::test]
async fn register_worker_is_idempotent() {
    let h = harness().await;
    h.registry.register("w1", caps("comfyui")).await.unwrap();

    let job_id = h.broker.submit_job(submit("comfyui", 10)).await.unwrap();
    h.broker.claim_next("w1", &caps("comfyui")).await.unwrap().unwrap();
    h.progress
        .complete_job(&h.broker, job_id, "w1", &serde_json::json!({ "ok": true }))
        .await
        .unwrap();

    let before = h.store.get_worker("w1").await.unwrap().unwrap();
    h.registry.register("w1", caps("comfyui")).await.unwrap();
    let after = h.store.get_worker("w1").await.unwrap().unwrap();

    assert_eq!(before.connected_at, after.connected_at);
    assert_eq!(after.status, WorkerStatus::Idle);
}

#[tokio::test]
async fn cancel_job_on_terminal_is_noop() {
    let h = harness().await;
    let job_id = h.broker.submit_job(submit("comfyui", 10)).await.unwrap();
    h.broker.claim_next("w1", &caps("comfyui")).await.unwrap().unwrap();
    h.progress
        .complete_job(&h.broker, job_id, "w1", &serde_json::json!({ "ok": true }))
        .await
        .unwrap();

    h.broker.cancel_job(job_id, "too late").await.unwrap();
    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn complete_job_twice_is_noop_on_second_call() {
    let h = harness().await;
    let job_id = h.broker.submit_job(submit("comfyui", 10)).await.unwrap();
    h.broker.claim_next("w1", &caps("comfyui")).await.unwrap().unwrap();

    h.progress
        .complete_job(&h.broker, job_id, "w1", &serde_json::json!({ "first": true }))
        .await
        .unwrap();

    // A second completion by the same worker is a no-op success (spec.md §8):
    // it must not overwrite the result already recorded by the first call.
    h.progress
        .complete_job(&h.broker, job_id, "w1", &serde_json::json!({ "second": true }))
        .await
        .unwrap();

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.result, Some(serde_json::json!({ "first": true })));
}

#[tokio::test]
async fn score_ordering_holds_across_many_priorities() {
    let h = harness().await;
    let mut ids = Vec::new();
    for priority in [5, 90, 20, 60, 1] {
        ids.push((priority, h.broker.submit_job(submit("comfyui", priority)).await.unwrap()));
    }
    ids.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, expected_id) in ids {
        let claimed = h.broker.claim_next("w1", &caps("comfyui")).await.unwrap().unwrap();
        assert_eq!(claimed.job_id, expected_id);
    }
}

#[tokio::test]
async fn remove_worker_releases_active_jobs() {
    let h = harness().await;
    h.registry.register("w1", caps("comfyui")).await.unwrap();
    let job_id = h.broker.submit_job(submit("comfyui", 10)).await.unwrap();
    h.broker.claim_next("w1", &caps("comfyui")).await.unwrap().unwrap();

    h.registry.remove("w1").await.unwrap();

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(h.store.get_worker("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn dispatch_value_routes_unrecognized_type_to_unknown_type_handler() {
    let h = harness().await;
    let dispatcher = Dispatcher::new(
        h.broker.clone(),
        h.registry.clone(),
        h.progress.clone(),
        DispatcherConfig { unknown_type_policy: UnknownTypePolicy::Warn },
    );

    // This never reaches InboundEnvelope's serde-tagged deserialization: an
    // unrecognized `type` is sniffed out first and routed to
    // Dispatcher::unknown_type, never raised.
    let value = serde_json::json!({
        "id": "m1",
        "timestamp": 1,
        "source": "api",
        "type": "not_a_real_message_type",
    });

    match dispatcher.dispatch_value(value).await {
        OutboundMessage::Error { ref_id, message } => {
            assert_eq!(ref_id, "m1");
            assert!(message.contains("not_a_real_message_type"));
        }
        other => panic!("expected Error outbound for unknown type, got {other:?}"),
    }
}

#[tokio::test]
async fn dispatch_value_accepts_recognized_type() {
    let h = harness().await;
    let dispatcher = Dispatcher::new(
        h.broker.clone(),
        h.registry.clone(),
        h.progress.clone(),
        DispatcherConfig { unknown_type_policy: UnknownTypePolicy::Warn },
    );

    let value = serde_json::json!({
        "id": "m2",
        "timestamp": 1,
        "source": "api",
        "type": "submit_job",
        "service_required": "comfyui",
        "priority": 10,
        "payload": { "prompt": "x" },
    });

    match dispatcher.dispatch_value(value).await {
        OutboundMessage::JobSubmitted { .. } => {}
        other => panic!("expected JobSubmitted outbound, got {other:?}"),
    }
}
