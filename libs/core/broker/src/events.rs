//! Event Fabric (C6, spec.md §4.6): two physically separate channels.
//!
//! `EventFabric::emit`/`emit_error` append to the bounded, persistent
//! streams (`events:main`, `events:errors`) via `XADD ... MAXLEN ~ n *`,
//! mirroring `stream-worker::producer::StreamProducer::send`'s approximate-
//! trim usage. `EventFabric::publish_status` is a completely separate
//! `PUBLISH` path with no persistence, for high-frequency progress/telemetry.
//! Emission is fire-and-forget: failures are logged, never propagated to the
//! caller whose job mutation triggered them.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::EventsConfig;
use crate::keys::StoreKeys;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerEvent {
    pub timestamp: i64,
    pub service: String,
    pub event_type: String,
    pub trace_id: String,
    pub job_id: Option<Uuid>,
    pub worker_id: Option<String>,
    pub machine_id: Option<String>,
    pub data: serde_json::Value,
    /// Set only when this event is also mirrored to `events:errors`.
    pub is_error: bool,
}

#[derive(Clone)]
pub struct EventFabric {
    conn: ConnectionManager,
    keys: StoreKeys,
    config: EventsConfig,
}

impl EventFabric {
    pub fn new(conn: ConnectionManager, keys: StoreKeys, config: EventsConfig) -> Self {
        Self { conn, keys, config }
    }

    /// Appends to `events:main`; if `event.is_error`, also mirrors to
    /// `events:errors` with its own (longer) retention.
    pub async fn emit(&self, event: BrokerEvent) {
        let mut conn = self.conn.clone();
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize event, dropping");
                return;
            }
        };

        if let Err(e) = redis::cmd("XADD")
            .arg(self.keys.events_main())
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.main_maxlen)
            .arg("*")
            .arg("event")
            .arg(&payload)
            .query_async::<String>(&mut conn)
            .await
        {
            warn!(error = %e, event_type = %event.event_type, "failed to publish event, continuing");
        }

        if event.is_error {
            if let Err(e) = redis::cmd("XADD")
                .arg(self.keys.events_errors())
                .arg("MAXLEN")
                .arg("~")
                .arg(self.config.errors_maxlen)
                .arg("*")
                .arg("event")
                .arg(&payload)
                .query_async::<String>(&mut conn)
                .await
            {
                warn!(error = %e, event_type = %event.event_type, "failed to mirror error event, continuing");
            }
        }
    }

    pub async fn emit_lifecycle(&self, service: &str, event_type: &str, job_id: Uuid, worker_id: Option<&str>, data: serde_json::Value) {
        self.emit(BrokerEvent {
            timestamp: Utc::now().timestamp_millis(),
            service: service.to_string(),
            event_type: event_type.to_string(),
            trace_id: Uuid::new_v4().to_string(),
            job_id: Some(job_id),
            worker_id: worker_id.map(str::to_string),
            machine_id: None,
            data,
            is_error: false,
        })
        .await;
    }

    pub async fn emit_error(&self, service: &str, event_type: &str, job_id: Option<Uuid>, data: serde_json::Value) {
        self.emit(BrokerEvent {
            timestamp: Utc::now().timestamp_millis(),
            service: service.to_string(),
            event_type: event_type.to_string(),
            trace_id: Uuid::new_v4().to_string(),
            job_id,
            worker_id: None,
            machine_id: None,
            data,
            is_error: true,
        })
        .await;
    }

    /// High-frequency, unpersisted progress/telemetry. No delivery
    /// guarantee: if no subscriber is attached, the message is simply lost.
    pub async fn publish_status(&self, job_id: Uuid, payload: &serde_json::Value) {
        let mut conn = self.conn.clone();
        let message = match serde_json::to_string(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to serialize status payload, dropping");
                return;
            }
        };
        if let Err(e) = redis::cmd("PUBLISH")
            .arg(self.keys.status_channel(job_id))
            .arg(message)
            .query_async::<i64>(&mut conn)
            .await
        {
            warn!(error = %e, %job_id, "failed to publish status, continuing");
        }
    }

    /// Resync: return stream entries since `since_ms`, capped at `limit`.
    pub async fn resync(&self, since_ms: i64, limit: usize) -> redis::RedisResult<ResyncResult> {
        let mut conn = self.conn.clone();
        let start_id = format!("{since_ms}-0");
        let entries: Vec<(String, Vec<(String, String)>)> = redis::cmd("XRANGE")
            .arg(self.keys.events_main())
            .arg(&start_id)
            .arg("+")
            .arg("COUNT")
            .arg(limit + 1)
            .query_async(&mut conn)
            .await?;

        let has_more = entries.len() > limit;
        let events: Vec<BrokerEvent> = entries
            .into_iter()
            .take(limit)
            .filter_map(|(_, fields)| {
                fields
                    .into_iter()
                    .find(|(k, _)| k == "event")
                    .and_then(|(_, v)| serde_json::from_str(&v).ok())
            })
            .collect();

        let oldest: Option<(String, Vec<(String, String)>)> = redis::cmd("XRANGE")
            .arg(self.keys.events_main())
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;
        let oldest_available_timestamp = oldest
            .and_then(|(_, fields)| fields.into_iter().find(|(k, _)| k == "event").map(|(_, v)| v))
            .and_then(|v| serde_json::from_str::<BrokerEvent>(&v).ok())
            .map(|e| e.timestamp)
            .unwrap_or(since_ms);

        Ok(ResyncResult { events, has_more, oldest_available_timestamp })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncResult {
    pub events: Vec<BrokerEvent>,
    pub has_more: bool,
    pub oldest_available_timestamp: i64,
}

#[derive(Debug, Clone)]
struct MonitorEntry {
    topics: Vec<String>,
    filters: HashMap<String, String>,
    last_heartbeat_at: i64,
}

/// Tracks registered monitors (`{topics, filters, last_heartbeat}`) so the
/// Recovery Supervisor's sweep can drop ones silent for more than 60s,
/// replacing the source's open listener list with a typed registry.
pub struct MonitorRegistry {
    monitors: Mutex<HashMap<String, MonitorEntry>>,
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self { monitors: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, monitor_id: impl Into<String>, topics: Vec<String>, filters: HashMap<String, String>, now: i64) {
        let mut monitors = self.monitors.lock().expect("monitor registry lock poisoned");
        monitors.insert(monitor_id.into(), MonitorEntry { topics, filters, last_heartbeat_at: now });
    }

    pub fn heartbeat(&self, monitor_id: &str, now: i64) {
        let mut monitors = self.monitors.lock().expect("monitor registry lock poisoned");
        if let Some(entry) = monitors.get_mut(monitor_id) {
            entry.last_heartbeat_at = now;
        }
    }

    /// Drops and returns monitor ids silent for longer than `timeout_ms`.
    pub fn drop_stale(&self, now: i64, timeout_ms: i64) -> Vec<String> {
        let mut monitors = self.monitors.lock().expect("monitor registry lock poisoned");
        let stale: Vec<String> = monitors
            .iter()
            .filter(|(_, entry)| now - entry.last_heartbeat_at > timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            monitors.remove(id);
        }
        stale
    }

    pub fn topics_for(&self, monitor_id: &str) -> Option<Vec<String>> {
        let monitors = self.monitors.lock().expect("monitor registry lock poisoned");
        monitors.get(monitor_id).map(|e| e.topics.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_stale_removes_only_silent_monitors() {
        let registry = MonitorRegistry::new();
        registry.register("m1", vec!["jobs".into()], HashMap::new(), 0);
        registry.register("m2", vec!["workers".into()], HashMap::new(), 50_000);

        let dropped = registry.drop_stale(61_000, 60_000);
        assert_eq!(dropped, vec!["m1".to_string()]);
        assert!(registry.topics_for("m2").is_some());
        assert!(registry.topics_for("m1").is_none());
    }
}
