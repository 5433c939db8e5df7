//! Configuration surface (spec.md §6 "Configuration surface"), loaded via
//! `core_config::FromEnv`, one struct per concern.

use core_config::{env_or_default, ConfigError, FromEnv};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub prefix: String,
}

impl FromEnv for StoreConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: core_config::env_required("STORE_URL").or_else(|_| core_config::env_required("REDIS_HOST"))?,
            prefix: env_or_default("STORE_PREFIX", ""),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BrokerTuning {
    pub claim_scan_depth: usize,
    pub default_max_retries: u32,
    pub default_timeout_ms: i64,
}

impl FromEnv for BrokerTuning {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            claim_scan_depth: parse_or_default("BROKER_CLAIM_SCAN_DEPTH", 256)?,
            default_max_retries: parse_or_default("BROKER_DEFAULT_MAX_RETRIES", 3)?,
            default_timeout_ms: parse_or_default("BROKER_DEFAULT_TIMEOUT_MS", 300_000)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub tick_ms: u64,
    pub worker_stale_ms: i64,
    pub progress_silence_ms: i64,
    pub worker_gc_ms: i64,
}

impl FromEnv for RecoveryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            tick_ms: parse_or_default("RECOVERY_TICK_MS", 30_000)?,
            worker_stale_ms: parse_or_default("RECOVERY_WORKER_STALE_MS", 90_000)?,
            progress_silence_ms: parse_or_default("RECOVERY_PROGRESS_SILENCE_MS", 300_000)?,
            worker_gc_ms: parse_or_default("RECOVERY_WORKER_GC_MS", 3_600_000)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EventsConfig {
    pub main_maxlen: i64,
    pub errors_maxlen: i64,
    pub retention_ms_main: i64,
    pub retention_ms_errors: i64,
}

impl FromEnv for EventsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            main_maxlen: parse_or_default("EVENTS_MAIN_MAXLEN", 10_000)?,
            errors_maxlen: parse_or_default("EVENTS_ERRORS_MAXLEN", 50_000)?,
            retention_ms_main: parse_or_default("EVENTS_RETENTION_MS_MAIN", 86_400_000)?,
            retention_ms_errors: parse_or_default("EVENTS_RETENTION_MS_ERRORS", 604_800_000)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownTypePolicy {
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub unknown_type_policy: UnknownTypePolicy,
}

impl FromEnv for DispatcherConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let raw = env_or_default("DISPATCHER_UNKNOWN_TYPE_POLICY", "warn");
        let unknown_type_policy = match raw.as_str() {
            "error" => UnknownTypePolicy::Error,
            _ => UnknownTypePolicy::Warn,
        };
        Ok(Self { unknown_type_policy })
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub heartbeat_timeout_ms: i64,
}

impl FromEnv for MonitorConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            heartbeat_timeout_ms: parse_or_default("MONITOR_HEARTBEAT_TIMEOUT_MS", 60_000)?,
        })
    }
}

/// Aggregate configuration for a broker process.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub store: StoreConfig,
    pub broker: BrokerTuning,
    pub recovery: RecoveryConfig,
    pub events: EventsConfig,
    pub dispatcher: DispatcherConfig,
    pub monitor: MonitorConfig,
}

impl FromEnv for BrokerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            store: StoreConfig::from_env()?,
            broker: BrokerTuning::from_env()?,
            recovery: RecoveryConfig::from_env()?,
            events: EventsConfig::from_env()?,
            dispatcher: DispatcherConfig::from_env()?,
            monitor: MonitorConfig::from_env()?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + ToString,
    T::Err: std::fmt::Display,
{
    let raw = env_or_default(key, &default.to_string());
    raw.parse().map_err(|e: T::Err| ConfigError::ParseError {
        key: key.to_string(),
        details: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_tuning_defaults() {
        temp_env::with_vars(
            [
                ("BROKER_CLAIM_SCAN_DEPTH", None::<&str>),
                ("BROKER_DEFAULT_MAX_RETRIES", None::<&str>),
                ("BROKER_DEFAULT_TIMEOUT_MS", None::<&str>),
            ],
            || {
                let tuning = BrokerTuning::from_env().unwrap();
                assert_eq!(tuning.claim_scan_depth, 256);
                assert_eq!(tuning.default_max_retries, 3);
            },
        );
    }

    #[test]
    fn recovery_config_defaults_match_spec() {
        temp_env::with_vars(
            [
                ("RECOVERY_TICK_MS", None::<&str>),
                ("RECOVERY_WORKER_STALE_MS", None::<&str>),
                ("RECOVERY_PROGRESS_SILENCE_MS", None::<&str>),
                ("RECOVERY_WORKER_GC_MS", None::<&str>),
            ],
            || {
                let cfg = RecoveryConfig::from_env().unwrap();
                assert_eq!(cfg.tick_ms, 30_000);
                assert_eq!(cfg.worker_stale_ms, 90_000);
                assert_eq!(cfg.progress_silence_ms, 300_000);
                assert_eq!(cfg.worker_gc_ms, 3_600_000);
            },
        );
    }

    #[test]
    fn dispatcher_policy_parses_error_variant() {
        temp_env::with_var("DISPATCHER_UNKNOWN_TYPE_POLICY", Some("error"), || {
            let cfg = DispatcherConfig::from_env().unwrap();
            assert_eq!(cfg.unknown_type_policy, UnknownTypePolicy::Error);
        });
    }
}
