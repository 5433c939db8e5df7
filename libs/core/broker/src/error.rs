//! Error taxonomy for the broker kernel (spec.md §7).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Malformed message or missing required field. Reported to sender, not retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced job/worker/workflow absent. Reported to caller, not retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Progress/completion from a non-owner, or on a terminal job.
    #[error("stale update: {0}")]
    StaleUpdate(String),

    /// Claim requested for a service the worker doesn't advertise. Should
    /// not be reachable under normal flow since the claim script filters.
    #[error("capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// Store RPC timeout/connection blip. Retried once by the caller.
    #[error("transient store error: {0}")]
    Transient(#[from] redis::RedisError),

    /// Retry limit reached.
    #[error("quota exceeded: retry_count would exceed max_retries")]
    QuotaExceeded,

    /// Job exceeded `timeout_ms`.
    #[error("job timed out")]
    Timeout,

    /// Job was cancelled.
    #[error("job cancelled: {0}")]
    Cancelled(String),

    /// Invariant violation that recovery could not repair.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Permanent,
            Self::NotFound(_) => ErrorCategory::Permanent,
            Self::StaleUpdate(_) => ErrorCategory::Permanent,
            Self::CapabilityMismatch(_) => ErrorCategory::Permanent,
            Self::Transient(_) => ErrorCategory::Transient,
            Self::QuotaExceeded => ErrorCategory::Permanent,
            Self::Timeout => ErrorCategory::Permanent,
            Self::Cancelled(_) => ErrorCategory::Permanent,
            Self::Internal(_) => ErrorCategory::Permanent,
            Self::Serialization(_) => ErrorCategory::Permanent,
        }
    }

    /// Whether a caller should retry this operation at most once, per
    /// spec.md §5's store-RPC deadline policy.
    pub fn is_retryable_once(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_permanent() {
        assert_eq!(
            BrokerError::Validation("missing type".into()).category(),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn transient_errors_retry_once() {
        let err = BrokerError::Transient(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection reset",
        )));
        assert!(err.is_retryable_once());
    }
}
