//! Error types and handling for the gate.
//!
//! `GateError` is the only error a caller of the gate ever sees. It is
//! `Clone` because a single-flight leader hands one outcome to every
//! co-waiter on the same key.

use crate::generator::UpstreamError;
use crate::types::QuotaKind;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using `GateError`
pub type GateResult<T> = Result<T, GateError>;

/// Which rate limiting layer rejected a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitType {
    /// Short-term burst control (token bucket)
    TokenBucket,
    /// Medium-term request count over a trailing window
    SlidingWindow,
    /// Too many callers already waiting for a permit
    QueueFull,
}

impl RateLimitType {
    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::SlidingWindow => "sliding_window",
            Self::QueueFull => "queue_full",
        }
    }
}

/// Comprehensive gate error type covering all error scenarios
#[derive(Debug, Clone, Error)]
pub enum GateError {
    /// Short-term rate limit hit; retry after the indicated delay
    #[error("Rate limit exceeded ({}), retry after {retry_after:?}", limit_type.as_str())]
    RateLimitExceeded {
        /// Layer that rejected the call
        limit_type: RateLimitType,
        /// Estimated time until a permit is available
        retry_after: Duration,
    },

    /// Hard quota hit; not retryable within the current period
    #[error("Quota exceeded: {kind} ({used:.4} of {limit:.4})")]
    QuotaExceeded {
        /// Quota that was exhausted
        kind: QuotaKind,
        /// Consumption in the current period
        used: f64,
        /// Configured cap
        limit: f64,
        /// Time until the quota period resets
        resets_in: Duration,
    },

    /// Circuit breaker is rejecting calls
    #[error("Circuit breaker open: {breaker}")]
    CircuitOpen {
        /// Breaker that rejected the call
        breaker: String,
        /// Remaining open duration (zero when isolated or unknown)
        retry_after: Duration,
    },

    /// Failure reported by the generation API
    #[error("Upstream error after {attempts} attempt(s): {message}")]
    Upstream {
        /// Whether the failure class is transient
        retryable: bool,
        /// HTTP-like status code, if the transport reported one
        status_code: Option<u16>,
        /// Error message
        message: String,
        /// Physical attempts made before giving up
        attempts: u32,
    },

    /// Operation exceeded its time budget
    #[error("Timed out after {duration:?}")]
    Timeout {
        /// Budget that was exceeded
        duration: Duration,
    },

    /// The computing party of a single-flight group went away without a result
    #[error("In-flight computation abandoned: {message}")]
    Cancelled {
        /// Error message
        message: String,
    },

    /// Request was rejected before any work was attempted
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Error message
        message: String,
    },

    /// Persistence layer failure
    #[error("Storage error: {message}")]
    Storage {
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl GateError {
    /// Check if the caller may retry this error later
    ///
    /// Quota and configuration errors are terminal for the current period.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { retryable, .. } => *retryable,
            Self::RateLimitExceeded { .. }
            | Self::CircuitOpen { .. }
            | Self::Timeout { .. }
            | Self::Cancelled { .. } => true,
            _ => false,
        }
    }

    /// Suggested delay before the caller retries, if any
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            Self::QuotaExceeded { resets_in, .. } => Some(*resets_in),
            _ => None,
        }
    }

    /// Whether this error was produced before upstream was contacted
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. } | Self::QuotaExceeded { .. } | Self::CircuitOpen { .. }
        )
    }

    /// Get the error code for programmatic handling
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Upstream { .. } => "upstream_error",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Storage { .. } => "storage_error",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Create a rate limit error
    #[must_use]
    pub fn rate_limited(limit_type: RateLimitType, retry_after: Duration) -> Self {
        Self::RateLimitExceeded {
            limit_type,
            retry_after,
        }
    }

    /// Create a circuit open error
    #[must_use]
    pub fn circuit_open(breaker: impl Into<String>, retry_after: Duration) -> Self {
        Self::CircuitOpen {
            breaker: breaker.into(),
            retry_after,
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a cancellation error
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a storage error
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap an upstream failure after `attempts` physical calls
    #[must_use]
    pub fn from_upstream(err: UpstreamError, attempts: u32) -> Self {
        Self::Upstream {
            retryable: err.retryable,
            status_code: err.status_code,
            message: err.message,
            attempts,
        }
    }
}

impl From<UpstreamError> for GateError {
    fn from(err: UpstreamError) -> Self {
        Self::from_upstream(err, 1)
    }
}

/// Errors raised by persistence adapters
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend I/O or query failure
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored record failed integrity checks
    #[error("corrupt record {key}: {reason}")]
    Corrupt {
        /// Key of the damaged record
        key: String,
        /// What was wrong with it
        reason: String,
    },

    /// A value could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<StoreError> for GateError {
    fn from(err: StoreError) -> Self {
        Self::storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryability() {
        assert!(GateError::rate_limited(RateLimitType::TokenBucket, Duration::from_secs(1)).is_retryable());
        assert!(GateError::circuit_open("analysis", Duration::from_secs(5)).is_retryable());
        assert!(GateError::timeout(Duration::from_secs(30)).is_retryable());
        assert!(!GateError::configuration("bad").is_retryable());

        let quota = GateError::QuotaExceeded {
            kind: QuotaKind::DailyTokens,
            used: 100.0,
            limit: 100.0,
            resets_in: Duration::from_secs(3600),
        };
        assert!(!quota.is_retryable());
        assert!(quota.is_rejection());
    }

    #[test]
    fn test_upstream_conversion() {
        let err: GateError = UpstreamError::from_status(503, "overloaded").into();
        assert!(err.is_retryable());
        assert_eq!(err.error_code(), "upstream_error");

        let err = GateError::from_upstream(UpstreamError::from_status(400, "bad prompt"), 1);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = GateError::rate_limited(RateLimitType::SlidingWindow, Duration::from_millis(250));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
        assert_eq!(GateError::internal("x").retry_after(), None);
    }

    #[test]
    fn test_store_error_conversion() {
        let err: GateError = StoreError::Backend("disk full".to_string()).into();
        assert!(matches!(err, GateError::Storage { .. }));
        assert!(err.to_string().contains("disk full"));
    }
}
