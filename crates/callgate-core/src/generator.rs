//! The generation capability the gate protects.
//!
//! Callers supply an implementation of [`Generator`]; the gate never knows
//! which provider, transport or prompt sits behind it.

use crate::types::{RawResponse, Stage};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// A paid generation API
#[async_trait]
pub trait Generator: Send + Sync + 'static {
    /// Identifier used in logs and as the circuit breaker name
    fn id(&self) -> &str;

    /// Model name used for pricing
    fn model(&self) -> &str;

    /// Perform one physical call for `stage` with a normalized input
    ///
    /// # Errors
    /// Returns `UpstreamError` describing whether the failure is transient
    async fn invoke(
        &self,
        stage: Stage,
        input: &serde_json::Value,
    ) -> Result<RawResponse, UpstreamError>;
}

/// Failure reported by a [`Generator`]
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct UpstreamError {
    /// Transient failures (timeouts, 5xx, throttling, network) are retried
    pub retryable: bool,
    /// HTTP-like status code, if any
    pub status_code: Option<u16>,
    /// Human readable detail
    pub message: String,
    /// Server-provided retry hint
    pub retry_after: Option<Duration>,
}

impl UpstreamError {
    /// Classify a failure by its status code
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            retryable: matches!(status, 408 | 429 | 500..=599),
            status_code: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    /// The call did not complete within its budget
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self {
            retryable: true,
            status_code: None,
            message: format!("upstream call timed out after {after:?}"),
            retry_after: None,
        }
    }

    /// Transient transport failure
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Malformed request; retrying cannot help
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            status_code: Some(400),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attach a server retry hint
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Whether the provider signalled throttling
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.status_code == Some(429)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(UpstreamError::from_status(500, "boom").retryable);
        assert!(UpstreamError::from_status(503, "busy").retryable);
        assert!(UpstreamError::from_status(429, "slow down").retryable);
        assert!(UpstreamError::from_status(408, "timeout").retryable);
        assert!(!UpstreamError::from_status(400, "bad").retryable);
        assert!(!UpstreamError::from_status(401, "auth").retryable);
        assert!(!UpstreamError::from_status(404, "missing").retryable);
    }

    #[test]
    fn test_throttle_detection() {
        let err = UpstreamError::from_status(429, "rate limited")
            .with_retry_after(Duration::from_secs(2));
        assert!(err.is_throttled());
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
        assert!(!UpstreamError::network("reset").is_throttled());
    }
}
