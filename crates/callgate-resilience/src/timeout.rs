//! Time budgets for upstream attempts.

use callgate_config::TimeoutConfig;
use callgate_core::UpstreamError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Timeout manager
#[derive(Debug, Clone)]
pub struct TimeoutManager {
    config: TimeoutConfig,
}

impl TimeoutManager {
    /// Create a new timeout manager
    #[must_use]
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(TimeoutConfig::default())
    }

    /// Budget for a single upstream attempt
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        self.config.attempt
    }

    /// Run one upstream attempt within the attempt budget
    ///
    /// # Errors
    /// Returns a retryable `UpstreamError` if the budget is exceeded
    pub async fn run_attempt<F, T>(&self, future: F) -> Result<T, UpstreamError>
    where
        F: Future<Output = Result<T, UpstreamError>>,
    {
        self.with_custom_timeout(future, self.config.attempt).await
    }

    /// Run an operation with a custom budget
    ///
    /// # Errors
    /// Returns a retryable `UpstreamError` if the budget is exceeded
    pub async fn with_custom_timeout<F, T>(
        &self,
        future: F,
        timeout: Duration,
    ) -> Result<T, UpstreamError>
    where
        F: Future<Output = Result<T, UpstreamError>>,
    {
        if let Ok(result) = tokio::time::timeout(timeout, future).await {
            result
        } else {
            warn!(timeout_ms = timeout.as_millis(), "Upstream attempt timed out");
            Err(UpstreamError::timeout(timeout))
        }
    }
}
