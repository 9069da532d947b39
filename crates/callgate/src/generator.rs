//! Closure adapter for the [`Generator`] port.

use async_trait::async_trait;
use callgate_core::{Generator, RawResponse, Stage, UpstreamError};
use std::future::Future;

/// Wraps an async closure as a [`Generator`]
///
/// ```ignore
/// let generator = FnGenerator::new("anthropic", "claude-3-haiku", |stage, input| async move {
///     client.complete(stage, input).await
/// });
/// ```
pub struct FnGenerator<F> {
    id: String,
    model: String,
    call: F,
}

impl<F, Fut> FnGenerator<F>
where
    F: Fn(Stage, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RawResponse, UpstreamError>> + Send + 'static,
{
    /// Create a generator with an id (breaker name) and a model (pricing)
    pub fn new(id: impl Into<String>, model: impl Into<String>, call: F) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            call,
        }
    }
}

impl<F> std::fmt::Debug for FnGenerator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnGenerator")
            .field("id", &self.id)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Generator for FnGenerator<F>
where
    F: Fn(Stage, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RawResponse, UpstreamError>> + Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(
        &self,
        stage: Stage,
        input: &serde_json::Value,
    ) -> Result<RawResponse, UpstreamError> {
        (self.call)(stage, input.clone()).await
    }
}
