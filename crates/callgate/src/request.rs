//! Request and response types for [`Gate::execute`](crate::Gate::execute).

use callgate_core::{CacheKey, Payload, Stage};
use serde::Serialize;
use std::time::Duration;

/// One logical call through the gate
#[derive(Debug, Clone)]
pub struct GateRequest {
    /// Pipeline stage the call belongs to
    pub stage: Stage,
    /// Normalized input handed to the generator
    pub input: serde_json::Value,
    /// Explicit cache key; derived from stage and input when unset
    pub key: Option<CacheKey>,
    /// Idempotency key shared by every attempt of this call
    pub request_id: String,
    /// Rate-limiter permits the call consumes
    pub permits: u32,
    /// Expected token use, checked against the daily quota before calling
    pub estimated_tokens: u64,
    /// Cache TTL override
    pub ttl: Option<Duration>,
}

impl GateRequest {
    /// Create a request with a fresh request id and one permit
    #[must_use]
    pub fn new(stage: Stage, input: serde_json::Value) -> Self {
        Self {
            stage,
            input,
            key: None,
            request_id: uuid::Uuid::new_v4().to_string(),
            permits: 1,
            estimated_tokens: 0,
            ttl: None,
        }
    }

    /// Use an explicit cache key
    #[must_use]
    pub fn with_key(mut self, key: CacheKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Use a caller-provided request id
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Set the permit cost
    #[must_use]
    pub fn with_permits(mut self, permits: u32) -> Self {
        self.permits = permits;
        self
    }

    /// Set the token estimate
    #[must_use]
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    /// Override the cache TTL
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// The key this request is cached under
    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        self.key
            .clone()
            .unwrap_or_else(|| CacheKey::derive(self.stage, &self.input))
    }
}

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Memory or persistent cache tier
    Cache,
    /// This call reached the generator
    Upstream,
    /// Shared from a concurrent call for the same key
    Coalesced,
}

/// Tokens and cost of an upstream call
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TokenUsage {
    /// Prompt tokens reported by the generator
    pub input_tokens: u64,
    /// Completion tokens reported by the generator
    pub output_tokens: u64,
    /// Cost of the successful attempt in USD
    pub cost: f64,
    /// Physical attempts made
    pub attempts: u32,
}

/// Result of [`Gate::execute`](crate::Gate::execute)
#[derive(Debug, Clone)]
pub struct GateResponse {
    /// Response bytes
    pub payload: Payload,
    /// Origin of the payload
    pub source: ResponseSource,
    /// Cache key of the request
    pub key: CacheKey,
    /// Request id the call was tracked under
    pub request_id: String,
    /// Set when this call reached the generator
    pub usage: Option<TokenUsage>,
}

impl GateResponse {
    /// Payload as UTF-8 text, if it is valid UTF-8
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Whether the generator was not called for this response
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.source != ResponseSource::Upstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let a = GateRequest::new(Stage::Analysis, json!({"word": "hund"}));
        let b = GateRequest::new(Stage::Analysis, json!({"word": "hund"}));

        assert_eq!(a.permits, 1);
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_explicit_key_wins() {
        let request = GateRequest::new(Stage::CardAuthoring, json!({"word": "katt"}))
            .with_key(CacheKey::from_raw("fixed"));
        assert_eq!(request.cache_key().as_str(), "fixed");
    }
}
