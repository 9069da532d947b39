//! # Callgate Resilience
//!
//! The stateful components every gated call passes through:
//! - Two-tier response cache with single-flight computation
//! - Quota-aware rate limiter (token bucket, sliding window, hard caps)
//! - Ratio-based circuit breaker with manual isolation
//! - Retry policy with exponential backoff and jitter
//! - Per-attempt timeout management
//! - Usage tracking, pricing and quota alerts

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alerts;
pub mod cache;
pub mod circuit_breaker;
mod persist;
pub mod pricing;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;
pub mod usage;

// Re-export main types
pub use alerts::{AlertCallback, AlertEvent, AlertManager};
pub use cache::{CacheStats, CacheTier, ComputeSource, Invalidated, ResponseCache};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitSnapshot, CircuitState, CircuitTransition, TransitionCause,
};
pub use pricing::PriceTable;
pub use rate_limiter::{PeriodUsage, QuotaUsage, RateLimiter};
pub use retry::{Jitter, RetryPolicy};
pub use timeout::TimeoutManager;
pub use usage::{UsageEntry, UsageOutcome, UsageTracker};
