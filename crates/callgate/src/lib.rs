//! # Callgate
//!
//! A resilient gate in front of a paid generation API. Each call passes
//! through:
//! - A two-tier response cache with single-flight computation
//! - A circuit breaker per upstream generator
//! - A quota-aware rate limiter
//! - Bounded retries with exponential backoff and per-attempt timeouts
//!
//! Every physical attempt is recorded in a usage ledger that drives quota
//! accounting and threshold alerts.
//!
//! ```ignore
//! let gate = Gate::builder()
//!     .config(load_config()?)
//!     .generator(FnGenerator::new("anthropic", "claude-3-5-sonnet", call_api))
//!     .build()
//!     .await?;
//! gate.spawn_maintenance();
//!
//! let response = gate
//!     .execute(GateRequest::new(Stage::Analysis, json!({"word": "hund"})))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod gate;
mod generator;
mod maintenance;
mod request;

pub use builder::GateBuilder;
pub use gate::Gate;
pub use generator::FnGenerator;
pub use request::{GateRequest, GateResponse, ResponseSource, TokenUsage};

// Re-export the types callers need alongside the gate
pub use callgate_config::{load_config, AlertConfig, AlertSeverity, GateConfig};
pub use callgate_core::{
    CacheKey, GateError, GateResult, Generator, Payload, QuotaKind, RawResponse, Stage,
    UpstreamError, UsagePeriod, UsageSummary,
};
pub use callgate_resilience::{
    AlertEvent, CacheStats, CircuitSnapshot, CircuitState, CircuitTransition, QuotaUsage,
    TransitionCause,
};
pub use callgate_telemetry::init_logging;
