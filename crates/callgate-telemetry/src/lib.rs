//! # Callgate Telemetry
//!
//! Observability for the gate:
//! - Structured logging via `tracing-subscriber`
//! - Prometheus metrics rendered as text for a collaborator to serve

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

pub use logging::{build_filter, init_logging, tracing_level, LoggingError};
pub use metrics::{AttemptOutcome, GateMetrics};
