//! # Callgate Configuration
//!
//! Configuration management for the call gate, including:
//! - Configuration schema, defaults and validation
//! - Loading from YAML/TOML/JSON files or strings
//! - Environment variable substitution and `CALLGATE_*` overrides

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod loader;
pub mod schema;

// Re-export main types
pub use loader::{load_config, ConfigError, ConfigLoader, ConfigSource, ENV_PREFIX};
pub use schema::{
    AlertConfig, AlertSeverity, CacheConfig, CircuitBreakerConfig, GateConfig, LogFormat,
    LoggingConfig, MetricsConfig, ModelPrice, ObservabilityConfig, PricingConfig, QuotaConfig,
    RateLimitConfig, RetryConfig, StorageConfig, TimeoutConfig,
};
