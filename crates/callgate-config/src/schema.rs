//! Configuration schema definitions.
//!
//! Every section has documented defaults, so an empty document is a valid
//! configuration. Durations are written as human-readable strings (`"30s"`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use validator::{Validate, ValidationError, ValidationErrors};

fn default_true() -> bool {
    true
}

/// Main gate configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GateConfig {
    /// Response cache
    #[validate(nested)]
    pub cache: CacheConfig,

    /// Short and medium term rate limits
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,

    /// Hard daily and monthly caps
    #[validate(nested)]
    pub quota: QuotaConfig,

    /// Upstream health tracking
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry policy for transient upstream failures
    #[validate(nested)]
    pub retry: RetryConfig,

    /// Per-attempt time budget
    #[validate(nested)]
    pub timeout: TimeoutConfig,

    /// Model price table
    #[validate(nested)]
    pub pricing: PricingConfig,

    /// Usage alert thresholds
    #[serde(default = "default_alerts")]
    #[validate(nested)]
    pub alerts: Vec<AlertConfig>,

    /// Durable state location
    pub storage: StorageConfig,

    /// Logging and metrics
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            quota: QuotaConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
            pricing: PricingConfig::default(),
            alerts: default_alerts(),
            storage: StorageConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl GateConfig {
    /// Validate field ranges and cross-field constraints
    ///
    /// # Errors
    /// Returns validation errors if configuration is invalid
    pub fn validate_config(&self) -> Result<(), ValidationErrors> {
        let mut errors = match self.validate() {
            Ok(()) => ValidationErrors::new(),
            Err(errors) => errors,
        };

        if self.rate_limit.burst_size == 0 {
            errors.add("rate_limit", invalid("burst_size must be at least 1"));
        }
        if self.circuit_breaker.max_break_duration < self.circuit_breaker.break_duration {
            errors.add(
                "circuit_breaker",
                invalid("max_break_duration must not be shorter than break_duration"),
            );
        }
        if self.retry.max_delay < self.retry.base_delay {
            errors.add("retry", invalid("max_delay must not be shorter than base_delay"));
        }
        if self.alerts.iter().any(|a| a.percent <= 0.0) {
            errors.add("alerts", invalid("alert percent must be greater than zero"));
        }
        if let Some(budget) = self.quota.monthly_budget_usd {
            if !budget.is_finite() || budget < 0.0 {
                errors.add("quota", invalid("monthly_budget_usd must be a non-negative number"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn invalid(message: &'static str) -> ValidationError {
    let mut error = ValidationError::new("invalid");
    error.message = Some(message.into());
    error
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether results are cached at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entries held in the in-process tier
    #[validate(range(min = 1, max = 1_000_000))]
    pub memory_capacity: u64,

    /// Base time-to-live for new entries
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Random TTL spread as a fraction of the base (0.1 = plus or minus 10%)
    #[validate(range(min = 0.0, max = 0.5))]
    pub ttl_jitter: f64,

    /// Payloads larger than this are compressed in the persistent tier
    pub compress_threshold_bytes: usize,

    /// Size cap of the persistent tier; least recently used entries go first
    #[validate(range(min = 1))]
    pub max_persistent_bytes: u64,

    /// Interval of the background expiry sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Upper bound on waiting for another caller's in-flight computation
    #[serde(with = "humantime_serde")]
    pub flight_wait_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_capacity: 100,
            default_ttl: Duration::from_secs(7 * 24 * 3600),
            ttl_jitter: 0.1,
            compress_threshold_bytes: 4096,
            max_persistent_bytes: 256 * 1024 * 1024,
            sweep_interval: Duration::from_secs(300),
            flight_wait_timeout: None,
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether the token bucket and window are enforced (quotas always are)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Token bucket refill rate
    #[validate(range(min = 1))]
    pub requests_per_minute: u32,

    /// Token bucket capacity
    pub burst_size: u32,

    /// Requests allowed within the sliding window
    #[validate(range(min = 1))]
    pub requests_per_hour: u32,

    /// Sliding window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Longest time `acquire` blocks before failing (zero fails fast)
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,

    /// Callers allowed to wait at once before new ones are rejected
    #[validate(range(min = 1, max = 100_000))]
    pub max_queue: usize,

    /// How often dirty limiter state is flushed to storage
    #[serde(with = "humantime_serde")]
    pub persist_interval: Duration,

    /// Adjust the refill rate from upstream throttling signals
    pub adaptive: bool,

    /// Rate multiplier applied on a throttling signal
    #[validate(range(min = 0.1, max = 1.0))]
    pub adaptive_decrease_factor: f64,

    /// Rate multiplier applied after a run of successes
    #[validate(range(min = 1.0, max = 2.0))]
    pub adaptive_increase_factor: f64,

    /// Consecutive successes needed before raising the rate
    #[validate(range(min = 1))]
    pub adaptive_recovery_successes: u32,

    /// Floor for the adapted rate
    #[validate(range(min = 1))]
    pub adaptive_min_rpm: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 50,
            burst_size: 10,
            requests_per_hour: 1000,
            window: Duration::from_secs(3600),
            max_wait: Duration::from_secs(30),
            max_queue: 64,
            persist_interval: Duration::from_secs(30),
            adaptive: false,
            adaptive_decrease_factor: 0.9,
            adaptive_increase_factor: 1.05,
            adaptive_recovery_successes: 10,
            adaptive_min_rpm: 10,
        }
    }
}

/// Hard caps; `None` means unlimited
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct QuotaConfig {
    /// Tokens per UTC day
    pub daily_token_quota: Option<u64>,

    /// Spend per UTC month, in USD
    pub monthly_budget_usd: Option<f64>,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Whether the breaker gates calls
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Failure ratio above which the circuit opens
    #[validate(range(min = 0.01, max = 1.0))]
    pub failure_ratio: f64,

    /// Samples required before the ratio is evaluated
    #[validate(range(min = 1, max = 10_000))]
    pub min_throughput: u32,

    /// Most recent outcomes retained
    #[validate(range(min = 1, max = 10_000))]
    pub window_size: u32,

    /// Outcomes older than this are discarded
    #[serde(with = "humantime_serde")]
    pub sample_window: Duration,

    /// Open duration after the first trip
    #[serde(with = "humantime_serde")]
    pub break_duration: Duration,

    /// Growth factor of the open duration per consecutive trip
    #[validate(range(min = 1.0, max = 10.0))]
    pub break_multiplier: f64,

    /// Cap on the open duration
    #[serde(with = "humantime_serde")]
    pub max_break_duration: Duration,

    /// Probe calls allowed concurrently while half-open
    #[validate(range(min = 1, max = 100))]
    pub half_open_max_probes: u32,

    /// Probe successes needed to close the circuit
    #[validate(range(min = 1, max = 100))]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_ratio: 0.5,
            min_throughput: 10,
            window_size: 20,
            sample_window: Duration::from_secs(60),
            break_duration: Duration::from_secs(30),
            break_multiplier: 2.0,
            max_break_duration: Duration::from_secs(300),
            half_open_max_probes: 1,
            success_threshold: 1,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    /// Physical attempts per logical request, including the first
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Cap on any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff multiplier
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,

    /// Jitter factor (0.0 - 1.0)
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Budget for a single upstream attempt
    #[serde(with = "humantime_serde")]
    pub attempt: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            attempt: Duration::from_secs(60),
        }
    }
}

/// Price of one model, in USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct ModelPrice {
    /// Prompt token price
    #[validate(range(min = 0.0))]
    pub input_per_million: f64,

    /// Completion token price
    #[validate(range(min = 0.0))]
    pub output_per_million: f64,
}

impl ModelPrice {
    /// Create a price entry
    #[must_use]
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Model price table
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PricingConfig {
    /// Model charged when a generator does not name one
    #[validate(length(min = 1))]
    pub default_model: String,

    /// Known models
    pub models: HashMap<String, ModelPrice>,

    /// Price used for models missing from the table
    #[validate(nested)]
    pub fallback: ModelPrice,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let models = HashMap::from([
            ("claude-3-5-sonnet".to_string(), ModelPrice::new(3.0, 15.0)),
            ("claude-3-haiku".to_string(), ModelPrice::new(0.25, 1.25)),
            ("claude-3-opus".to_string(), ModelPrice::new(15.0, 75.0)),
        ]);
        Self {
            default_model: "claude-3-5-sonnet".to_string(),
            models,
            fallback: ModelPrice::new(3.0, 15.0),
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational
    #[default]
    Info,
    /// Needs attention
    Warning,
    /// Spend is close to a hard cap
    Critical,
}

impl AlertSeverity {
    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// A usage threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AlertConfig {
    /// Percent of a quota at which the alert fires
    #[validate(range(min = 0.0, max = 100.0))]
    pub percent: f64,

    /// Message attached to the alert; defaults to "<percent>% of quota used"
    #[serde(default)]
    pub message: Option<String>,

    /// Severity
    #[serde(default)]
    pub severity: AlertSeverity,
}

impl AlertConfig {
    /// Create a threshold with the default message
    #[must_use]
    pub fn new(percent: f64, severity: AlertSeverity) -> Self {
        Self {
            percent,
            message: None,
            severity,
        }
    }

    /// Message text for this threshold
    #[must_use]
    pub fn message_text(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("{}% of quota used", self.percent))
    }
}

fn default_alerts() -> Vec<AlertConfig> {
    vec![
        AlertConfig::new(50.0, AlertSeverity::Info),
        AlertConfig::new(80.0, AlertSeverity::Warning),
        AlertConfig::new(90.0, AlertSeverity::Critical),
    ]
}

/// Durable state location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file; state is kept in memory when unset
    pub path: Option<PathBuf>,
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Logging configuration
    #[validate(nested)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[validate(nested)]
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    #[validate(length(min = 1))]
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: LogFormat,

    /// Extra filter directives (e.g. "rusqlite=warn")
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            filter: None,
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON formatted logs
    Json,
    /// Human-readable pretty logs
    #[default]
    Pretty,
    /// Compact single-line logs
    Compact,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics are collected
    pub enabled: bool,

    /// Histogram buckets for upstream latency, in seconds
    #[validate(length(min = 1))]
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            latency_buckets: vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GateConfig::default();
        assert!(config.validate_config().is_ok());
        assert_eq!(config.cache.memory_capacity, 100);
        assert!(config.quota.daily_token_quota.is_none());
    }

    #[test]
    fn test_default_alerts() {
        let config: GateConfig = serde_yaml::from_str("{}").expect("deserialize");
        let percents: Vec<f64> = config.alerts.iter().map(|a| a.percent).collect();
        assert_eq!(percents, vec![50.0, 80.0, 90.0]);
        assert_eq!(config.alerts[0].message_text(), "50% of quota used");
        assert_eq!(config.alerts[2].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_default_pricing() {
        let pricing = PricingConfig::default();
        let sonnet = pricing.models.get("claude-3-5-sonnet").expect("sonnet price");
        assert_eq!(sonnet.input_per_million, 3.0);
        assert_eq!(sonnet.output_per_million, 15.0);
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.failure_ratio, 0.5);
        assert_eq!(config.min_throughput, 10);
        assert_eq!(config.half_open_max_probes, 1);
    }

    #[test]
    fn test_humantime_durations() {
        let yaml = r#"
retry:
  base_delay: 250ms
  max_delay: 5s
circuit_breaker:
  break_duration: 1m
"#;
        let config: GateConfig = serde_yaml::from_str(yaml).expect("deserialize");
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_secs(5));
        assert_eq!(config.circuit_breaker.break_duration, Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_cross_field_validation() {
        let mut config = GateConfig::default();
        config.retry.base_delay = Duration::from_secs(60);
        config.retry.max_delay = Duration::from_secs(1);
        assert!(config.validate_config().is_err());

        let mut config = GateConfig::default();
        config.circuit_breaker.failure_ratio = 1.5;
        assert!(config.validate_config().is_err());

        let mut config = GateConfig::default();
        config.quota.monthly_budget_usd = Some(-1.0);
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn test_yaml_serialization() {
        let config = GateConfig::default();
        let yaml = serde_yaml::to_string(&config).expect("serialize");
        assert!(yaml.contains("rate_limit:"));
        assert!(yaml.contains("requests_per_minute: 50"));
    }
}
