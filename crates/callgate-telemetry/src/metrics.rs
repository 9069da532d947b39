//! Prometheus metrics for the gate.
//!
//! Covers:
//! - Cache lookups by tier and result, and coalesced single-flight waiters
//! - Upstream attempts and latency per stage
//! - Rate-limit and quota rejections
//! - Circuit state and state transitions per breaker
//! - Tokens, cost and alerts

use callgate_config::MetricsConfig;
use callgate_core::Stage;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tracing::{debug, error};

const NAMESPACE: &str = "callgate";

/// Outcome label for an upstream attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Generator returned a response
    Success,
    /// Transient failure, eligible for retry
    Retryable,
    /// Permanent failure
    Failed,
    /// Attempt exceeded its time budget
    Timeout,
}

impl AttemptOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retryable => "retryable",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

/// Metric collectors for one gate instance
pub struct GateMetrics {
    enabled: bool,
    registry: Registry,
    cache_operations: CounterVec,
    coalesced: IntCounter,
    upstream_attempts: CounterVec,
    upstream_latency: HistogramVec,
    rejections: CounterVec,
    circuit_state: GaugeVec,
    circuit_transitions: CounterVec,
    tokens_total: CounterVec,
    cost_total: CounterVec,
    alerts_total: CounterVec,
}

impl GateMetrics {
    /// Create the collectors and register them on a fresh registry
    ///
    /// # Errors
    /// Returns error if a collector cannot be built or registered
    pub fn new(config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cache_operations = CounterVec::new(
            Opts::new("cache_operations_total", "Cache lookups by tier and result")
                .namespace(NAMESPACE),
            &["tier", "result"],
        )?;
        registry.register(Box::new(cache_operations.clone()))?;

        let coalesced = IntCounter::with_opts(
            Opts::new(
                "cache_coalesced_total",
                "Callers that shared an in-flight computation",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(coalesced.clone()))?;

        let upstream_attempts = CounterVec::new(
            Opts::new("upstream_attempts_total", "Physical generator calls")
                .namespace(NAMESPACE),
            &["stage", "outcome"],
        )?;
        registry.register(Box::new(upstream_attempts.clone()))?;

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new(
                "upstream_duration_seconds",
                "Generator call latency in seconds",
            )
            .namespace(NAMESPACE)
            .buckets(config.latency_buckets.clone()),
            &["stage"],
        )?;
        registry.register(Box::new(upstream_latency.clone()))?;

        let rejections = CounterVec::new(
            Opts::new(
                "rejections_total",
                "Calls refused before reaching the generator",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        registry.register(Box::new(rejections.clone()))?;

        let circuit_state = GaugeVec::new(
            Opts::new(
                "circuit_state",
                "Circuit state (0=closed, 1=half-open, 2=open, 3=isolated)",
            )
            .namespace(NAMESPACE),
            &["breaker"],
        )?;
        registry.register(Box::new(circuit_state.clone()))?;

        let circuit_transitions = CounterVec::new(
            Opts::new("circuit_transitions_total", "Breaker state changes by target state")
                .namespace(NAMESPACE),
            &["breaker", "to", "cause"],
        )?;
        registry.register(Box::new(circuit_transitions.clone()))?;

        let tokens_total = CounterVec::new(
            Opts::new("tokens_total", "Charged tokens").namespace(NAMESPACE),
            &["model", "type"],
        )?;
        registry.register(Box::new(tokens_total.clone()))?;

        let cost_total = CounterVec::new(
            Opts::new("cost_usd_total", "Charged cost in USD").namespace(NAMESPACE),
            &["model"],
        )?;
        registry.register(Box::new(cost_total.clone()))?;

        let alerts_total = CounterVec::new(
            Opts::new("alerts_total", "Quota alerts fired").namespace(NAMESPACE),
            &["severity"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;

        debug!(enabled = config.enabled, "Gate metrics initialized");

        Ok(Self {
            enabled: config.enabled,
            registry,
            cache_operations,
            coalesced,
            upstream_attempts,
            upstream_latency,
            rejections,
            circuit_state,
            circuit_transitions,
            tokens_total,
            cost_total,
            alerts_total,
        })
    }

    /// Whether recording is switched on
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record a cache lookup; `tier` is `None` for a miss
    pub fn record_cache_lookup(&self, tier: Option<&str>) {
        if !self.enabled {
            return;
        }
        let (tier, result) = match tier {
            Some(tier) => (tier, "hit"),
            None => ("any", "miss"),
        };
        self.cache_operations
            .with_label_values(&[tier, result])
            .inc();
    }

    /// Record a caller that received another caller's computation
    pub fn record_coalesced(&self) {
        if self.enabled {
            self.coalesced.inc();
        }
    }

    /// Record one physical generator call
    pub fn record_attempt(&self, stage: Stage, outcome: AttemptOutcome, latency: Duration) {
        if !self.enabled {
            return;
        }
        self.upstream_attempts
            .with_label_values(&[stage.as_str(), outcome.as_str()])
            .inc();
        self.upstream_latency
            .with_label_values(&[stage.as_str()])
            .observe(latency.as_secs_f64());
    }

    /// Record a call refused by the breaker, limiter or a quota
    pub fn record_rejection(&self, reason: &str) {
        if self.enabled {
            self.rejections.with_label_values(&[reason]).inc();
        }
    }

    /// Publish the current circuit state gauge value
    pub fn set_circuit_state(&self, breaker: &str, gauge: i64) {
        if self.enabled {
            #[allow(clippy::cast_precision_loss)]
            self.circuit_state
                .with_label_values(&[breaker])
                .set(gauge as f64);
        }
    }

    /// Count a breaker state change
    pub fn record_circuit_transition(&self, breaker: &str, to: &str, cause: &str) {
        if self.enabled {
            self.circuit_transitions
                .with_label_values(&[breaker, to, cause])
                .inc();
        }
    }

    /// Record charged tokens and cost for a model
    pub fn record_usage(&self, model: &str, input_tokens: u64, output_tokens: u64, cost: f64) {
        if !self.enabled {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.tokens_total
                .with_label_values(&[model, "input"])
                .inc_by(input_tokens as f64);
            self.tokens_total
                .with_label_values(&[model, "output"])
                .inc_by(output_tokens as f64);
        }
        if cost > 0.0 {
            self.cost_total.with_label_values(&[model]).inc_by(cost);
        }
    }

    /// Record a fired quota alert
    pub fn record_alert(&self, severity: &str) {
        if self.enabled {
            self.alerts_total.with_label_values(&[severity]).inc();
        }
    }

    /// Render all collectors in the Prometheus text exposition format
    #[must_use]
    pub fn encode_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Get the Prometheus registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for GateMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateMetrics")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> GateMetrics {
        GateMetrics::new(&MetricsConfig::default()).unwrap()
    }

    #[test]
    fn test_metrics_creation() {
        assert!(GateMetrics::new(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn test_cache_and_attempts() {
        let metrics = metrics();
        metrics.record_cache_lookup(Some("memory"));
        metrics.record_cache_lookup(None);
        metrics.record_coalesced();
        metrics.record_attempt(
            Stage::Analysis,
            AttemptOutcome::Success,
            Duration::from_millis(250),
        );

        let output = metrics.encode_text();
        assert!(output.contains("callgate_cache_operations_total"));
        assert!(output.contains("tier=\"memory\""));
        assert!(output.contains("callgate_cache_coalesced_total 1"));
        assert!(output.contains("callgate_upstream_attempts_total"));
        assert!(output.contains("stage=\"analysis\""));
        assert!(output.contains("callgate_upstream_duration_seconds_bucket"));
    }

    #[test]
    fn test_usage_and_state() {
        let metrics = metrics();
        metrics.record_usage("claude-3-haiku", 100, 50, 0.0001);
        metrics.set_circuit_state("upstream", 2);
        metrics.record_circuit_transition("upstream", "open", "failure_ratio");
        metrics.record_rejection("circuit_open");
        metrics.record_alert("warning");

        let output = metrics.encode_text();
        assert!(output.contains("callgate_tokens_total"));
        assert!(output.contains("model=\"claude-3-haiku\""));
        assert!(output.contains("callgate_cost_usd_total"));
        assert!(output.contains("callgate_circuit_state{breaker=\"upstream\"} 2"));
        assert!(output.contains("callgate_circuit_transitions_total{"));
        assert!(output.contains("cause=\"failure_ratio\""));
        assert!(output.contains("to=\"open\""));
        assert!(output.contains("reason=\"circuit_open\""));
        assert!(output.contains("severity=\"warning\""));
    }

    #[test]
    fn test_disabled_records_nothing() {
        let config = MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        };
        let metrics = GateMetrics::new(&config).unwrap();
        metrics.record_rejection("queue_full");
        metrics.record_usage("m", 1, 1, 1.0);

        let output = metrics.encode_text();
        assert!(!output.contains("queue_full"));
        assert!(!output.contains("model=\"m\""));
    }

    #[test]
    fn test_text_format() {
        let metrics = metrics();
        metrics.record_coalesced();
        let output = metrics.encode_text();
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }
}
