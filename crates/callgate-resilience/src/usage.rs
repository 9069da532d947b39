//! Cost and token accounting.
//!
//! Every physical attempt (and every cache hit) is appended to the usage
//! ledger. Charging is idempotent per request id: an id is charged at most
//! the largest amount any single attempt reported, so retries never bill a
//! logical request twice.

use crate::alerts::{AlertCallback, AlertEvent, AlertManager};
use crate::persist;
use crate::pricing::PriceTable;
use crate::rate_limiter::RateLimiter;
use callgate_config::AlertConfig;
use callgate_core::{
    Charge, GateResult, ModelUsage, SharedClock, Stage, UsageLedger, UsagePeriod, UsageRecord,
    UsageStatus, UsageSummary,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Request ids whose charge is remembered in memory before falling back to the ledger
const CHARGED_CACHE_LIMIT: usize = 10_000;

/// One attempt or cache hit to record
#[derive(Debug, Clone)]
pub struct UsageEntry {
    /// Idempotency key shared by all attempts of a logical request
    pub request_id: String,
    /// Model to price; the price table default when `None`
    pub model: Option<String>,
    /// Stage, when known
    pub stage: Option<Stage>,
    /// Outcome
    pub status: UsageStatus,
    /// 1-based attempt number, 0 for cache hits
    pub attempt: u32,
    /// Prompt tokens reported
    pub input_tokens: u64,
    /// Completion tokens reported
    pub output_tokens: u64,
}

impl UsageEntry {
    /// Entry for an upstream attempt
    pub fn attempt(
        request_id: impl Into<String>,
        status: UsageStatus,
        attempt: u32,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            model: None,
            stage: None,
            status,
            attempt,
            input_tokens,
            output_tokens,
        }
    }

    /// Zero-cost entry for a cache hit
    pub fn cache_hit(request_id: impl Into<String>, stage: Option<Stage>) -> Self {
        Self {
            request_id: request_id.into(),
            model: None,
            stage,
            status: UsageStatus::CacheHit,
            attempt: 0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Price against `model`
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Tag with `stage`
    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }
}

/// Result of recording one entry
#[derive(Debug, Clone, PartialEq)]
pub struct UsageOutcome {
    /// Cost the attempt reported
    pub cost: f64,
    /// Delta actually added to cumulative totals
    pub charged: Charge,
    /// Alerts fired by this update
    pub alerts: Vec<AlertEvent>,
}

/// Records usage and keeps quota counters and alerts current
pub struct UsageTracker {
    prices: PriceTable,
    ledger: Arc<dyn UsageLedger>,
    clock: SharedClock,
    charged: Mutex<HashMap<String, Charge>>,
    limiter: Option<Arc<RateLimiter>>,
    alerts: Option<Arc<AlertManager>>,
}

impl std::fmt::Debug for UsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageTracker")
            .field("tracked_requests", &self.charged.lock().len())
            .field("limiter", &self.limiter.is_some())
            .field("alerts", &self.alerts.is_some())
            .finish_non_exhaustive()
    }
}

impl UsageTracker {
    /// Create a tracker writing to `ledger`
    #[must_use]
    pub fn new(prices: PriceTable, ledger: Arc<dyn UsageLedger>, clock: SharedClock) -> Self {
        Self {
            prices,
            ledger,
            clock,
            charged: Mutex::new(HashMap::new()),
            limiter: None,
            alerts: None,
        }
    }

    /// Count charged usage against this limiter's quotas
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Evaluate these alerts after each charge
    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Price table in use
    #[must_use]
    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Record one attempt or cache hit
    ///
    /// In-memory quota counters and alerts are updated even when the ledger
    /// append fails.
    ///
    /// # Errors
    /// Returns `Storage` when the ledger cannot be read or appended to
    pub async fn track_usage(&self, entry: UsageEntry) -> GateResult<UsageOutcome> {
        let model = entry
            .model
            .clone()
            .unwrap_or_else(|| self.prices.default_model().to_string());

        let reported = if entry.status == UsageStatus::CacheHit {
            Charge::default()
        } else {
            Charge {
                input_tokens: entry.input_tokens,
                output_tokens: entry.output_tokens,
                cost: self.prices.cost(&model, entry.input_tokens, entry.output_tokens),
            }
        };

        let charged = if reported == Charge::default() {
            Charge::default()
        } else {
            self.charge(&entry.request_id, &reported).await?
        };

        if let Some(limiter) = &self.limiter {
            limiter.record_consumption(charged.total_tokens(), charged.cost);
        }

        let record = UsageRecord {
            request_id: entry.request_id.clone(),
            model,
            stage: entry.stage,
            status: entry.status,
            attempt: entry.attempt,
            reported,
            charged,
            created_at: self.clock.wall(),
        };
        let ledger = Arc::clone(&self.ledger);
        let appended = persist::blocking(move || ledger.append(&record)).await;

        let alerts = self.evaluate_alerts().await;

        debug!(
            request_id = %entry.request_id,
            status = entry.status.as_str(),
            attempt = entry.attempt,
            reported_cost = reported.cost,
            charged_cost = charged.cost,
            "Usage recorded"
        );

        appended?;
        Ok(UsageOutcome {
            cost: reported.cost,
            charged,
            alerts,
        })
    }

    /// Record an attempt priced at the default model and return its cost
    ///
    /// # Errors
    /// See [`UsageTracker::track_usage`]
    pub async fn track(
        &self,
        request_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        status: UsageStatus,
    ) -> GateResult<f64> {
        let entry = UsageEntry::attempt(request_id, status, 1, input_tokens, output_tokens);
        self.track_usage(entry).await.map(|outcome| outcome.cost)
    }

    /// Totals for `period` from the ledger
    ///
    /// # Errors
    /// Returns `Storage` when the ledger cannot be queried
    pub async fn usage_stats(&self, period: UsagePeriod) -> GateResult<UsageSummary> {
        let since = period.since(self.clock.wall());
        let ledger = Arc::clone(&self.ledger);
        let totals = persist::blocking(move || ledger.summarize(since)).await?;
        Ok(UsageSummary { period, since, totals })
    }

    /// Per-model totals for `period`, most expensive first
    ///
    /// # Errors
    /// Returns `Storage` when the ledger cannot be queried
    pub async fn usage_by_model(&self, period: UsagePeriod) -> GateResult<Vec<ModelUsage>> {
        let since = period.since(self.clock.wall());
        let ledger = Arc::clone(&self.ledger);
        persist::blocking(move || ledger.summarize_by_model(since)).await
    }

    /// Register an alert threshold
    ///
    /// # Errors
    /// `InvalidRequest` for a bad threshold, `Configuration` when the tracker
    /// has no alert manager
    pub fn add_alert(&self, config: AlertConfig, callback: Option<AlertCallback>) -> GateResult<()> {
        match &self.alerts {
            Some(alerts) => alerts.add_alert(config, callback),
            None => Err(callgate_core::GateError::configuration(
                "usage tracker was built without an alert manager",
            )),
        }
    }

    /// Apply the idempotency rule and remember the new cumulative charge
    async fn charge(&self, request_id: &str, reported: &Charge) -> GateResult<Charge> {
        let known = self.charged.lock().contains_key(request_id);
        let from_ledger = if known {
            None
        } else {
            let ledger = Arc::clone(&self.ledger);
            let id = request_id.to_string();
            persist::blocking(move || ledger.charged_for(&id)).await?
        };

        let mut charged = self.charged.lock();
        if !charged.contains_key(request_id) && charged.len() >= CHARGED_CACHE_LIMIT {
            charged.clear();
        }
        let already = charged
            .entry(request_id.to_string())
            .or_insert_with(|| from_ledger.unwrap_or_default());
        let delta = reported.excess_over(already);
        *already = already.plus(&delta);
        Ok(delta)
    }

    async fn evaluate_alerts(&self) -> Vec<AlertEvent> {
        let (Some(limiter), Some(alerts)) = (&self.limiter, &self.alerts) else {
            return Vec::new();
        };
        let fired = alerts.evaluate(&limiter.quota_usage());
        if !fired.is_empty() {
            if let Err(e) = alerts.persist().await {
                warn!(error = %e, "Failed to persist alert state");
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callgate_config::{QuotaConfig, RateLimitConfig};
    use callgate_core::MockClock;
    use callgate_storage::MemoryStore;

    fn tracker(store: &Arc<MemoryStore>, clock: &MockClock) -> UsageTracker {
        UsageTracker::new(PriceTable::default(), store.clone(), clock.shared())
    }

    #[tokio::test]
    async fn test_same_request_id_charged_once() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store, &clock);

        let first = tracker.track("req-1", 1000, 500, UsageStatus::Success).await.unwrap();
        let second = tracker.track("req-1", 1000, 500, UsageStatus::Success).await.unwrap();
        assert!((first - 0.0105).abs() < 1e-12);
        assert!((second - first).abs() < 1e-12);

        let stats = tracker.usage_stats(UsagePeriod::Today).await.unwrap();
        assert!((stats.totals.cost - 0.0105).abs() < 1e-12);
        assert_eq!(stats.totals.requests, 1);
        assert_eq!(stats.totals.attempts, 2);
        assert_eq!(store.ledger_len(), 2);
    }

    #[tokio::test]
    async fn test_retry_charges_only_the_excess() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store, &clock);

        let failed = UsageEntry::attempt("req-2", UsageStatus::Retried, 1, 400, 0);
        let outcome = tracker.track_usage(failed).await.unwrap();
        assert_eq!(outcome.charged.input_tokens, 400);

        let ok = UsageEntry::attempt("req-2", UsageStatus::Success, 2, 1000, 200);
        let outcome = tracker.track_usage(ok).await.unwrap();
        assert_eq!(outcome.charged.input_tokens, 600);
        assert_eq!(outcome.charged.output_tokens, 200);

        let totals = tracker.usage_stats(UsagePeriod::All).await.unwrap().totals;
        assert_eq!(totals.input_tokens, 1000);
        assert_eq!(totals.failed_attempts, 1);
    }

    #[tokio::test]
    async fn test_idempotency_survives_restart_through_ledger() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::new());

        tracker(&store, &clock)
            .track("req-3", 100, 100, UsageStatus::Success)
            .await
            .unwrap();
        let outcome = tracker(&store, &clock)
            .track_usage(UsageEntry::attempt("req-3", UsageStatus::Success, 1, 100, 100))
            .await
            .unwrap();

        assert_eq!(outcome.charged, Charge::default());
    }

    #[tokio::test]
    async fn test_cache_hits_are_free() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store, &clock);

        let outcome = tracker
            .track_usage(UsageEntry::cache_hit("req-4", Some(Stage::Analysis)))
            .await
            .unwrap();
        assert!(outcome.cost.abs() < f64::EPSILON);

        let totals = tracker.usage_stats(UsagePeriod::Today).await.unwrap().totals;
        assert_eq!(totals.cache_hits, 1);
        assert_eq!(totals.requests, 0);
    }

    #[tokio::test]
    async fn test_usage_by_model() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store, &clock);

        tracker
            .track_usage(UsageEntry::attempt("a", UsageStatus::Success, 1, 1000, 1000).with_model("claude-3-opus"))
            .await
            .unwrap();
        tracker
            .track_usage(UsageEntry::attempt("b", UsageStatus::Success, 1, 1000, 1000).with_model("claude-3-haiku"))
            .await
            .unwrap();

        let by_model = tracker.usage_by_model(UsagePeriod::Month).await.unwrap();
        assert_eq!(by_model[0].model, "claude-3-opus");
        assert!((by_model[0].cost - 0.09).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_charges_feed_limiter_and_alerts() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::new());
        let quota = QuotaConfig {
            daily_token_quota: Some(1000),
            monthly_budget_usd: None,
        };
        let limiter = Arc::new(
            RateLimiter::new("test", RateLimitConfig::default(), &quota, PriceTable::default(), clock.shared())
                .unwrap(),
        );
        let alerts = Arc::new(
            AlertManager::new(&[AlertConfig::new(80.0, callgate_config::AlertSeverity::Warning)], clock.shared())
                .with_store(store.clone()),
        );
        let tracker = tracker(&store, &clock)
            .with_limiter(limiter.clone())
            .with_alerts(alerts.clone());

        let outcome = tracker
            .track_usage(UsageEntry::attempt("x", UsageStatus::Success, 1, 500, 350))
            .await
            .unwrap();
        assert_eq!(outcome.alerts.len(), 1);
        assert_eq!(limiter.quota_usage().tokens_today, 850);

        let outcome = tracker
            .track_usage(UsageEntry::attempt("y", UsageStatus::Success, 1, 50, 0))
            .await
            .unwrap();
        assert!(outcome.alerts.is_empty());
        assert_eq!(alerts.recent_alerts(10).len(), 1);
    }

    #[tokio::test]
    async fn test_add_alert_without_manager_fails() {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store, &clock);
        let result = tracker.add_alert(AlertConfig::new(50.0, callgate_config::AlertSeverity::Info), None);
        assert_eq!(result.unwrap_err().error_code(), "configuration_error");
    }
}
