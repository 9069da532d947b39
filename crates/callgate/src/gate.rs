//! The gate orchestrator.
//!
//! Every call goes cache → single-flight → circuit breaker → rate limiter →
//! generator (with retries), and every physical attempt is reported to the
//! breaker and the usage tracker exactly once.

use crate::maintenance::MaintenanceHandle;
use crate::request::{GateRequest, GateResponse, ResponseSource, TokenUsage};
use callgate_config::{AlertConfig, GateConfig};
use callgate_core::{
    CacheKey, GateError, GateResult, Generator, KeyValueStore, ModelUsage, Payload, QuotaKind,
    SharedClock, Stage, UsagePeriod, UsageStatus, UsageSummary,
};
use callgate_resilience::{
    AlertCallback, AlertEvent, AlertManager, CacheStats, CacheTier, CircuitBreaker,
    CircuitSnapshot, CircuitState, CircuitTransition, ComputeSource, Invalidated, QuotaUsage,
    RateLimiter, ResponseCache, RetryPolicy, TimeoutManager, UsageEntry, UsageTracker,
};
use callgate_telemetry::{AttemptOutcome, GateMetrics};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Storage key for the set of isolated breakers
pub(crate) const ISOLATED_KEY: &str = "breakers:isolated";

/// Resilient call gate; cheap to clone
#[derive(Clone)]
pub struct Gate {
    pub(crate) inner: Arc<GateInner>,
}

pub(crate) struct GateInner {
    pub(crate) config: GateConfig,
    pub(crate) generator: Option<Arc<dyn Generator>>,
    pub(crate) primary: Arc<CircuitBreaker>,
    pub(crate) breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    pub(crate) isolated: Mutex<BTreeSet<String>>,
    pub(crate) cache: Arc<ResponseCache>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) usage: UsageTracker,
    pub(crate) alerts: Arc<AlertManager>,
    pub(crate) retry: RetryPolicy,
    pub(crate) timeouts: TimeoutManager,
    pub(crate) metrics: Arc<GateMetrics>,
    pub(crate) kv: Arc<dyn KeyValueStore>,
    pub(crate) clock: SharedClock,
    pub(crate) maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("breaker", &self.inner.primary.name())
            .field("limiter", &self.inner.limiter)
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

impl Gate {
    /// Start building a gate
    #[must_use]
    pub fn builder() -> crate::GateBuilder {
        crate::GateBuilder::new()
    }

    /// Run a request through the gate using the configured generator
    ///
    /// # Errors
    /// `Configuration` when the gate was built without a generator, and
    /// otherwise see [`Gate::execute_with`]
    pub async fn execute(&self, request: GateRequest) -> GateResult<GateResponse> {
        let generator = self
            .inner
            .generator
            .clone()
            .ok_or_else(|| GateError::configuration("gate has no default generator"))?;
        self.execute_with(request, generator.as_ref()).await
    }

    /// Run a request through the gate using `generator`
    ///
    /// # Errors
    /// - `CircuitOpen` when the generator's breaker rejects the call
    /// - `RateLimitExceeded` / `QuotaExceeded` from the rate limiter
    /// - `Upstream` once retries are exhausted or the failure is permanent
    /// - `Cancelled` / `Timeout` when a shared computation was abandoned
    pub async fn execute_with(
        &self,
        request: GateRequest,
        generator: &dyn Generator,
    ) -> GateResult<GateResponse> {
        let key = request.cache_key();
        let span = info_span!(
            "gate.execute",
            stage = %request.stage,
            key = %key.short(),
            request_id = %request.request_id,
        );
        self.run(request, key, generator).instrument(span).await
    }

    async fn run(
        &self,
        request: GateRequest,
        key: CacheKey,
        generator: &dyn Generator,
    ) -> GateResult<GateResponse> {
        let inner = &self.inner;

        if let Some((payload, tier)) = inner.cache.get_with_tier(&key).await {
            inner.metrics.record_cache_lookup(Some(tier_label(tier)));
            self.record_cache_hit(&request, generator).await;
            debug!("Served from cache");
            return Ok(self.respond(request, key, payload, ResponseSource::Cache, None));
        }
        inner.metrics.record_cache_lookup(None);

        let breaker = self.breaker_for(generator.id())?;
        let mut usage = None;
        let result = {
            let usage_slot = &mut usage;
            let request = &request;
            let breaker = &breaker;
            inner
                .cache
                .compute_once(&key, Some(request.stage), request.ttl, move || {
                    self.call_upstream(request, generator, breaker, usage_slot)
                })
                .await
        };

        match result {
            Ok((payload, ComputeSource::Computed)) => {
                Ok(self.respond(request, key, payload, ResponseSource::Upstream, usage))
            }
            Ok((payload, ComputeSource::Cached)) => {
                self.record_cache_hit(&request, generator).await;
                Ok(self.respond(request, key, payload, ResponseSource::Cache, None))
            }
            Ok((payload, ComputeSource::Shared)) => {
                inner.metrics.record_coalesced();
                self.record_cache_hit(&request, generator).await;
                Ok(self.respond(request, key, payload, ResponseSource::Coalesced, None))
            }
            Err(e) => {
                debug!(error = %e, code = e.error_code(), "Gate call failed");
                Err(e)
            }
        }
    }

    /// One logical upstream call: breaker, limiter, then the retry loop
    async fn call_upstream(
        &self,
        request: &GateRequest,
        generator: &dyn Generator,
        breaker: &CircuitBreaker,
        usage_slot: &mut Option<TokenUsage>,
    ) -> GateResult<Payload> {
        let inner = &self.inner;

        let Some(mut permit) = breaker.try_acquire() else {
            let retry_after = breaker.retry_after();
            self.publish_breaker(breaker);
            inner.metrics.record_rejection("circuit_open");
            warn!(
                breaker = %breaker.name(),
                state = breaker.state().as_str(),
                retry_after_ms = retry_after.as_millis(),
                "Circuit breaker rejected call"
            );
            return Err(GateError::circuit_open(breaker.name(), retry_after));
        };

        // Dropping the permit on any early return or cancellation hands back
        // a half-open slot
        if let Err(e) = inner
            .limiter
            .acquire_with_estimate(request.permits, request.estimated_tokens)
            .await
        {
            inner.metrics.record_rejection(rejection_reason(&e));
            warn!(
                limiter = %inner.limiter.name(),
                error = %e,
                retry_after = ?e.retry_after(),
                "Rate limiter rejected call"
            );
            return Err(e);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = inner.clock.now();
            let result = inner
                .timeouts
                .run_attempt(generator.invoke(request.stage, &request.input))
                .await;
            let latency = inner.clock.now().saturating_duration_since(started);

            match result {
                Ok(raw) => {
                    permit.record_success();
                    inner.limiter.on_upstream_success();
                    self.publish_breaker(breaker);
                    inner
                        .metrics
                        .record_attempt(request.stage, AttemptOutcome::Success, latency);

                    let cost = self
                        .record_attempt(
                            request,
                            generator,
                            UsageStatus::Success,
                            attempt,
                            raw.input_tokens,
                            raw.output_tokens,
                        )
                        .await;
                    *usage_slot = Some(TokenUsage {
                        input_tokens: raw.input_tokens,
                        output_tokens: raw.output_tokens,
                        cost,
                        attempts: attempt,
                    });
                    debug!(attempt, latency_ms = latency.as_millis(), "Upstream call succeeded");
                    return Ok(raw.content);
                }
                Err(err) => {
                    permit.record_failure();
                    if err.is_throttled() {
                        inner.limiter.on_upstream_throttled();
                    }
                    self.publish_breaker(breaker);

                    let retry = inner.retry.should_retry(&err, attempt);
                    let outcome = if latency >= inner.timeouts.attempt_timeout() {
                        AttemptOutcome::Timeout
                    } else if err.retryable {
                        AttemptOutcome::Retryable
                    } else {
                        AttemptOutcome::Failed
                    };
                    inner.metrics.record_attempt(request.stage, outcome, latency);

                    let status = if retry {
                        UsageStatus::Retried
                    } else {
                        UsageStatus::Error
                    };
                    self.record_attempt(request, generator, status, attempt, 0, 0)
                        .await;

                    if !retry {
                        warn!(
                            attempt,
                            status_code = ?err.status_code,
                            retryable = err.retryable,
                            error = %err,
                            "Upstream call failed"
                        );
                        return Err(GateError::from_upstream(err, attempt));
                    }

                    let delay = inner.retry.delay_for(attempt, err.retry_after);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Retrying upstream call"
                    );
                    tokio::time::sleep(delay).await;

                    permit = match breaker.try_acquire() {
                        Some(next) => next,
                        None => {
                            info!(breaker = %breaker.name(), "Breaker opened during retries");
                            return Err(GateError::from_upstream(err, attempt));
                        }
                    };
                }
            }
        }
    }

    /// Record one attempt; bookkeeping failures never fail the call
    async fn record_attempt(
        &self,
        request: &GateRequest,
        generator: &dyn Generator,
        status: UsageStatus,
        attempt: u32,
        input_tokens: u64,
        output_tokens: u64,
    ) -> f64 {
        let entry = UsageEntry::attempt(
            request.request_id.clone(),
            status,
            attempt,
            input_tokens,
            output_tokens,
        )
        .with_model(generator.model())
        .with_stage(request.stage);
        self.track(entry).await
    }

    async fn record_cache_hit(&self, request: &GateRequest, generator: &dyn Generator) {
        let entry = UsageEntry::cache_hit(request.request_id.clone(), Some(request.stage))
            .with_model(generator.model());
        self.track(entry).await;
    }

    async fn track(&self, entry: UsageEntry) -> f64 {
        let model = entry
            .model
            .clone()
            .unwrap_or_else(|| self.inner.usage.prices().default_model().to_string());
        match self.inner.usage.track_usage(entry).await {
            Ok(outcome) => {
                self.inner.metrics.record_usage(
                    &model,
                    outcome.charged.input_tokens,
                    outcome.charged.output_tokens,
                    outcome.charged.cost,
                );
                self.publish_alerts(&outcome.alerts);
                outcome.cost
            }
            Err(e) => {
                warn!(error = %e, "Failed to record usage");
                0.0
            }
        }
    }

    fn publish_alerts(&self, alerts: &[AlertEvent]) {
        for alert in alerts {
            self.inner.metrics.record_alert(alert.severity.as_str());
        }
    }

    fn publish_breaker(&self, breaker: &CircuitBreaker) {
        let metrics = &self.inner.metrics;
        for change in breaker.unreported_transitions() {
            metrics.record_circuit_transition(breaker.name(), change.to.as_str(), change.cause.as_str());
            info!(
                breaker = %breaker.name(),
                from = change.from.as_str(),
                to = change.to.as_str(),
                cause = change.cause.as_str(),
                "Circuit transition"
            );
        }
        metrics.set_circuit_state(breaker.name(), breaker.state().as_gauge());
    }

    fn respond(
        &self,
        request: GateRequest,
        key: CacheKey,
        payload: Payload,
        source: ResponseSource,
        usage: Option<TokenUsage>,
    ) -> GateResponse {
        GateResponse {
            payload,
            source,
            key,
            request_id: request.request_id,
            usage,
        }
    }

    /// Breaker for a generator id, created on first use
    fn breaker_for(&self, id: &str) -> GateResult<Arc<CircuitBreaker>> {
        if let Some(breaker) = self.inner.breakers.read().get(id) {
            return Ok(Arc::clone(breaker));
        }

        let mut breakers = self.inner.breakers.write();
        if let Some(breaker) = breakers.get(id) {
            return Ok(Arc::clone(breaker));
        }
        let breaker = Arc::new(CircuitBreaker::new(
            id,
            self.inner.config.circuit_breaker.clone(),
            Arc::clone(&self.inner.clock),
        )?);
        if self.inner.isolated.lock().contains(id) {
            breaker.force_open();
        }
        self.publish_breaker(&breaker);
        breakers.insert(id.to_string(), Arc::clone(&breaker));
        debug!(breaker = %id, "Circuit breaker created");
        Ok(breaker)
    }

    async fn persist_isolation(&self) -> GateResult<()> {
        let names: Vec<String> = self.inner.isolated.lock().iter().cloned().collect();
        let json = serde_json::to_string(&names)
            .map_err(|e| GateError::internal(format!("isolation encoding failed: {e}")))?;
        let kv = Arc::clone(&self.inner.kv);
        tokio::task::spawn_blocking(move || kv.set(ISOLATED_KEY, &json))
            .await
            .map_err(|e| GateError::internal(format!("storage task failed: {e}")))?
            .map_err(GateError::from)
    }

    // ----- administrative surface -----

    /// Usage totals for a period, from the ledger
    ///
    /// # Errors
    /// Returns `Storage` when the ledger cannot be queried
    pub async fn usage_stats(&self, period: UsagePeriod) -> GateResult<UsageSummary> {
        self.inner.usage.usage_stats(period).await
    }

    /// Per-model usage for a period
    ///
    /// # Errors
    /// Returns `Storage` when the ledger cannot be queried
    pub async fn usage_by_model(&self, period: UsagePeriod) -> GateResult<Vec<ModelUsage>> {
        self.inner.usage.usage_by_model(period).await
    }

    /// Change a hard cap; persisted so it survives restarts
    ///
    /// # Errors
    /// `InvalidRequest` for a negative or non-finite value, `Storage` when
    /// the new quota cannot be persisted
    pub async fn set_quota(&self, kind: QuotaKind, value: f64) -> GateResult<()> {
        self.inner.limiter.set_quota(kind, value).await
    }

    /// Register an alert threshold with an optional callback
    ///
    /// # Errors
    /// `InvalidRequest` for a threshold outside `(0, 100]`
    pub fn add_alert(&self, config: AlertConfig, callback: Option<AlertCallback>) -> GateResult<()> {
        self.inner.usage.add_alert(config, callback)
    }

    /// Most recent alerts, newest first
    #[must_use]
    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertEvent> {
        self.inner.alerts.recent_alerts(limit)
    }

    /// Current quota consumption
    #[must_use]
    pub fn quota_usage(&self) -> QuotaUsage {
        self.inner.limiter.quota_usage()
    }

    /// State of the default generator's breaker
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_snapshot().state
    }

    /// Counters of the default generator's breaker
    #[must_use]
    pub fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.inner.primary.snapshot()
    }

    /// Latest state changes of the default generator's breaker, newest first
    #[must_use]
    pub fn circuit_transitions(&self, limit: usize) -> Vec<CircuitTransition> {
        self.inner.primary.recent_transitions(limit)
    }

    /// Snapshots of every breaker created so far, by name
    #[must_use]
    pub fn breaker_snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .breakers
            .read()
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Isolate the default generator; persisted across restarts
    ///
    /// # Errors
    /// Returns `Storage` when the isolation flag cannot be persisted
    pub async fn force_open(&self) -> GateResult<()> {
        let name = self.inner.primary.name().to_string();
        self.force_open_breaker(&name).await
    }

    /// Isolate a named breaker
    ///
    /// # Errors
    /// Returns `Storage` when the isolation flag cannot be persisted
    pub async fn force_open_breaker(&self, name: &str) -> GateResult<()> {
        let breaker = self.breaker_for(name)?;
        breaker.force_open();
        self.publish_breaker(&breaker);
        self.inner.isolated.lock().insert(name.to_string());
        info!(breaker = %name, "Breaker isolated by operator");
        self.persist_isolation().await
    }

    /// Close the default generator's breaker, clearing any isolation
    ///
    /// # Errors
    /// Returns `Storage` when the isolation flag cannot be persisted
    pub async fn force_closed(&self) -> GateResult<()> {
        let name = self.inner.primary.name().to_string();
        self.force_closed_breaker(&name).await
    }

    /// Close a named breaker, clearing any isolation
    ///
    /// # Errors
    /// Returns `Storage` when the isolation flag cannot be persisted
    pub async fn force_closed_breaker(&self, name: &str) -> GateResult<()> {
        let breaker = self.breaker_for(name)?;
        breaker.force_closed();
        self.publish_breaker(&breaker);
        let was_isolated = self.inner.isolated.lock().remove(name);
        info!(breaker = %name, was_isolated, "Breaker closed by operator");
        if was_isolated {
            self.persist_isolation().await?;
        }
        Ok(())
    }

    /// Reset the default generator's breaker to a fresh closed state
    ///
    /// # Errors
    /// Returns `Storage` when the isolation flag cannot be persisted
    pub async fn reset_breaker(&self) -> GateResult<()> {
        let breaker = Arc::clone(&self.inner.primary);
        breaker.reset();
        self.publish_breaker(&breaker);
        let was_isolated = self.inner.isolated.lock().remove(breaker.name());
        if was_isolated {
            self.persist_isolation().await?;
        }
        Ok(())
    }

    /// Cache counters
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Drop every cached response of a stage
    ///
    /// # Errors
    /// Returns `Storage` when the persistent tier cannot be updated
    pub async fn invalidate_stage(&self, stage: Stage) -> GateResult<Invalidated> {
        self.inner.cache.invalidate_stage(stage).await
    }

    /// Drop a single cached response
    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner.cache.invalidate(key).await
    }

    /// Prometheus text exposition of the gate's metrics
    #[must_use]
    pub fn metrics(&self) -> String {
        self.inner.metrics.encode_text()
    }

    /// The configuration the gate was built with
    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.inner.config
    }
}

fn tier_label(tier: CacheTier) -> &'static str {
    match tier {
        CacheTier::Memory => "memory",
        CacheTier::Persistent => "persistent",
    }
}

fn rejection_reason(error: &GateError) -> &'static str {
    match error {
        GateError::RateLimitExceeded { limit_type, .. } => limit_type.as_str(),
        GateError::QuotaExceeded { kind, .. } => kind.as_str(),
        GateError::CircuitOpen { .. } => "circuit_open",
        other => other.error_code(),
    }
}
