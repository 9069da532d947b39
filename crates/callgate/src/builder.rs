//! Gate construction and startup recovery.

use crate::gate::{Gate, GateInner, ISOLATED_KEY};
use callgate_config::GateConfig;
use callgate_core::{
    BlobStore, GateError, GateResult, Generator, KeyValueStore, SharedClock, SystemClock,
    UsageLedger, UsagePeriod,
};
use callgate_resilience::{
    AlertManager, CircuitBreaker, PriceTable, RateLimiter, ResponseCache, RetryPolicy,
    TimeoutManager, UsageTracker,
};
use callgate_storage::{MemoryStore, SqliteStore};
use callgate_telemetry::GateMetrics;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Breaker name used when no default generator is configured
const DEFAULT_BREAKER: &str = "upstream";

/// Limiter name used in storage keys
const LIMITER_NAME: &str = "default";

/// Builder for [`Gate`]
#[derive(Default)]
pub struct GateBuilder {
    config: Option<GateConfig>,
    generator: Option<Arc<dyn Generator>>,
    kv: Option<Arc<dyn KeyValueStore>>,
    ledger: Option<Arc<dyn UsageLedger>>,
    blobs: Option<Arc<dyn BlobStore>>,
    clock: Option<SharedClock>,
    metrics: Option<GateMetrics>,
    retry: Option<RetryPolicy>,
}

impl GateBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration
    #[must_use]
    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the default generator used by [`Gate::execute`]
    #[must_use]
    pub fn generator(mut self, generator: impl Generator) -> Self {
        self.generator = Some(Arc::new(generator));
        self
    }

    /// Set the default generator from a shared handle
    #[must_use]
    pub fn generator_arc(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Use one store for every persistence port
    #[must_use]
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: KeyValueStore + UsageLedger + BlobStore,
    {
        let (kv, ledger, blobs) = split(store);
        self.kv = Some(kv);
        self.ledger = Some(ledger);
        self.blobs = Some(blobs);
        self
    }

    /// Set the key-value store for limiter, alert and breaker state
    #[must_use]
    pub fn key_value_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(store);
        self
    }

    /// Set the usage ledger
    #[must_use]
    pub fn usage_ledger(mut self, ledger: Arc<dyn UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Set the persistent cache tier
    #[must_use]
    pub fn blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Set the clock
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the metrics collectors
    #[must_use]
    pub fn metrics(mut self, metrics: GateMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the retry policy derived from the configuration
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Build the gate and recover durable state.
    ///
    /// Ports not set explicitly fall back to a SQLite file when
    /// `storage.path` is configured, and to an in-memory store otherwise.
    /// Recovery restores limiter counters, persisted quotas, alert trigger
    /// dates and breaker isolation, then raises the limiter's counters to
    /// the ledger totals for today and this month.
    ///
    /// # Errors
    /// `Configuration` for invalid settings, `Storage` when durable state
    /// cannot be opened or read
    pub async fn build(self) -> GateResult<Gate> {
        let config = self.config.unwrap_or_default();
        config
            .validate_config()
            .map_err(|e| GateError::configuration(e.to_string()))?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let (kv, ledger, blobs) = resolve_stores(&config, self.kv, self.ledger, self.blobs).await?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => GateMetrics::new(&config.observability.metrics)
                .map_err(|e| GateError::configuration(format!("metrics: {e}")))?,
        };

        let prices = PriceTable::from_config(&config.pricing);
        let limiter = Arc::new(
            RateLimiter::new(
                LIMITER_NAME,
                config.rate_limit.clone(),
                &config.quota,
                prices.clone(),
                Arc::clone(&clock),
            )?
            .with_store(Arc::clone(&kv)),
        );
        limiter.restore().await?;

        let alerts = Arc::new(
            AlertManager::new(&config.alerts, Arc::clone(&clock)).with_store(Arc::clone(&kv)),
        );
        alerts.restore().await?;

        let usage = UsageTracker::new(prices, ledger, Arc::clone(&clock))
            .with_limiter(Arc::clone(&limiter))
            .with_alerts(Arc::clone(&alerts));

        let today = usage.usage_stats(UsagePeriod::Today).await?;
        let month = usage.usage_stats(UsagePeriod::Month).await?;
        limiter.reconcile(&today.totals, &month.totals);

        let cache = Arc::new(
            ResponseCache::new(config.cache.clone(), Arc::clone(&clock)).with_persistent(blobs),
        );

        let isolated = load_isolated(&kv).await?;
        let primary_name = self
            .generator
            .as_ref()
            .map_or_else(|| DEFAULT_BREAKER.to_string(), |g| g.id().to_string());
        let primary = Arc::new(CircuitBreaker::new(
            primary_name.clone(),
            config.circuit_breaker.clone(),
            Arc::clone(&clock),
        )?);
        if isolated.contains(&primary_name) {
            primary.force_open();
            warn!(breaker = %primary_name, "Breaker restored in isolated state");
        }
        metrics.set_circuit_state(primary.name(), primary.state().as_gauge());

        let mut breakers = HashMap::new();
        breakers.insert(primary_name.clone(), Arc::clone(&primary));

        info!(
            breaker = %primary_name,
            tokens_today = today.totals.total_tokens(),
            cost_this_month = month.totals.cost,
            cache_enabled = cache.is_enabled(),
            "Gate ready"
        );

        Ok(Gate {
            inner: Arc::new(GateInner {
                retry: self
                    .retry
                    .unwrap_or_else(|| RetryPolicy::from_config(&config.retry)),
                timeouts: TimeoutManager::new(config.timeout.clone()),
                config,
                generator: self.generator,
                primary,
                breakers: RwLock::new(breakers),
                isolated: Mutex::new(isolated),
                cache,
                limiter,
                usage,
                alerts,
                metrics: Arc::new(metrics),
                kv,
                clock,
                maintenance: Mutex::new(None),
            }),
        })
    }
}

type Stores = (Arc<dyn KeyValueStore>, Arc<dyn UsageLedger>, Arc<dyn BlobStore>);

async fn resolve_stores(
    config: &GateConfig,
    kv: Option<Arc<dyn KeyValueStore>>,
    ledger: Option<Arc<dyn UsageLedger>>,
    blobs: Option<Arc<dyn BlobStore>>,
) -> GateResult<Stores> {
    if let (Some(kv), Some(ledger), Some(blobs)) = (&kv, &ledger, &blobs) {
        return Ok((Arc::clone(kv), Arc::clone(ledger), Arc::clone(blobs)));
    }

    let fallback = match &config.storage.path {
        Some(path) => {
            let path = path.clone();
            info!(path = %path.display(), "Opening SQLite store");
            let store = tokio::task::spawn_blocking(move || SqliteStore::open(path))
                .await
                .map_err(|e| GateError::internal(format!("storage task failed: {e}")))??;
            split(Arc::new(store))
        }
        None => split(Arc::new(MemoryStore::new())),
    };

    Ok((
        kv.unwrap_or(fallback.0),
        ledger.unwrap_or(fallback.1),
        blobs.unwrap_or(fallback.2),
    ))
}

fn split<S>(store: Arc<S>) -> Stores
where
    S: KeyValueStore + UsageLedger + BlobStore,
{
    (
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        Arc::clone(&store) as Arc<dyn UsageLedger>,
        store as Arc<dyn BlobStore>,
    )
}

async fn load_isolated(kv: &Arc<dyn KeyValueStore>) -> GateResult<BTreeSet<String>> {
    let store = Arc::clone(kv);
    let raw = tokio::task::spawn_blocking(move || store.get(ISOLATED_KEY))
        .await
        .map_err(|e| GateError::internal(format!("storage task failed: {e}")))??;

    let Some(raw) = raw else {
        return Ok(BTreeSet::new());
    };
    match serde_json::from_str::<Vec<String>>(&raw) {
        Ok(names) => Ok(names.into_iter().collect()),
        Err(e) => {
            warn!(error = %e, "Ignoring undecodable breaker isolation state");
            Ok(BTreeSet::new())
        }
    }
}
