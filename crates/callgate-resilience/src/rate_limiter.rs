//! Quota-aware rate limiting.
//!
//! Every acquire is checked against three layers, and a permit is consumed
//! only when all of them admit the call:
//!
//! 1. hard quotas: tokens per UTC day and spend per UTC month
//! 2. a sliding window of requests (e.g. per hour)
//! 3. a token bucket for short-term burst control
//!
//! Counters live in memory behind one mutex; storage I/O happens outside it.
//! State is flushed periodically and restored at startup, so a restart does
//! not reset quota consumption.

use crate::persist;
use crate::pricing::PriceTable;
use callgate_config::{QuotaConfig, RateLimitConfig};
use callgate_core::types::{next_day, next_month};
use callgate_core::{
    GateError, GateResult, KeyValueStore, QuotaKind, RateLimitType, SharedClock, UsagePeriod,
    UsageTotals,
};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Token bucket refilled continuously at the current per-minute rate
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_minute: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_minute: f64, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity: f64::from(capacity),
            refill_per_minute,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_minute / 60.0)
            .min(self.capacity);
        self.last_refill = now;
    }

    /// Time until `needed` tokens are available
    fn estimate_retry_after(&self, needed: f64) -> Duration {
        let missing = needed - self.tokens;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        if self.refill_per_minute <= 0.0 {
            return Duration::from_secs(60);
        }
        let secs = missing / (self.refill_per_minute / 60.0);
        Duration::from_secs_f64(secs).max(Duration::from_millis(1))
    }
}

/// Cumulative consumption within the current quota periods
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct PeriodCounters {
    day: NaiveDate,
    tokens_today: u64,
    cost_today: f64,
    year: i32,
    month: u32,
    tokens_this_month: u64,
    cost_this_month: f64,
}

impl PeriodCounters {
    fn starting(wall: DateTime<Utc>) -> Self {
        Self {
            day: wall.date_naive(),
            tokens_today: 0,
            cost_today: 0.0,
            year: wall.year(),
            month: wall.month(),
            tokens_this_month: 0,
            cost_this_month: 0.0,
        }
    }

    /// Reset counters whose period has ended
    fn roll_over(&mut self, wall: DateTime<Utc>) -> bool {
        let mut rolled = false;
        if wall.date_naive() != self.day {
            self.day = wall.date_naive();
            self.tokens_today = 0;
            self.cost_today = 0.0;
            rolled = true;
        }
        if (wall.year(), wall.month()) != (self.year, self.month) {
            self.year = wall.year();
            self.month = wall.month();
            self.tokens_this_month = 0;
            self.cost_this_month = 0.0;
            rolled = true;
        }
        rolled
    }
}

#[derive(Debug)]
struct LimiterState {
    bucket: TokenBucket,
    window: VecDeque<(Instant, u32)>,
    counters: PeriodCounters,
    daily_token_quota: Option<u64>,
    monthly_budget_usd: Option<f64>,
    success_streak: u32,
    dirty: bool,
    last_persisted_at: Instant,
}

impl LimiterState {
    fn window_used(&self) -> u64 {
        self.window.iter().map(|(_, cost)| u64::from(*cost)).sum()
    }
}

/// Persisted form of the limiter state
#[derive(Debug, Serialize, Deserialize)]
struct LimiterDocument {
    bucket_tokens: f64,
    refill_per_minute: f64,
    /// `(unix millis, cost)` of each request still inside the window
    window: Vec<(i64, u32)>,
    counters: PeriodCounters,
    saved_at_ms: i64,
}

/// Quota consumption snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsage {
    /// Tokens consumed since UTC midnight
    pub tokens_today: u64,
    /// Daily token cap, if any
    pub daily_token_quota: Option<u64>,
    /// Share of the daily cap consumed, in percent
    pub daily_percent: Option<f64>,
    /// Spend since the first of the UTC month
    pub cost_this_month: f64,
    /// Monthly spend cap, if any
    pub monthly_budget_usd: Option<f64>,
    /// Share of the monthly cap consumed, in percent
    pub monthly_percent: Option<f64>,
    /// Tokens currently in the bucket
    pub bucket_tokens: f64,
    /// Permits used within the sliding window
    pub window_requests: u64,
    /// Current refill rate, which differs from the configured one in adaptive mode
    pub refill_per_minute: f64,
}

impl QuotaUsage {
    /// The most consumed quota and its utilization in percent
    #[must_use]
    pub fn max_percent(&self) -> Option<(QuotaKind, f64)> {
        match (self.daily_percent, self.monthly_percent) {
            (Some(d), Some(m)) if m > d => Some((QuotaKind::MonthlyBudget, m)),
            (Some(d), _) => Some((QuotaKind::DailyTokens, d)),
            (None, Some(m)) => Some((QuotaKind::MonthlyBudget, m)),
            (None, None) => None,
        }
    }

    /// Consumption and cap for `kind`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn used_and_limit(&self, kind: QuotaKind) -> (f64, Option<f64>) {
        match kind {
            QuotaKind::DailyTokens => (
                self.tokens_today as f64,
                self.daily_token_quota.map(|q| q as f64),
            ),
            QuotaKind::MonthlyBudget => (self.cost_this_month, self.monthly_budget_usd),
        }
    }
}

/// Tokens and spend the limiter has counted for a period
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeriodUsage {
    /// Period the counters cover
    pub period: UsagePeriod,
    /// Tokens consumed
    pub tokens: u64,
    /// Spend in USD
    pub cost: f64,
}

/// Holds a place in the wait queue; released on drop
struct QueueSlot<'a> {
    waiting: &'a AtomicUsize,
}

impl<'a> QueueSlot<'a> {
    fn try_enter(waiting: &'a AtomicUsize, max: usize) -> Option<Self> {
        let previous = waiting.fetch_add(1, Ordering::AcqRel);
        if previous >= max {
            waiting.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self { waiting })
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Layered rate limiter with persisted quotas
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    prices: PriceTable,
    clock: SharedClock,
    state: Mutex<LimiterState>,
    waiting: AtomicUsize,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter
    ///
    /// # Errors
    /// Returns `GateError::Configuration` for an empty bucket or negative budget
    pub fn new(
        name: impl Into<String>,
        config: RateLimitConfig,
        quota: &QuotaConfig,
        prices: PriceTable,
        clock: SharedClock,
    ) -> GateResult<Self> {
        if config.burst_size == 0 {
            return Err(GateError::configuration("rate limit burst_size must be at least 1"));
        }
        if config.requests_per_minute == 0 || config.requests_per_hour == 0 {
            return Err(GateError::configuration("rate limit rates must be at least 1"));
        }
        if quota.monthly_budget_usd.is_some_and(|b| !b.is_finite() || b < 0.0) {
            return Err(GateError::configuration("monthly budget must be a non-negative amount"));
        }

        let now = clock.now();
        let wall = clock.wall();
        let state = LimiterState {
            bucket: TokenBucket::new(config.burst_size, f64::from(config.requests_per_minute), now),
            window: VecDeque::new(),
            counters: PeriodCounters::starting(wall),
            daily_token_quota: quota.daily_token_quota,
            monthly_budget_usd: quota.monthly_budget_usd,
            success_streak: 0,
            dirty: false,
            last_persisted_at: now,
        };

        Ok(Self {
            name: name.into(),
            config,
            prices,
            clock,
            state: Mutex::new(state),
            waiting: AtomicUsize::new(0),
            store: None,
        })
    }

    /// Persist state and quotas in `store`
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Limiter name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Callers currently waiting for a permit
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Acquire `cost` permits, waiting up to the configured maximum
    ///
    /// # Errors
    /// `RateLimitExceeded` when no permit frees up in time or the wait queue
    /// is full, `QuotaExceeded` when a hard cap is hit
    pub async fn acquire(&self, cost: u32) -> GateResult<()> {
        self.acquire_with_estimate(cost, 0).await
    }

    /// Acquire `cost` permits for a call expected to consume `estimated_tokens`
    ///
    /// The estimate is checked against the remaining daily quota but is not
    /// charged; actual usage is recorded with `record_consumption`.
    ///
    /// # Errors
    /// See [`RateLimiter::acquire`]
    pub async fn acquire_with_estimate(&self, cost: u32, estimated_tokens: u64) -> GateResult<()> {
        let first = match self.try_acquire(cost, estimated_tokens) {
            Ok(()) => return Ok(()),
            Err(GateError::RateLimitExceeded { retry_after, limit_type })
                if !self.config.max_wait.is_zero() =>
            {
                (limit_type, retry_after)
            }
            Err(e) => return Err(e),
        };

        let Some(_slot) = QueueSlot::try_enter(&self.waiting, self.config.max_queue) else {
            warn!(limiter = %self.name, max_queue = self.config.max_queue, "Rate limiter wait queue full");
            return Err(GateError::rate_limited(RateLimitType::QueueFull, first.1));
        };

        let deadline = tokio::time::Instant::now() + self.config.max_wait;
        let (mut limit_type, mut retry_after) = first;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(
                    limiter = %self.name,
                    limit_type = limit_type.as_str(),
                    retry_after_ms = retry_after.as_millis(),
                    "Gave up waiting for a rate limit permit"
                );
                return Err(GateError::rate_limited(limit_type, retry_after));
            }

            tokio::time::sleep(retry_after.min(remaining)).await;

            match self.try_acquire(cost, estimated_tokens) {
                Ok(()) => return Ok(()),
                Err(GateError::RateLimitExceeded { limit_type: l, retry_after: r }) => {
                    limit_type = l;
                    retry_after = r;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Check every layer once without waiting
    ///
    /// # Errors
    /// See [`RateLimiter::acquire`]
    pub fn try_acquire(&self, cost: u32, estimated_tokens: u64) -> GateResult<()> {
        if cost == 0 {
            return Ok(());
        }
        if cost > self.config.burst_size {
            return Err(GateError::invalid_request(format!(
                "cost {cost} exceeds burst capacity {}",
                self.config.burst_size
            )));
        }

        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut state = self.state.lock();
        if state.counters.roll_over(wall) {
            state.dirty = true;
        }

        self.check_quotas(&state, estimated_tokens, wall)?;

        if !self.config.enabled {
            return Ok(());
        }

        state.bucket.refill(now);
        self.prune_window(&mut state, now);

        let window_used = state.window_used();
        if window_used + u64::from(cost) > u64::from(self.config.requests_per_hour) {
            let retry_after = self.window_retry_after(&state, cost, now);
            warn!(
                limiter = %self.name,
                window_used,
                retry_after_ms = retry_after.as_millis(),
                "Sliding window limit reached"
            );
            return Err(GateError::rate_limited(RateLimitType::SlidingWindow, retry_after));
        }

        if state.bucket.tokens < f64::from(cost) {
            let retry_after = state.bucket.estimate_retry_after(f64::from(cost));
            debug!(
                limiter = %self.name,
                tokens = state.bucket.tokens,
                retry_after_ms = retry_after.as_millis(),
                "Token bucket empty"
            );
            return Err(GateError::rate_limited(RateLimitType::TokenBucket, retry_after));
        }

        state.bucket.tokens -= f64::from(cost);
        state.window.push_back((now, cost));
        state.dirty = true;
        debug!(
            limiter = %self.name,
            cost,
            tokens_remaining = state.bucket.tokens,
            "Rate limit permit granted"
        );
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn check_quotas(&self, state: &LimiterState, estimated_tokens: u64, wall: DateTime<Utc>) -> GateResult<()> {
        let counters = &state.counters;

        if let Some(quota) = state.daily_token_quota {
            let projected = counters.tokens_today.saturating_add(estimated_tokens);
            if counters.tokens_today >= quota || (estimated_tokens > 0 && projected > quota) {
                let resets_in = (next_day(wall) - wall).to_std().unwrap_or_default();
                warn!(
                    limiter = %self.name,
                    tokens_today = counters.tokens_today,
                    estimated_tokens,
                    quota,
                    "Daily token quota exhausted"
                );
                return Err(GateError::QuotaExceeded {
                    kind: QuotaKind::DailyTokens,
                    used: counters.tokens_today as f64,
                    limit: quota as f64,
                    resets_in,
                });
            }
        }

        if let Some(budget) = state.monthly_budget_usd {
            if counters.cost_this_month >= budget {
                let resets_in = (next_month(wall) - wall).to_std().unwrap_or_default();
                warn!(
                    limiter = %self.name,
                    cost_this_month = counters.cost_this_month,
                    budget,
                    "Monthly budget exhausted"
                );
                return Err(GateError::QuotaExceeded {
                    kind: QuotaKind::MonthlyBudget,
                    used: counters.cost_this_month,
                    limit: budget,
                    resets_in,
                });
            }
        }

        Ok(())
    }

    fn prune_window(&self, state: &mut LimiterState, now: Instant) {
        while state
            .window
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) >= self.config.window)
        {
            state.window.pop_front();
        }
    }

    /// Time until enough old requests leave the window to admit `cost`
    fn window_retry_after(&self, state: &LimiterState, cost: u32, now: Instant) -> Duration {
        let limit = u64::from(self.config.requests_per_hour);
        let mut used = state.window_used();
        for (at, c) in &state.window {
            used -= u64::from(*c);
            if used + u64::from(cost) <= limit {
                let age = now.saturating_duration_since(*at);
                return self.config.window.saturating_sub(age).max(Duration::from_millis(1));
            }
        }
        self.config.window
    }

    /// Price a call at the default model and count it against the quotas
    pub fn track_usage(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let cost = self
            .prices
            .cost(self.prices.default_model(), input_tokens, output_tokens);
        self.record_consumption(input_tokens + output_tokens, cost);
        cost
    }

    /// Add already-priced consumption to the period counters
    pub fn record_consumption(&self, tokens: u64, cost: f64) {
        if tokens == 0 && cost <= 0.0 {
            return;
        }
        let wall = self.clock.wall();
        let mut state = self.state.lock();
        state.counters.roll_over(wall);
        let counters = &mut state.counters;
        counters.tokens_today += tokens;
        counters.tokens_this_month += tokens;
        counters.cost_today += cost;
        counters.cost_this_month += cost;
        state.dirty = true;
    }

    /// Raise the period counters to at least the ledger totals
    pub fn reconcile(&self, today: &UsageTotals, this_month: &UsageTotals) {
        let wall = self.clock.wall();
        let mut state = self.state.lock();
        state.counters.roll_over(wall);
        let counters = &mut state.counters;
        let before = (counters.tokens_today, counters.cost_this_month);

        counters.tokens_today = counters.tokens_today.max(today.total_tokens());
        counters.cost_today = counters.cost_today.max(today.cost);
        counters.tokens_this_month = counters.tokens_this_month.max(this_month.total_tokens());
        counters.cost_this_month = counters.cost_this_month.max(this_month.cost);

        if (counters.tokens_today, counters.cost_this_month) != before {
            info!(
                limiter = %self.name,
                tokens_today = counters.tokens_today,
                cost_this_month = counters.cost_this_month,
                "Reconciled quota counters with usage ledger"
            );
            state.dirty = true;
        }
    }

    /// Change a hard cap at runtime and persist it
    ///
    /// Persisted caps take precedence over configuration on the next restore.
    ///
    /// # Errors
    /// `InvalidRequest` for a negative or non-finite value, `Storage` when
    /// the cap could not be persisted (the in-memory cap is still applied)
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn set_quota(&self, kind: QuotaKind, value: f64) -> GateResult<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(GateError::invalid_request(format!(
                "quota {kind} must be a non-negative number, got {value}"
            )));
        }

        {
            let mut state = self.state.lock();
            match kind {
                QuotaKind::DailyTokens => state.daily_token_quota = Some(value.round() as u64),
                QuotaKind::MonthlyBudget => state.monthly_budget_usd = Some(value),
            }
        }
        info!(limiter = %self.name, quota = %kind, value, "Quota updated");

        if let Some(store) = &self.store {
            persist::kv_set(store, &self.quota_key(kind), value.to_string()).await?;
        }
        Ok(())
    }

    /// Current hard cap for `kind`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn quota(&self, kind: QuotaKind) -> Option<f64> {
        let state = self.state.lock();
        match kind {
            QuotaKind::DailyTokens => state.daily_token_quota.map(|q| q as f64),
            QuotaKind::MonthlyBudget => state.monthly_budget_usd,
        }
    }

    /// Quota consumption snapshot
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn quota_usage(&self) -> QuotaUsage {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut state = self.state.lock();
        state.counters.roll_over(wall);
        state.bucket.refill(now);
        self.prune_window(&mut state, now);

        let percent = |used: f64, limit: f64| {
            if limit > 0.0 {
                used / limit * 100.0
            } else {
                100.0
            }
        };

        let counters = state.counters;
        QuotaUsage {
            tokens_today: counters.tokens_today,
            daily_token_quota: state.daily_token_quota,
            daily_percent: state
                .daily_token_quota
                .map(|q| percent(counters.tokens_today as f64, q as f64)),
            cost_this_month: counters.cost_this_month,
            monthly_budget_usd: state.monthly_budget_usd,
            monthly_percent: state
                .monthly_budget_usd
                .map(|b| percent(counters.cost_this_month, b)),
            bucket_tokens: state.bucket.tokens,
            window_requests: state.window_used(),
            refill_per_minute: state.bucket.refill_per_minute,
        }
    }

    /// Counters for `period`; `None` for periods only the usage ledger covers
    #[must_use]
    pub fn usage_stats(&self, period: UsagePeriod) -> Option<PeriodUsage> {
        let wall = self.clock.wall();
        let mut state = self.state.lock();
        state.counters.roll_over(wall);
        let c = state.counters;
        match period {
            UsagePeriod::Today => Some(PeriodUsage {
                period,
                tokens: c.tokens_today,
                cost: c.cost_today,
            }),
            UsagePeriod::Month => Some(PeriodUsage {
                period,
                tokens: c.tokens_this_month,
                cost: c.cost_this_month,
            }),
            UsagePeriod::Week | UsagePeriod::All => None,
        }
    }

    /// Feed a successful upstream call into adaptive rate control
    pub fn on_upstream_success(&self) {
        if !self.config.adaptive {
            return;
        }
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.success_streak += 1;
        if state.success_streak < self.config.adaptive_recovery_successes {
            return;
        }
        state.success_streak = 0;

        let ceiling = f64::from(self.config.requests_per_minute);
        if state.bucket.refill_per_minute < ceiling {
            state.bucket.refill(now);
            state.bucket.refill_per_minute =
                (state.bucket.refill_per_minute * self.config.adaptive_increase_factor).min(ceiling);
            debug!(
                limiter = %self.name,
                refill_per_minute = state.bucket.refill_per_minute,
                "Adaptive rate increased"
            );
        }
    }

    /// Feed an upstream throttling signal into adaptive rate control
    pub fn on_upstream_throttled(&self) {
        if !self.config.adaptive {
            return;
        }
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.success_streak = 0;
        state.bucket.refill(now);
        let floor = f64::from(self.config.adaptive_min_rpm);
        state.bucket.refill_per_minute =
            (state.bucket.refill_per_minute * self.config.adaptive_decrease_factor).max(floor);
        warn!(
            limiter = %self.name,
            refill_per_minute = state.bucket.refill_per_minute,
            "Upstream throttled, adaptive rate decreased"
        );
    }

    /// Whether unflushed changes exist
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Flush when dirty and the persist interval has elapsed
    ///
    /// # Errors
    /// Returns `Storage` when the write fails
    pub async fn flush_if_due(&self) -> GateResult<bool> {
        let due = {
            let state = self.state.lock();
            state.dirty
                && self.clock.now().saturating_duration_since(state.last_persisted_at)
                    >= self.config.persist_interval
        };
        if due {
            self.flush().await?;
        }
        Ok(due)
    }

    /// Write the current state to storage
    ///
    /// # Errors
    /// Returns `Storage` when the write fails; the state stays dirty
    pub async fn flush(&self) -> GateResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let document = {
            let now = self.clock.now();
            let wall_ms = self.clock.wall_ms();
            let mut state = self.state.lock();
            state.bucket.refill(now);
            self.prune_window(&mut state, now);
            let document = LimiterDocument {
                bucket_tokens: state.bucket.tokens,
                refill_per_minute: state.bucket.refill_per_minute,
                window: state
                    .window
                    .iter()
                    .map(|(at, cost)| (wall_ms - millis(now.saturating_duration_since(*at)), *cost))
                    .collect(),
                counters: state.counters,
                saved_at_ms: wall_ms,
            };
            state.dirty = false;
            state.last_persisted_at = now;
            document
        };

        let json = serde_json::to_string(&document)
            .map_err(|e| GateError::internal(format!("limiter state encoding failed: {e}")))?;
        if let Err(e) = persist::kv_set(store, &self.state_key(), json).await {
            self.state.lock().dirty = true;
            warn!(limiter = %self.name, error = %e, "Failed to flush rate limiter state");
            return Err(e);
        }
        debug!(limiter = %self.name, "Rate limiter state flushed");
        Ok(())
    }

    /// Load persisted quotas and state
    ///
    /// Bucket tokens are restored at most to capacity with no credit for the
    /// downtime. Period counters are kept only if still in the same period.
    ///
    /// # Errors
    /// Returns `Storage` when the store cannot be read. An undecodable state
    /// document is logged and ignored.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn restore(&self) -> GateResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let daily = persist::kv_get(store, &self.quota_key(QuotaKind::DailyTokens)).await?;
        let monthly = persist::kv_get(store, &self.quota_key(QuotaKind::MonthlyBudget)).await?;
        let document = persist::kv_get(store, &self.state_key()).await?;

        let now = self.clock.now();
        let wall = self.clock.wall();
        let wall_ms = self.clock.wall_ms();
        let mut state = self.state.lock();

        if let Some(value) = daily.and_then(|v| v.parse::<f64>().ok()) {
            state.daily_token_quota = Some(value.round() as u64);
        }
        if let Some(value) = monthly.and_then(|v| v.parse::<f64>().ok()) {
            state.monthly_budget_usd = Some(value);
        }

        let Some(raw) = document else {
            return Ok(());
        };
        let document: LimiterDocument = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(limiter = %self.name, error = %e, "Ignoring undecodable rate limiter state");
                return Ok(());
            }
        };

        state.bucket.tokens = document.bucket_tokens.clamp(0.0, state.bucket.capacity);
        state.bucket.last_refill = now;
        if self.config.adaptive {
            state.bucket.refill_per_minute = document
                .refill_per_minute
                .clamp(f64::from(self.config.adaptive_min_rpm), f64::from(self.config.requests_per_minute));
        }

        state.window = document
            .window
            .iter()
            .filter_map(|(at_ms, cost)| {
                let age = Duration::from_millis(u64::try_from(wall_ms - at_ms).ok()?);
                if age >= self.config.window {
                    return None;
                }
                now.checked_sub(age).map(|at| (at, *cost))
            })
            .collect();

        let mut counters = document.counters;
        counters.roll_over(wall);
        state.counters = counters;
        state.dirty = false;
        state.last_persisted_at = now;

        info!(
            limiter = %self.name,
            tokens_today = counters.tokens_today,
            cost_this_month = counters.cost_this_month,
            bucket_tokens = state.bucket.tokens,
            "Rate limiter state restored"
        );
        Ok(())
    }

    fn state_key(&self) -> String {
        format!("limiter:{}:state", self.name)
    }

    fn quota_key(&self, kind: QuotaKind) -> String {
        format!("limiter:{}:quota:{}", self.name, kind.as_str())
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use callgate_core::{MockClock, SystemClock};
    use callgate_storage::MemoryStore;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    fn config(burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            burst_size: burst,
            requests_per_minute: 60,
            max_wait: Duration::ZERO,
            ..RateLimitConfig::default()
        }
    }

    fn limiter(config: RateLimitConfig, quota: QuotaConfig, clock: &MockClock) -> RateLimiter {
        RateLimiter::new("test", config, &quota, PriceTable::default(), clock.shared()).unwrap()
    }

    #[tokio::test]
    async fn test_bucket_rejects_past_capacity() {
        let clock = MockClock::starting_at(noon());
        let limiter = limiter(config(5), QuotaConfig::default(), &clock);

        for i in 0..5 {
            assert!(limiter.acquire(1).await.is_ok(), "request {i} should pass");
        }

        match limiter.acquire(1).await {
            Err(GateError::RateLimitExceeded { limit_type, retry_after }) => {
                assert_eq!(limit_type, RateLimitType::TokenBucket);
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert!(limiter.quota_usage().bucket_tokens >= 0.0);
    }

    #[tokio::test]
    async fn test_bucket_refills_with_time() {
        let clock = MockClock::starting_at(noon());
        let limiter = limiter(config(2), QuotaConfig::default(), &clock);

        limiter.acquire(2).await.unwrap();
        assert!(limiter.acquire(1).await.is_err());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.acquire(1).await.is_ok());
        assert!(limiter.acquire(1).await.is_err());
    }

    #[tokio::test]
    async fn test_sliding_window_limit() {
        let clock = MockClock::starting_at(noon());
        let cfg = RateLimitConfig {
            requests_per_hour: 3,
            ..config(10)
        };
        let limiter = limiter(cfg, QuotaConfig::default(), &clock);

        for _ in 0..3 {
            limiter.acquire(1).await.unwrap();
        }
        match limiter.acquire(1).await {
            Err(GateError::RateLimitExceeded { limit_type, retry_after }) => {
                assert_eq!(limit_type, RateLimitType::SlidingWindow);
                assert_eq!(retry_after, Duration::from_secs(3600));
            }
            other => panic!("expected window limit, got {other:?}"),
        }

        clock.advance(Duration::from_secs(3600));
        assert!(limiter.acquire(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_cost_over_capacity_is_invalid() {
        let clock = MockClock::starting_at(noon());
        let limiter = limiter(config(3), QuotaConfig::default(), &clock);
        let err = limiter.acquire(4).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_request");
    }

    #[tokio::test]
    async fn test_daily_quota_rejects_until_midnight() {
        let clock = MockClock::starting_at(noon());
        let quota = QuotaConfig {
            daily_token_quota: Some(1000),
            monthly_budget_usd: None,
        };
        let limiter = limiter(config(10), quota, &clock);

        limiter.record_consumption(1000, 0.01);
        match limiter.acquire(1).await {
            Err(GateError::QuotaExceeded { kind, resets_in, .. }) => {
                assert_eq!(kind, QuotaKind::DailyTokens);
                assert_eq!(resets_in, Duration::from_secs(12 * 3600));
            }
            other => panic!("expected quota error, got {other:?}"),
        }

        clock.advance(Duration::from_secs(12 * 3600));
        assert!(limiter.acquire(1).await.is_ok());
        assert_eq!(limiter.quota_usage().tokens_today, 0);
    }

    #[tokio::test]
    async fn test_projected_tokens_checked_against_quota() {
        let clock = MockClock::starting_at(noon());
        let quota = QuotaConfig {
            daily_token_quota: Some(1000),
            monthly_budget_usd: None,
        };
        let limiter = limiter(config(10), quota, &clock);
        limiter.record_consumption(900, 0.0);

        assert!(matches!(
            limiter.acquire_with_estimate(1, 200).await,
            Err(GateError::QuotaExceeded { .. })
        ));
        assert!(limiter.acquire_with_estimate(1, 50).await.is_ok());
    }

    #[tokio::test]
    async fn test_monthly_budget_resets_next_month() {
        let clock = MockClock::starting_at(noon());
        let quota = QuotaConfig {
            daily_token_quota: None,
            monthly_budget_usd: Some(1.0),
        };
        let limiter = limiter(config(10), quota, &clock);
        limiter.record_consumption(10, 1.0);

        match limiter.acquire(1).await {
            Err(err @ GateError::QuotaExceeded { .. }) => {
                assert!(!err.is_retryable());
                let april = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
                assert_eq!(err.retry_after(), Some((april - noon()).to_std().unwrap()));
            }
            other => panic!("expected budget error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_track_usage_prices_default_model() {
        let clock = MockClock::starting_at(noon());
        let limiter = limiter(config(10), QuotaConfig::default(), &clock);

        let cost = limiter.track_usage(1000, 500);
        assert!((cost - 0.0105).abs() < 1e-12);

        let today = limiter.usage_stats(UsagePeriod::Today).unwrap();
        assert_eq!(today.tokens, 1500);
        assert!(limiter.usage_stats(UsagePeriod::Week).is_none());
    }

    #[tokio::test]
    async fn test_queue_full_rejects_immediately() {
        let clock = MockClock::starting_at(noon());
        let cfg = RateLimitConfig {
            max_wait: Duration::from_millis(400),
            max_queue: 1,
            ..config(1)
        };
        let limiter = Arc::new(limiter(cfg, QuotaConfig::default(), &clock));
        limiter.acquire(1).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.waiting(), 1);

        match limiter.acquire(1).await {
            Err(GateError::RateLimitExceeded { limit_type, .. }) => {
                assert_eq!(limit_type, RateLimitType::QueueFull);
            }
            other => panic!("expected queue full, got {other:?}"),
        }

        assert!(waiter.await.unwrap().is_err());
        assert_eq!(limiter.waiting(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_slot() {
        let clock = MockClock::starting_at(noon());
        let cfg = RateLimitConfig {
            max_wait: Duration::from_secs(10),
            max_queue: 1,
            ..config(1)
        };
        let limiter = limiter(cfg, QuotaConfig::default(), &clock);
        limiter.acquire(1).await.unwrap();

        let attempt = tokio::time::timeout(Duration::from_millis(50), limiter.acquire(1)).await;
        assert!(attempt.is_err());
        assert_eq!(limiter.waiting(), 0);
    }

    #[tokio::test]
    async fn test_blocking_acquire_waits_for_refill() {
        let cfg = RateLimitConfig {
            burst_size: 1,
            requests_per_minute: 6000,
            max_wait: Duration::from_secs(2),
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(
            "test",
            cfg,
            &QuotaConfig::default(),
            PriceTable::default(),
            SystemClock::shared(),
        )
        .unwrap();

        limiter.acquire(1).await.unwrap();
        assert!(limiter.acquire(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_adaptive_rate() {
        let clock = MockClock::starting_at(noon());
        let cfg = RateLimitConfig {
            adaptive: true,
            requests_per_minute: 100,
            adaptive_decrease_factor: 0.5,
            adaptive_increase_factor: 1.5,
            adaptive_recovery_successes: 2,
            adaptive_min_rpm: 30,
            ..config(10)
        };
        let limiter = limiter(cfg, QuotaConfig::default(), &clock);

        limiter.on_upstream_throttled();
        assert!((limiter.quota_usage().refill_per_minute - 50.0).abs() < 1e-9);
        limiter.on_upstream_throttled();
        assert!((limiter.quota_usage().refill_per_minute - 30.0).abs() < 1e-9);

        limiter.on_upstream_success();
        assert!((limiter.quota_usage().refill_per_minute - 30.0).abs() < 1e-9);
        limiter.on_upstream_success();
        assert!((limiter.quota_usage().refill_per_minute - 45.0).abs() < 1e-9);

        for _ in 0..10 {
            limiter.on_upstream_success();
        }
        assert!((limiter.quota_usage().refill_per_minute - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let clock = MockClock::starting_at(noon());
        let store = Arc::new(MemoryStore::new());
        let quota = QuotaConfig {
            daily_token_quota: Some(10_000),
            monthly_budget_usd: None,
        };

        let first = limiter(config(5), quota.clone(), &clock).with_store(store.clone());
        first.acquire(3).await.unwrap();
        first.record_consumption(4_000, 0.5);
        first.set_quota(QuotaKind::DailyTokens, 5_000.0).await.unwrap();
        first.flush().await.unwrap();
        assert!(!first.is_dirty());

        clock.advance(Duration::from_secs(10));
        let second = limiter(config(5), quota, &clock).with_store(store);
        second.restore().await.unwrap();

        let usage = second.quota_usage();
        assert_eq!(usage.tokens_today, 4_000);
        assert_eq!(usage.daily_token_quota, Some(5_000));
        assert_eq!(usage.window_requests, 3);
        assert!(usage.bucket_tokens <= 5.0);
    }

    #[tokio::test]
    async fn test_restore_next_day_drops_daily_counters() {
        let clock = MockClock::starting_at(noon());
        let store = Arc::new(MemoryStore::new());

        let first = limiter(config(5), QuotaConfig::default(), &clock).with_store(store.clone());
        first.record_consumption(4_000, 0.5);
        first.flush().await.unwrap();

        clock.advance(Duration::from_secs(24 * 3600));
        let second = limiter(config(5), QuotaConfig::default(), &clock).with_store(store);
        second.restore().await.unwrap();

        let usage = second.quota_usage();
        assert_eq!(usage.tokens_today, 0);
        assert!((usage.cost_this_month - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_flush_if_due_respects_interval() {
        let clock = MockClock::starting_at(noon());
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(config(5), QuotaConfig::default(), &clock).with_store(store);

        limiter.acquire(1).await.unwrap();
        assert!(!limiter.flush_if_due().await.unwrap());
        clock.advance(Duration::from_secs(30));
        assert!(limiter.flush_if_due().await.unwrap());
        assert!(!limiter.flush_if_due().await.unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_only_raises_counters() {
        let clock = MockClock::starting_at(noon());
        let limiter = limiter(config(5), QuotaConfig::default(), &clock);
        limiter.record_consumption(500, 0.2);

        let today = UsageTotals {
            input_tokens: 300,
            output_tokens: 100,
            cost: 0.1,
            ..UsageTotals::default()
        };
        let month = UsageTotals {
            input_tokens: 2_000,
            output_tokens: 1_000,
            cost: 3.0,
            ..UsageTotals::default()
        };
        limiter.reconcile(&today, &month);

        let usage = limiter.quota_usage();
        assert_eq!(usage.tokens_today, 500);
        assert!((usage.cost_this_month - 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_set_quota_rejects_negative() {
        let clock = MockClock::starting_at(noon());
        let limiter = limiter(config(5), QuotaConfig::default(), &clock);
        assert!(limiter.set_quota(QuotaKind::MonthlyBudget, -1.0).await.is_err());
        assert!(limiter.quota(QuotaKind::MonthlyBudget).is_none());
    }
}
