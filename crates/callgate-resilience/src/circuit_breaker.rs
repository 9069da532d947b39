//! Circuit breaker guarding the upstream generator.
//!
//! Trips on the failure *ratio* over a sliding sample window, and only once
//! the window holds at least `min_throughput` outcomes. A handful of early
//! failures under low traffic therefore never opens the circuit.
//!
//! ```text
//!   Closed --ratio > threshold--> Open --break elapsed--> HalfOpen
//!     ^                            ^                        |
//!     |                            +------any failure-------+
//!     +-------------success_threshold successes------------+
//!
//!   Isolated: entered by force_open(), left by force_closed()/reset()
//! ```

use callgate_config::CircuitBreakerConfig;
use callgate_core::{GateError, GateResult, SharedClock};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the break duration elapses
    Open,
    /// A bounded number of probe calls are let through
    HalfOpen,
    /// Manually opened; only an operator can close it
    Isolated,
}

impl CircuitState {
    /// Label used in logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
            Self::Isolated => "isolated",
        }
    }

    /// Numeric encoding for gauges
    #[must_use]
    pub fn as_gauge(self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
            Self::Isolated => 3,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Failures recorded since the last reset
    pub failure_count: u64,
    /// Successes recorded since the last reset
    pub success_count: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Consecutive trips without closing in between
    pub trips: u32,
    /// Outcomes in the sample window
    pub samples: usize,
    /// Failure ratio over the sample window
    pub failure_ratio: f64,
    /// Wall time of the last failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Wall time of the last success
    pub last_success_at: Option<DateTime<Utc>>,
    /// Time since the last transition
    #[serde(with = "duration_ms")]
    pub time_in_state: Duration,
    /// Remaining open time, when open
    #[serde(with = "option_duration_ms")]
    pub remaining_open: Option<Duration>,
    /// State changes since creation
    pub transitions: u64,
    /// Most recent state change
    pub last_transition: Option<CircuitTransition>,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

mod option_duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

/// Transitions kept per breaker
const TRANSITION_HISTORY: usize = 32;

/// Smallest retry hint handed to rejected callers
const MIN_RETRY_AFTER: Duration = Duration::from_millis(100);

/// Why a breaker changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// Failure ratio over the sample window crossed the threshold
    FailureRatio,
    /// Break duration elapsed
    BreakElapsed,
    /// A half-open call failed
    HalfOpenFailure,
    /// Enough half-open calls succeeded
    HalfOpenRecovered,
    /// Operator isolated the breaker
    ForcedOpen,
    /// Operator closed the breaker
    ForcedClosed,
    /// Operator reset the breaker
    Reset,
}

impl TransitionCause {
    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailureRatio => "failure_ratio",
            Self::BreakElapsed => "break_elapsed",
            Self::HalfOpenFailure => "half_open_failure",
            Self::HalfOpenRecovered => "half_open_recovered",
            Self::ForcedOpen => "forced_open",
            Self::ForcedClosed => "forced_closed",
            Self::Reset => "reset",
        }
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitTransition {
    /// Per-breaker sequence number, starting at 1
    pub seq: u64,
    /// State left
    pub from: CircuitState,
    /// State entered
    pub to: CircuitState,
    /// Trigger
    pub cause: TransitionCause,
    /// Wall time of the change
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    state_changed_at: Instant,
    samples: VecDeque<(Instant, bool)>,
    failure_count: u64,
    success_count: u64,
    consecutive_failures: u32,
    trips: u32,
    open_until: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    seq: u64,
    reported: u64,
    history: VecDeque<CircuitTransition>,
}

impl Inner {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            state_changed_at: now,
            samples: VecDeque::new(),
            failure_count: 0,
            success_count: 0,
            consecutive_failures: 0,
            trips: 0,
            open_until: None,
            probes_in_flight: 0,
            probe_successes: 0,
            last_failure_at: None,
            last_success_at: None,
            seq: 0,
            reported: 0,
            history: VecDeque::with_capacity(TRANSITION_HISTORY),
        }
    }

    fn transition(&mut self, to: CircuitState, cause: TransitionCause, now: Instant, wall: DateTime<Utc>) {
        let from = self.state;
        self.state = to;
        self.state_changed_at = now;
        self.probes_in_flight = 0;
        self.probe_successes = 0;
        if to != CircuitState::Open {
            self.open_until = None;
        }
        if from != to {
            self.record(from, to, cause, wall);
        }
    }

    /// Every recorded change bumps `seq`, which also retires half-open
    /// permits granted before it
    fn record(&mut self, from: CircuitState, to: CircuitState, cause: TransitionCause, wall: DateTime<Utc>) {
        self.seq += 1;
        if self.history.len() == TRANSITION_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(CircuitTransition {
            seq: self.seq,
            from,
            to,
            cause,
            at: wall,
        });
    }

    #[allow(clippy::cast_precision_loss)]
    fn failure_ratio(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.samples.len() as f64
    }
}

/// Admission through a [`CircuitBreaker`].
///
/// Report the outcome with [`CallPermit::record_success`] or
/// [`CallPermit::record_failure`]. A half-open permit dropped without an
/// outcome, for instance because its caller was cancelled, hands its slot
/// back.
#[derive(Debug)]
#[must_use = "a permit dropped without an outcome is released unused"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    half_open: bool,
    seq: u64,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call occupies a half-open slot
    #[must_use]
    pub fn is_half_open(&self) -> bool {
        self.half_open
    }

    /// Report a successful call
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    /// Report a failed call
    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.half_open && !self.settled {
            self.breaker.return_slot(self.seq);
        }
    }
}

/// Ratio-based circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.inner.lock().state)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a breaker
    ///
    /// # Errors
    /// Returns `GateError::Configuration` for a ratio outside `(0, 1]` or a
    /// sample window that can never reach the throughput floor
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> GateResult<Self> {
        if !(config.failure_ratio > 0.0 && config.failure_ratio <= 1.0) {
            return Err(GateError::configuration(format!(
                "circuit breaker failure_ratio must be in (0, 1], got {}",
                config.failure_ratio
            )));
        }
        if config.min_throughput == 0 || config.window_size < config.min_throughput {
            return Err(GateError::configuration(
                "circuit breaker window_size must be at least min_throughput (and non-zero)",
            ));
        }
        if config.half_open_max_probes == 0 || config.success_threshold == 0 {
            return Err(GateError::configuration(
                "circuit breaker probes and success threshold must be at least 1",
            ));
        }

        let now = clock.now();
        Ok(Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner::new(now)),
        })
    }

    /// Breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit a call. `None` means the call must be rejected.
    ///
    /// Isolation rejects even when the breaker is disabled in config.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Isolated {
            return None;
        }
        let seq = inner.seq;
        if !self.config.enabled {
            return Some(self.permit(false, seq));
        }
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Some(self.permit(false, inner.seq)),
            CircuitState::Open | CircuitState::Isolated => None,
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_probes {
                    inner.probes_in_flight += 1;
                    debug!(breaker = %self.name, probes = inner.probes_in_flight, "Half-open probe admitted");
                    Some(self.permit(true, inner.seq))
                } else {
                    None
                }
            }
        }
    }

    /// Whether a call may proceed.
    ///
    /// In half-open state a `true` result reserves a probe slot that must be
    /// settled by `on_success`, `on_failure` or `release_probe`. Callers that
    /// may be cancelled should use [`CircuitBreaker::try_acquire`].
    pub fn allow(&self) -> bool {
        self.try_acquire().map(|mut permit| permit.settled = true).is_some()
    }

    fn permit(&self, half_open: bool, seq: u64) -> CallPermit<'_> {
        CallPermit {
            breaker: self,
            half_open,
            seq,
            settled: false,
        }
    }

    /// Record a successful call
    pub fn on_success(&self) {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);

        inner.success_count += 1;
        inner.consecutive_failures = 0;
        inner.last_success_at = Some(wall);

        match inner.state {
            CircuitState::Closed => {
                inner.samples.push_back((now, true));
                self.prune(&mut inner, now);
            }
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.success_threshold {
                    inner.transition(CircuitState::Closed, TransitionCause::HalfOpenRecovered, now, wall);
                    inner.samples.clear();
                    inner.trips = 0;
                    info!(breaker = %self.name, "Circuit breaker closed");
                }
            }
            CircuitState::Open | CircuitState::Isolated => {}
        }
    }

    /// Record a failed call
    pub fn on_failure(&self) {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);

        inner.failure_count += 1;
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(wall);

        match inner.state {
            CircuitState::Closed => {
                inner.samples.push_back((now, false));
                self.prune(&mut inner, now);

                let samples = inner.samples.len();
                let ratio = inner.failure_ratio();
                if samples >= self.config.min_throughput as usize && ratio > self.config.failure_ratio {
                    self.trip(&mut inner, TransitionCause::FailureRatio, now, wall, ratio);
                }
            }
            CircuitState::HalfOpen => {
                let ratio = inner.failure_ratio();
                self.trip(&mut inner, TransitionCause::HalfOpenFailure, now, wall, ratio);
            }
            CircuitState::Open | CircuitState::Isolated => {}
        }
    }

    /// Return a half-open probe slot that was granted but never used
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    /// Slots granted before a later transition were already cleared
    fn return_slot(&self, seq: u64) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.seq == seq {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            debug!(breaker = %self.name, "Unsettled half-open slot released");
        }
    }

    /// Isolate the upstream; calls are rejected until an operator closes it
    pub fn force_open(&self) {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Isolated {
            inner.transition(CircuitState::Isolated, TransitionCause::ForcedOpen, now, wall);
            warn!(breaker = %self.name, "Circuit breaker isolated by operator");
        }
    }

    /// Close the circuit, leaving isolation if active
    pub fn force_closed(&self) {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed, TransitionCause::ForcedClosed, now, wall);
        inner.samples.clear();
        inner.trips = 0;
        info!(breaker = %self.name, "Circuit breaker closed by operator");
    }

    /// Close the circuit and clear every counter; the transition history is kept
    pub fn reset(&self) {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut inner = self.inner.lock();
        let previous = std::mem::replace(&mut *inner, Inner::new(now));
        inner.seq = previous.seq;
        inner.reported = previous.reported;
        inner.history = previous.history;
        if previous.state != CircuitState::Closed {
            inner.record(previous.state, CircuitState::Closed, TransitionCause::Reset, wall);
        }
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    /// Whether an operator isolated the circuit
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.inner.lock().state == CircuitState::Isolated
    }

    /// Time since the last transition
    #[must_use]
    pub fn time_in_state(&self) -> Duration {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        now.saturating_duration_since(inner.state_changed_at)
    }

    /// Remaining open time; `None` unless the circuit is open
    #[must_use]
    pub fn remaining_open(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        match inner.state {
            CircuitState::Open => inner.open_until.map(|until| until.saturating_duration_since(now)),
            _ => None,
        }
    }

    /// Wait hint for a rejected caller: the remaining open time, otherwise
    /// the configured break duration. Never below 100ms.
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        self.remaining_open()
            .unwrap_or(self.config.break_duration)
            .max(MIN_RETRY_AFTER)
    }

    /// Latest transitions, newest first
    #[must_use]
    pub fn recent_transitions(&self, limit: usize) -> Vec<CircuitTransition> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.history.iter().rev().take(limit).cloned().collect()
    }

    /// Transitions not returned by a previous call, oldest first
    pub fn unreported_transitions(&self) -> Vec<CircuitTransition> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        let since = inner.reported;
        inner.reported = inner.seq;
        inner
            .history
            .iter()
            .filter(|t| t.seq > since)
            .cloned()
            .collect()
    }

    /// Full counter view
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        self.prune(&mut inner, now);

        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            consecutive_failures: inner.consecutive_failures,
            trips: inner.trips,
            samples: inner.samples.len(),
            failure_ratio: inner.failure_ratio(),
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            time_in_state: now.saturating_duration_since(inner.state_changed_at),
            remaining_open: match inner.state {
                CircuitState::Open => inner.open_until.map(|u| u.saturating_duration_since(now)),
                _ => None,
            },
            transitions: inner.seq,
            last_transition: inner.history.back().cloned(),
        }
    }

    /// Open duration for the given consecutive trip count
    #[must_use]
    pub fn break_duration_for(&self, trips: u32) -> Duration {
        let exponent = i32::try_from(trips.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.config.break_duration.as_secs_f64() * self.config.break_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.config.max_break_duration.as_secs_f64()))
    }

    fn trip(&self, inner: &mut Inner, cause: TransitionCause, now: Instant, wall: DateTime<Utc>, ratio: f64) {
        inner.trips += 1;
        let break_for = self.break_duration_for(inner.trips);
        inner.transition(CircuitState::Open, cause, now, wall);
        inner.open_until = Some(now + break_for);
        inner.samples.clear();
        warn!(
            breaker = %self.name,
            cause = cause.as_str(),
            failure_ratio = ratio,
            trips = inner.trips,
            break_ms = break_for.as_millis(),
            "Circuit breaker opened"
        );
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open && inner.open_until.map_or(true, |until| now >= until) {
            inner.transition(CircuitState::HalfOpen, TransitionCause::BreakElapsed, now, self.clock.wall());
            info!(breaker = %self.name, "Circuit breaker half-open");
        }
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while inner
            .samples
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) > self.config.sample_window)
        {
            inner.samples.pop_front();
        }
        while inner.samples.len() > self.config.window_size as usize {
            inner.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callgate_core::MockClock;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
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

    fn breaker(clock: &MockClock) -> CircuitBreaker {
        CircuitBreaker::new("upstream", config(), clock.shared()).unwrap()
    }

    #[test]
    fn test_throughput_floor_prevents_early_trip() {
        let clock = MockClock::new();
        let cb = breaker(&clock);

        cb.on_success();
        for _ in 0..4 {
            cb.on_failure();
        }

        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn test_ratio_over_floor_trips() {
        let clock = MockClock::new();
        let cb = breaker(&clock);

        for _ in 0..4 {
            cb.on_success();
        }
        for _ in 0..6 {
            cb.on_failure();
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
        assert_eq!(cb.remaining_open(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_ratio_at_threshold_does_not_trip() {
        let clock = MockClock::new();
        let cb = breaker(&clock);

        for _ in 0..5 {
            cb.on_success();
        }
        for _ in 0..5 {
            cb.on_failure();
        }

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_probe_then_reopens() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        for _ in 0..4 {
            cb.on_success();
        }
        for _ in 0..6 {
            cb.on_failure();
        }

        clock.advance(Duration::from_secs(31));
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.allow());

        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().trips, 2);
        assert_eq!(cb.remaining_open(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_half_open_success_closes() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        for _ in 0..10 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        assert!(cb.allow());
        cb.on_success();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().trips, 0);
        assert!(cb.allow());
    }

    #[test]
    fn test_released_probe_can_be_reused() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        for _ in 0..10 {
            cb.on_failure();
        }
        clock.advance(Duration::from_secs(30));

        assert!(cb.allow());
        assert!(!cb.allow());
        cb.release_probe();
        assert!(cb.allow());
    }

    #[test]
    fn test_break_duration_grows_and_caps() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        assert_eq!(cb.break_duration_for(1), Duration::from_secs(30));
        assert_eq!(cb.break_duration_for(2), Duration::from_secs(60));
        assert_eq!(cb.break_duration_for(3), Duration::from_secs(120));
        assert_eq!(cb.break_duration_for(10), Duration::from_secs(300));
    }

    #[test]
    fn test_isolation_overrides_automatic_logic() {
        let clock = MockClock::new();
        let cb = breaker(&clock);

        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Isolated);
        assert!(!cb.allow());

        for _ in 0..20 {
            cb.on_success();
        }
        clock.advance(Duration::from_secs(3600));
        assert_eq!(cb.state(), CircuitState::Isolated);
        assert!(!cb.allow());

        cb.force_closed();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn test_old_samples_expire() {
        let clock = MockClock::new();
        let cb = breaker(&clock);

        for _ in 0..9 {
            cb.on_failure();
        }
        clock.advance(Duration::from_secs(61));
        cb.on_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().samples, 1);
    }

    #[test]
    fn test_reset_clears_counters() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        for _ in 0..10 {
            cb.on_failure();
        }
        cb.reset();

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let clock = MockClock::new();
        let mut bad = config();
        bad.failure_ratio = 0.0;
        assert!(CircuitBreaker::new("x", bad, clock.shared()).is_err());

        let mut bad = config();
        bad.window_size = 5;
        assert!(CircuitBreaker::new("x", bad, clock.shared()).is_err());
    }

    #[test]
    fn test_disabled_breaker_always_allows() {
        let clock = MockClock::new();
        let mut cfg = config();
        cfg.enabled = false;
        let cb = CircuitBreaker::new("x", cfg, clock.shared()).unwrap();
        for _ in 0..20 {
            cb.on_failure();
        }
        assert!(cb.allow());
    }

    #[test]
    fn test_isolation_rejects_when_disabled() {
        let clock = MockClock::new();
        let mut cfg = config();
        cfg.enabled = false;
        let cb = CircuitBreaker::new("x", cfg, clock.shared()).unwrap();

        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Isolated);
        assert!(!cb.allow());
        assert!(cb.try_acquire().is_none());

        cb.force_closed();
        assert!(cb.allow());
    }

    #[test]
    fn test_dropped_half_open_permit_frees_slot() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        for _ in 0..10 {
            cb.on_failure();
        }
        clock.advance(Duration::from_secs(30));

        let permit = cb.try_acquire().unwrap();
        assert!(permit.is_half_open());
        assert!(cb.try_acquire().is_none());
        drop(permit);

        let permit = cb.try_acquire().unwrap();
        permit.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_stale_permit_does_not_free_newer_slot() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        for _ in 0..10 {
            cb.on_failure();
        }
        clock.advance(Duration::from_secs(30));
        let stale = cb.try_acquire().unwrap();

        // Another caller fails the half-open call; the circuit reopens, then half-opens again
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        clock.advance(Duration::from_secs(60));
        let current = cb.try_acquire().unwrap();
        assert!(current.is_half_open());

        drop(stale);
        assert!(cb.try_acquire().is_none());
        drop(current);
        assert!(cb.try_acquire().is_some());
    }

    #[test]
    fn test_closed_permit_records_outcomes() {
        let clock = MockClock::new();
        let cb = breaker(&clock);

        let permit = cb.try_acquire().unwrap();
        assert!(!permit.is_half_open());
        permit.record_failure();
        cb.try_acquire().unwrap().record_success();
        // Dropping a closed permit records nothing
        drop(cb.try_acquire().unwrap());

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.success_count, 1);
        assert_eq!(snapshot.samples, 2);
    }

    #[test]
    fn test_retry_after_never_zero() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        for _ in 0..10 {
            cb.on_failure();
        }
        assert_eq!(cb.retry_after(), Duration::from_secs(30));

        clock.advance(Duration::from_secs(30));
        let _held = cb.try_acquire().unwrap();
        assert!(cb.try_acquire().is_none());
        assert_eq!(cb.retry_after(), Duration::from_secs(30));

        let mut cfg = config();
        cfg.break_duration = Duration::from_millis(5);
        let short = CircuitBreaker::new("short", cfg, clock.shared()).unwrap();
        assert_eq!(short.retry_after(), Duration::from_millis(100));
    }

    #[test]
    fn test_transitions_recorded_with_causes() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        for _ in 0..10 {
            cb.on_failure();
        }
        clock.advance(Duration::from_secs(30));
        cb.try_acquire().unwrap().record_success();
        cb.force_open();
        cb.reset();

        let causes: Vec<_> = cb
            .recent_transitions(10)
            .into_iter()
            .map(|t| (t.seq, t.to, t.cause))
            .collect();
        assert_eq!(
            causes,
            vec![
                (5, CircuitState::Closed, TransitionCause::Reset),
                (4, CircuitState::Isolated, TransitionCause::ForcedOpen),
                (3, CircuitState::Closed, TransitionCause::HalfOpenRecovered),
                (2, CircuitState::HalfOpen, TransitionCause::BreakElapsed),
                (1, CircuitState::Open, TransitionCause::FailureRatio),
            ]
        );
        assert_eq!(cb.recent_transitions(1)[0].from, CircuitState::Isolated);

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.transitions, 5);
        assert_eq!(
            snapshot.last_transition.map(|t| t.cause),
            Some(TransitionCause::Reset)
        );
    }

    #[test]
    fn test_unreported_transitions_returned_once() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        assert!(cb.unreported_transitions().is_empty());

        for _ in 0..10 {
            cb.on_failure();
        }
        let first = cb.unreported_transitions();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].cause, TransitionCause::FailureRatio);
        assert!(cb.unreported_transitions().is_empty());

        // Elapsing the break is picked up by the read itself
        clock.advance(Duration::from_secs(30));
        let second = cb.unreported_transitions();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].to, CircuitState::HalfOpen);
    }

    #[test]
    fn test_transition_history_is_bounded() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        for _ in 0..40 {
            cb.force_open();
            cb.force_closed();
        }

        let recent = cb.recent_transitions(usize::MAX);
        assert_eq!(recent.len(), TRANSITION_HISTORY);
        assert_eq!(recent[0].seq, 80);
        assert_eq!(cb.snapshot().transitions, 80);
    }

    #[test]
    fn test_debug_shows_name_and_state() {
        let clock = MockClock::new();
        let cb = breaker(&clock);
        cb.force_open();

        let rendered = format!("{cb:?}");
        assert!(rendered.contains("\"upstream\""));
        assert!(rendered.contains("Isolated"));
    }
}
