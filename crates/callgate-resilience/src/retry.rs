//! Retry policy with exponential backoff and jitter.
//!
//! The policy only decides *whether* and *when*; the gate owns the loop.

use callgate_config::RetryConfig;
use callgate_core::UpstreamError;
use rand::Rng;
use std::time::Duration;

/// Randomization applied to a computed backoff delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the exact exponential delay
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// Uniform in `[delay * (1 - f), delay * (1 + f)]`
    Proportional(f64),
}

/// Retry policy for transient upstream failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: Jitter,
}

impl RetryPolicy {
    /// Create a policy
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: Jitter,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
            jitter,
        }
    }

    /// Build from configuration
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        let jitter = if config.jitter > 0.0 {
            Jitter::Proportional(config.jitter)
        } else {
            Jitter::None
        };
        Self::new(
            config.max_attempts,
            config.base_delay,
            config.max_delay,
            config.multiplier,
            jitter,
        )
    }

    /// A policy that never retries
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0, Jitter::None)
    }

    /// Physical attempts allowed per logical request
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another
    #[must_use]
    pub fn should_retry(&self, error: &UpstreamError, attempt: u32) -> bool {
        error.retryable && attempt < self.max_attempts
    }

    /// Delay before the attempt following attempt number `attempt`
    ///
    /// A server-provided hint raises the delay but never beyond `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        self.delay_with_rng(attempt, hint, &mut rand::thread_rng())
    }

    fn delay_with_rng<R: Rng>(&self, attempt: u32, hint: Option<Duration>, rng: &mut R) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let jittered = match self.jitter {
            Jitter::None => capped,
            Jitter::Full => rng.gen_range(0.0..=capped),
            Jitter::Proportional(factor) => {
                let factor = factor.clamp(0.0, 1.0);
                capped * rng.gen_range((1.0 - factor)..=(1.0 + factor))
            }
        };

        let delay = Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay.as_secs_f64()));
        match hint {
            Some(hint) => delay.max(hint.min(self.max_delay)),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy(jitter: Jitter) -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), Duration::from_secs(1), 2.0, jitter)
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let policy = policy(Jitter::None);
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5, None), Duration::from_secs(1));
    }

    #[test]
    fn test_proportional_jitter_bounds() {
        let policy = policy(Jitter::Proportional(0.25));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let delay = policy.delay_with_rng(2, None, &mut rng);
            assert!(delay >= Duration::from_millis(150));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_full_jitter_bounds() {
        let policy = policy(Jitter::Full);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            assert!(policy.delay_with_rng(3, None, &mut rng) <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_server_hint_raises_delay() {
        let policy = policy(Jitter::None);
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_millis(700))),
            Duration::from_millis(700)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(60))),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_should_retry() {
        let policy = policy(Jitter::None);
        let transient = UpstreamError::from_status(503, "busy");
        let permanent = UpstreamError::from_status(400, "bad");

        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 3));
        assert!(!policy.should_retry(&transient, 4));
        assert!(!policy.should_retry(&permanent, 1));
        assert!(!RetryPolicy::no_retry().should_retry(&transient, 1));
    }
}
