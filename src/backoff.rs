//! Backoff calculation for the attempt loop
//!
//! Delays grow according to the configured strategy, get an optional jitter
//! multiplier to avoid thundering herds, and are always capped at the
//! caller's maximum allowed wait.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Growth strategy for the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RetryStrategy {
    /// Fixed delay between retries
    #[default]
    Fixed,

    /// Linear increase in delay (attempt * wait)
    Linear,

    /// Exponential increase in delay (wait * 2^(attempt-1))
    Exponential,
}

/// Backoff configuration resolved from the request options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base wait in milliseconds
    pub wait_ms: u64,

    /// Hard cap applied after strategy and jitter
    pub max_allowed_wait_ms: u64,

    pub strategy: RetryStrategy,

    /// Jitter factor in `[0, 1)`; the computed delay is multiplied by a
    /// uniform factor in `[1 - jitter, 1 + jitter]`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            wait_ms: 1_000,
            max_allowed_wait_ms: 60_000,
            strategy: RetryStrategy::Fixed,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay to sleep after the given one-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);

        let base_ms = match self.strategy {
            RetryStrategy::Fixed => self.wait_ms,
            RetryStrategy::Linear => self.wait_ms.saturating_mul(u64::from(attempt)),
            RetryStrategy::Exponential => {
                let exp = (attempt - 1).min(32);
                self.wait_ms.saturating_mul(1u64 << exp)
            }
        };

        let with_jitter = if self.jitter > 0.0 {
            let factor = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
            (base_ms as f64 * factor).round() as u64
        } else {
            base_ms
        };

        Duration::from_millis(with_jitter.min(self.max_allowed_wait_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy, wait_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            wait_ms,
            max_allowed_wait_ms: 60_000,
            strategy,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_fixed_delay() {
        let p = policy(RetryStrategy::Fixed, 250);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(p.delay_for_attempt(5), Duration::from_millis(250));
    }

    #[test]
    fn test_linear_delay() {
        let p = policy(RetryStrategy::Linear, 100);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_delay() {
        let p = policy(RetryStrategy::Exponential, 100);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100)); // 100 * 2^0
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200)); // 100 * 2^1
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(400)); // 100 * 2^2
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(800)); // 100 * 2^3
    }

    #[test]
    fn test_delay_capped_at_max() {
        let p = BackoffPolicy {
            wait_ms: 1_000,
            max_allowed_wait_ms: 5_000,
            strategy: RetryStrategy::Exponential,
            jitter: 0.0,
        };
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(5_000));
        assert_eq!(p.delay_for_attempt(10), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let p = BackoffPolicy {
            wait_ms: 1_000,
            max_allowed_wait_ms: 60_000,
            strategy: RetryStrategy::Fixed,
            jitter: 0.5,
        };

        for _ in 0..100 {
            let d = p.delay_for_attempt(1).as_millis() as u64;
            assert!((500..=1_500).contains(&d), "delay {} outside jitter band", d);
        }
    }

    #[test]
    fn test_jitter_produces_variation() {
        let p = BackoffPolicy {
            wait_ms: 10_000,
            max_allowed_wait_ms: 60_000,
            strategy: RetryStrategy::Fixed,
            jitter: 0.5,
        };

        let delays: std::collections::HashSet<_> =
            (0..20).map(|_| p.delay_for_attempt(1)).collect();
        assert!(delays.len() > 1, "expected jitter to produce variation");
    }

    #[test]
    fn test_exponential_overflow_saturates() {
        let p = policy(RetryStrategy::Exponential, u64::MAX / 2);
        // Saturating math, then the cap takes over.
        assert_eq!(p.delay_for_attempt(60), Duration::from_millis(60_000));
    }
}
