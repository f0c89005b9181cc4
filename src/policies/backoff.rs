//! # Backoff policy for retried calls.
//!
//! [`BackoffPolicy`] controls how retry delays grow after repeated failures.
//! It is parameterized by:
//! - [`BackoffPolicy::base`] the delay before the first retry;
//! - [`BackoffPolicy::multiplier`] the multiplicative growth factor;
//! - [`BackoffPolicy::max`] the maximum delay cap.
//!
//! The delay before retry `n` (1-based) is `base × multiplier^(n−1)`, clamped to
//! `max`, then jitter is applied. The base delay is derived purely from `n`, so
//! jitter output never feeds back into later delays.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use hubvisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     base: Duration::from_millis(1000),
//!     max: Duration::from_secs(30),
//!     multiplier: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.delay(1), Duration::from_millis(1000));
//! assert_eq!(backoff.delay(2), Duration::from_millis(2000));
//! assert_eq!(backoff.delay(6), Duration::from_secs(30));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policies::jitter::JitterPolicy;

/// Retry backoff policy.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub multiplier: f64,
    /// Jitter applied to the clamped delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Returns a policy with:
    /// - `base = 1s`;
    /// - `multiplier = 2.0`;
    /// - `max = 30s`;
    /// - no jitter.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay before retry number `retry` (1-based).
    ///
    /// `retry = 0` is treated like `1`. Non-finite or negative intermediate
    /// values clamp to `max`; the jittered result never goes below zero.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_secs = self.max.as_secs_f64();
        let unclamped = self.base.as_secs_f64() * self.multiplier.powi(exp);

        let clamped = if !unclamped.is_finite() || unclamped < 0.0 || unclamped > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped)
        };

        self.jitter.apply(clamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: JitterPolicy) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_sequence_no_jitter() {
        let p = policy(JitterPolicy::None);
        let got: Vec<u64> = (1..=8).map(|n| p.delay(n).as_millis() as u64).collect();
        assert_eq!(
            got,
            vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn test_retry_zero_behaves_like_first() {
        let p = policy(JitterPolicy::None);
        assert_eq!(p.delay(0), Duration::from_millis(1000));
    }

    #[test]
    fn test_constant_multiplier() {
        let p = BackoffPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 1.0,
            jitter: JitterPolicy::None,
        };
        for n in 1..10 {
            assert_eq!(p.delay(n), Duration::from_millis(500), "retry {n}");
        }
    }

    #[test]
    fn test_base_exceeds_max() {
        let p = BackoffPolicy {
            base: Duration::from_secs(10),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: JitterPolicy::None,
        };
        assert_eq!(p.delay(1), Duration::from_secs(5));
    }

    #[test]
    fn test_huge_retry_clamps_to_max() {
        let p = policy(JitterPolicy::None);
        assert_eq!(p.delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_spread_jitter_stays_within_five_percent() {
        let p = policy(JitterPolicy::Spread);
        for n in 1..=8 {
            let base = (1000.0 * 2.0f64.powi(n as i32 - 1)).min(30_000.0);
            for _ in 0..50 {
                let ms = p.delay(n).as_secs_f64() * 1000.0;
                assert!(ms >= base * 0.95 - 1.0, "retry {n}: {ms} below band");
                assert!(ms <= base * 1.05 + 1.0, "retry {n}: {ms} above band");
            }
        }
    }
}
