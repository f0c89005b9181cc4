//! # Jitter policy for retry delays.
//!
//! [`JitterPolicy`] adds randomness to backoff delays so that many callers
//! retrying the same dependency do not wake up in lockstep.
//!
//! - [`JitterPolicy::None`]: exact delay
//! - [`JitterPolicy::Spread`]: delay ± 5% (the retry presets' default)
//! - [`JitterPolicy::Equal`]: delay/2 + random[0, delay/2]

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fraction of the delay used by [`JitterPolicy::Spread`].
pub const SPREAD_RATIO: f64 = 0.05;

/// Policy controlling randomization of retry delays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterPolicy {
    /// No jitter: use the exact backoff delay.
    #[default]
    None,

    /// Symmetric jitter: uniform in `[delay × 0.95, delay × 1.05]`.
    ///
    /// Keeps the backoff curve recognisable while breaking synchronisation.
    Spread,

    /// Equal jitter: `delay/2 + random[0, delay/2]`.
    ///
    /// Used for restart scheduling where shortening a delay is acceptable but
    /// lengthening it is not.
    Equal,
}

impl JitterPolicy {
    /// Applies jitter to the given delay. The result is never negative.
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Spread => spread_jitter(delay),
            JitterPolicy::Equal => equal_jitter(delay),
        }
    }
}

/// delay ± delay × SPREAD_RATIO
fn spread_jitter(delay: Duration) -> Duration {
    let secs = delay.as_secs_f64();
    if secs == 0.0 {
        return Duration::ZERO;
    }
    let offset = rand::rng().random_range(-SPREAD_RATIO..=SPREAD_RATIO) * secs;
    Duration::from_secs_f64((secs + offset).max(0.0))
}

/// delay/2 + random[0, delay/2]
fn equal_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    let half = ms / 2;
    let jitter = if half == 0 {
        0
    } else {
        rand::rng().random_range(0..=half)
    };
    Duration::from_millis(half + jitter)
}
