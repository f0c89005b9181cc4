//! # Retry controller with exponential backoff.
//!
//! [`Retry`] runs an operation, and on failure decides whether to try again:
//!
//! ```text
//! attempt 0 ──► op() ── Ok ──► return
//!                 │
//!                Err ──► attempt == max_retries? ──► return Err(last)
//!                 │      condition rejects kind?  ──► return Err(last)
//!                 ▼
//!        delay = backoff.delay(attempt + 1) ─► sleep ─► attempt += 1 ─► op()
//! ```
//!
//! Presets ([`RetryConfig::network`], [`RetryConfig::database`],
//! [`RetryConfig::authentication`]) only differ in thresholds and in which
//! [`FailureKind`]s they retry.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::policies::{BackoffPolicy, JitterPolicy};
use crate::resilience::{Classify, FailureKind};

/// Predicate deciding whether a failure category is worth retrying.
pub type RetryCondition = Arc<dyn Fn(FailureKind) -> bool + Send + Sync>;

/// Retry thresholds and predicate.
#[derive(Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt (`0` = run once).
    pub max_retries: u32,
    /// Delay curve between attempts.
    pub backoff: BackoffPolicy,
    /// `None` retries every failure.
    pub condition: Option<RetryCondition>,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("condition", &self.condition.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for RetryConfig {
    /// 3 retries, 1s → 30s doubling with ±5% jitter, every failure retried.
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: JitterPolicy::Spread,
            },
            condition: None,
        }
    }
}

impl RetryConfig {
    /// Retries connection resets/refusals, timeouts and unavailability.
    pub fn network() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(10),
                multiplier: 2.0,
                jitter: JitterPolicy::Spread,
            },
            condition: None,
        }
        .retry_on(&[
            FailureKind::ConnectionReset,
            FailureKind::ConnectionRefused,
            FailureKind::Timeout,
            FailureKind::Unavailable,
        ])
    }

    /// Retries deadlocks, timeouts and dropped connections.
    pub fn database() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffPolicy {
                base: Duration::from_millis(500),
                max: Duration::from_secs(5),
                multiplier: 1.5,
                jitter: JitterPolicy::Spread,
            },
            condition: None,
        }
        .retry_on(&[
            FailureKind::Deadlock,
            FailureKind::Timeout,
            FailureKind::ConnectionReset,
            FailureKind::ConnectionRefused,
        ])
    }

    /// Retries only expired credentials, quickly and few times.
    pub fn authentication() -> Self {
        Self {
            max_retries: 2,
            backoff: BackoffPolicy {
                base: Duration::from_millis(200),
                max: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: JitterPolicy::None,
            },
            condition: None,
        }
        .retry_on(&[FailureKind::TokenExpired])
    }

    /// Looks up a preset by name (`network`, `database`, `authentication`, `default`).
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "network" => Some(Self::network()),
            "database" => Some(Self::database()),
            "authentication" | "auth" => Some(Self::authentication()),
            "default" => Some(Self::default()),
            _ => None,
        }
    }

    /// Restricts retries to the given failure kinds.
    pub fn retry_on(mut self, kinds: &[FailureKind]) -> Self {
        let kinds: Vec<FailureKind> = kinds.to_vec();
        self.condition = Some(Arc::new(move |k| kinds.contains(&k)));
        self
    }

    /// Replaces the retry predicate.
    pub fn with_condition(
        mut self,
        condition: impl Fn(FailureKind) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    fn allows(&self, kind: FailureKind) -> bool {
        self.condition.as_ref().is_none_or(|c| c(kind))
    }
}

/// Per-invocation retry state handed to the operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryContext {
    /// 0 for the initial attempt, then 1, 2, ...
    pub attempt: u32,
    /// Delay slept before this attempt (`ZERO` for the first).
    pub delay: Duration,
}

/// Retry controller bound to one configuration.
#[derive(Clone, Debug)]
pub struct Retry {
    name: Arc<str>,
    config: RetryConfig,
}

impl Retry {
    /// Creates a controller; `name` only labels log lines.
    pub fn new(name: impl Into<Arc<str>>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Controller configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `op` until it succeeds, the retry budget is spent, or the
    /// condition rejects the failure. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut ctx = RetryContext {
            attempt: 0,
            delay: Duration::ZERO,
        };
        loop {
            let err = match op(ctx).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            let kind = err.failure_kind();
            if ctx.attempt >= self.config.max_retries {
                tracing::debug!(retry = %self.name, attempts = ctx.attempt + 1, error = %err, "retries exhausted");
                return Err(err);
            }
            if !self.config.allows(kind) {
                tracing::debug!(retry = %self.name, ?kind, error = %err, "failure not retryable");
                return Err(err);
            }

            let next = ctx.attempt + 1;
            let delay = self.config.backoff.delay(next);
            tracing::debug!(
                retry = %self.name,
                attempt = next,
                delay_ms = delay.as_millis() as u64,
                ?kind,
                error = %err,
                "retrying"
            );
            tokio::time::sleep(delay).await;
            ctx = RetryContext {
                attempt: next,
                delay,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    fn fixed(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            backoff: BackoffPolicy {
                base: Duration::from_millis(1000),
                max: Duration::from_millis(30_000),
                multiplier: 2.0,
                jitter: JitterPolicy::None,
            },
            condition: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_follow_backoff_curve() {
        let retry = Retry::new("t", fixed(7));
        let seen = Mutex::new(Vec::new());
        let start = Instant::now();

        let res: Result<(), String> = retry
            .run(|ctx| {
                seen.lock().push((ctx.attempt, ctx.delay.as_millis() as u64));
                async { Err("connection reset".to_string()) }
            })
            .await;
        assert!(res.is_err());

        let seen = seen.into_inner();
        assert_eq!(seen.len(), 8);
        let delays: Vec<u64> = seen.iter().skip(1).map(|(_, d)| *d).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(start.elapsed(), Duration::from_millis(91_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let retry = Retry::new("t", fixed(3));
        let out = retry
            .run(|ctx| async move {
                if ctx.attempt < 2 {
                    Err("timed out".to_string())
                } else {
                    Ok(ctx.attempt)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let retry = Retry::new("t", fixed(0));
        let calls = Mutex::new(0);
        let res: Result<(), String> = retry
            .run(|_| {
                *calls.lock() += 1;
                async { Err("boom".to_string()) }
            })
            .await;
        assert_eq!(res.unwrap_err(), "boom");
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_condition_stops_non_retryable() {
        let retry = Retry::new("net", RetryConfig::network());
        let calls = Mutex::new(0);
        let res: Result<(), String> = retry
            .run(|_| {
                *calls.lock() += 1;
                async { Err("invalid credentials".to_string()) }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_preset_retries_token_expiry_only() {
        let retry = Retry::new("auth", RetryConfig::authentication());
        let calls = Mutex::new(0);
        let res: Result<(), String> = retry
            .run(|_| {
                *calls.lock() += 1;
                async { Err("token expired".to_string()) }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(*calls.lock(), 3);
    }

    #[test]
    fn test_presets_by_name() {
        assert_eq!(RetryConfig::preset("database").unwrap().max_retries, 5);
        assert_eq!(RetryConfig::preset("auth").unwrap().max_retries, 2);
        assert!(RetryConfig::preset("bogus").is_none());
        let db = RetryConfig::database();
        assert!(db.allows(FailureKind::Deadlock));
        assert!(!db.allows(FailureKind::TokenExpired));
        assert!(RetryConfig::default().allows(FailureKind::Other));
    }
}
