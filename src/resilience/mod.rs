//! Fault-tolerance primitives: circuit breaker, retry controller and their registry.
//!
//! - [`CircuitBreaker`] fails fast while a dependency is unhealthy.
//! - [`Retry`] re-runs transient failures with exponential backoff.
//! - [`guarded`] composes them: retries run *inside* the breaker, so the
//!   breaker only counts the final outcome of a call.
//! - [`ResilienceRegistry`] owns named instances of both.
//!
//! # Example
//! ```
//! use hubvisor::resilience::{guarded, BreakerConfig, CircuitBreaker, Retry, RetryConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let breaker = CircuitBreaker::new("billing", BreakerConfig::default());
//! let retry = Retry::new("billing", RetryConfig { max_retries: 0, ..RetryConfig::default() });
//!
//! let out = guarded(&breaker, &retry, |_ctx| async { Ok::<_, String>(42) }).await;
//! assert_eq!(out.unwrap(), 42);
//! assert_eq!(breaker.snapshot().total_requests, 1);
//! # }
//! ```

mod breaker;
mod classify;
mod registry;
mod retry;

use std::fmt;
use std::future::Future;

pub use breaker::{BreakerConfig, BreakerState, BreakerStats, CallError, CircuitBreaker};
pub use classify::{Classify, FailureKind};
pub use registry::ResilienceRegistry;
pub use retry::{Retry, RetryCondition, RetryConfig, RetryContext};

/// Runs `op` under `retry`, with the whole retry loop counted as one call by `breaker`.
pub async fn guarded<T, E, F, Fut>(
    breaker: &CircuitBreaker,
    retry: &Retry,
    op: F,
) -> Result<T, CallError<E>>
where
    F: FnMut(RetryContext) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
{
    breaker.execute(|| retry.run(op)).await
}
