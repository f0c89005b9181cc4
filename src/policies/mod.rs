//! Retry and restart policies.
//!
//! This module groups the knobs that control **if/when** a worker is restarted
//! and **how long** to wait between attempts of a retried call.
//!
//! ## Contents
//! - [`RestartPolicy`] when to restart a worker (never / on-failure / always)
//! - [`BackoffPolicy`] how retry delays evolve (base / multiplier / max + jitter)
//! - [`JitterPolicy`]  randomization strategy to avoid thundering herd
//!
//! ## Quick wiring
//! ```text
//! SupervisorConfig { restart: RestartPolicy, max_restarts, restart_delay }
//!      └─► cluster::actor::WorkerActor uses restart to decide continue/retire
//!
//! RetryConfig { max_retries, backoff: BackoffPolicy, condition }
//!      └─► resilience::Retry uses backoff.delay(attempt) between attempts
//! ```
//!
//! ## Defaults
//! - `RestartPolicy::OnFailure`.
//! - `BackoffPolicy::default()` → base=1s, multiplier=2.0, max=30s, jitter=None.
//! - `JitterPolicy::None` by default; retry presets use `Spread` (±5%).

mod backoff;
mod jitter;
mod restart;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use restart::RestartPolicy;
