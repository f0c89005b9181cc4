//! # Circuit breaker protecting one named downstream dependency.
//!
//! ## States
//! ```text
//!            failure_count ≥ threshold
//!   Closed ─────────────────────────────► Open ◄──────────┐
//!     ▲                                    │              │ any probe fails
//!     │ half_open_max consecutive          │ recovery     │
//!     │ probe successes                    ▼ timeout      │
//!     └────────────────────────────── HalfOpen ───────────┘
//!
//!   Open ──(error rate ≤ 1% over ≥ 100 requests, sampled by the monitor)──► Closed
//! ```
//!
//! ## Rules
//! - `Open` rejects immediately (or runs the fallback) until the recovery
//!   timeout has elapsed since the last failure; the next call moves to
//!   `HalfOpen` and is admitted as the first probe.
//! - `HalfOpen` admits at most `half_open_max_requests` probes.
//! - Every admitted call counts toward `total_requests`; rejected calls do not.
//! - An admitted call whose future is dropped before completion (caller
//!   timeout, cancellation) counts as a failure.
//! - Bookkeeping never fails: callers only ever see their own error or the
//!   open rejection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::events::{Bus, Event, EventKind};
use crate::resilience::{Classify, FailureKind};

/// Breaker thresholds. Immutable once the breaker is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` that trip the breaker.
    pub failure_threshold: u32,
    /// Time since the last failure before `Open` admits a probe.
    pub recovery_timeout: Duration,
    /// Probe budget in `HalfOpen`; this many consecutive successes close the breaker.
    pub half_open_max_requests: u32,
    /// How often the recovery monitor samples the error rate.
    pub monitoring_period: Duration,
    /// Minimum sample size for error-rate recovery.
    pub recovery_min_requests: u64,
    /// Error rate at or below which an `Open` breaker is force-closed.
    pub recovery_error_rate: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_requests: 3,
            monitoring_period: Duration::from_secs(10),
            recovery_min_requests: 100,
            recovery_error_rate: 0.01,
        }
    }
}

/// Breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Calls flow through.
    Closed,
    /// Calls are rejected.
    Open,
    /// Limited probes test recovery.
    HalfOpen,
}

impl BreakerState {
    fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of a breaker, for status endpoints.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakerStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures (reset on success).
    pub failure_count: u32,
    /// Successes since the last reset.
    pub success_count: u32,
    /// Admitted calls since the last reset.
    pub total_requests: u64,
    /// Failed calls since the last reset.
    pub total_failures: u64,
    /// `total_failures / total_requests`, 0 when idle.
    pub error_rate: f64,
}

/// Error returned by a call through a breaker.
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// The breaker did not admit the call; the operation never ran.
    #[error("circuit '{name}' is {}; retry in {retry_in:?}", .state.as_str())]
    Open {
        /// Breaker name.
        name: Arc<str>,
        /// State that produced the rejection (`Open` or saturated `HalfOpen`).
        state: BreakerState,
        /// Time until the next probe may be admitted.
        retry_in: Duration,
    },

    /// The call exceeded the deadline given to [`CircuitBreaker::execute_with_timeout`].
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The operation itself failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CallError<E> {
    /// True when the breaker rejected the call without running it.
    pub fn is_rejection(&self) -> bool {
        matches!(self, CallError::Open { .. })
    }

    /// Returns the operation's own error, if that is what failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: Classify> Classify for CallError<E> {
    fn failure_kind(&self) -> FailureKind {
        match self {
            CallError::Open { .. } => FailureKind::Unavailable,
            CallError::Timeout(_) => FailureKind::Timeout,
            CallError::Inner(e) => e.failure_kind(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    half_open_admitted: u32,
    total_requests: u64,
    total_failures: u64,
    last_failure_time: Option<Instant>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_admitted: 0,
            total_requests: 0,
            total_failures: 0,
            last_failure_time: None,
        }
    }

    fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_requests as f64
        }
    }

    fn clear_counters(&mut self) {
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_admitted = 0;
        self.total_requests = 0;
        self.total_failures = 0;
    }
}

/// Three-state circuit breaker.
///
/// Cheap to share behind an `Arc`; all bookkeeping happens under a short,
/// non-async lock.
pub struct CircuitBreaker {
    name: Arc<str>,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    bus: Option<Bus>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<Arc<str>>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
            bus: None,
        }
    }

    /// Publishes state transitions on `bus`.
    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state (without applying the timeout transition).
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Snapshot of counters.
    pub fn snapshot(&self) -> BreakerStats {
        let g = self.inner.lock();
        BreakerStats {
            name: self.name.to_string(),
            state: g.state,
            failure_count: g.failure_count,
            success_count: g.success_count,
            total_requests: g.total_requests,
            total_failures: g.total_failures,
            error_rate: g.error_rate(),
        }
    }

    /// Runs `op` if the breaker admits it; otherwise fails fast with [`CallError::Open`].
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match op().await {
            Ok(v) => {
                permit.success();
                Ok(v)
            }
            Err(e) => {
                permit.failure();
                Err(CallError::Inner(e))
            }
        }
    }

    /// Runs `op` if admitted, else runs `fallback` and returns its result.
    ///
    /// `op` is never invoked when the call is rejected. A failure of an
    /// admitted `op` is returned as-is; the fallback does not mask it.
    pub async fn execute_with_fallback<T, E, F, Fut, G, GFut>(
        &self,
        op: F,
        fallback: G,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        let Ok(permit) = self.try_acquire::<E>() else {
            return fallback().await;
        };
        match op().await {
            Ok(v) => {
                permit.success();
                Ok(v)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    /// Like [`execute`](Self::execute), but a call running past `deadline` is
    /// abandoned and counted as a failure.
    pub async fn execute_with_timeout<T, E, F, Fut>(
        &self,
        deadline: Duration,
        op: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match tokio::time::timeout(deadline, op()).await {
            Ok(Ok(v)) => {
                permit.success();
                Ok(v)
            }
            Ok(Err(e)) => {
                permit.failure();
                Err(CallError::Inner(e))
            }
            Err(_) => {
                permit.failure();
                Err(CallError::Timeout(deadline))
            }
        }
    }

    /// Force-closes an `Open` breaker when the overall error rate has recovered.
    ///
    /// Independent of the timeout/half-open path; called periodically by the
    /// registry's recovery monitor. Returns true if the breaker was closed.
    pub fn evaluate_recovery(&self) -> bool {
        let closed = {
            let mut g = self.inner.lock();
            if g.state != BreakerState::Open
                || g.total_requests < self.config.recovery_min_requests
                || g.error_rate() > self.config.recovery_error_rate
            {
                return false;
            }
            g.state = BreakerState::Closed;
            g.clear_counters();
            true
        };
        self.emit(EventKind::BreakerClosed, "error rate recovered");
        closed
    }

    /// Returns the breaker to its initial `Closed` state with zeroed counters.
    pub fn reset(&self) {
        let was = {
            let mut g = self.inner.lock();
            let was = g.state;
            *g = Inner::new();
            was
        };
        if was != BreakerState::Closed {
            self.emit(EventKind::BreakerClosed, "reset");
        }
    }

    fn try_acquire<E>(&self) -> Result<Permit<'_>, CallError<E>> {
        let mut half_opened = false;
        let result = {
            let mut g = self.inner.lock();
            match g.state {
                BreakerState::Closed => Ok(()),
                BreakerState::Open => {
                    let elapsed = g
                        .last_failure_time
                        .map(|t| t.elapsed())
                        .unwrap_or(self.config.recovery_timeout);
                    if elapsed >= self.config.recovery_timeout {
                        g.state = BreakerState::HalfOpen;
                        g.success_count = 0;
                        g.half_open_admitted = 1;
                        half_opened = true;
                        Ok(())
                    } else {
                        Err((BreakerState::Open, self.config.recovery_timeout - elapsed))
                    }
                }
                BreakerState::HalfOpen => {
                    if g.half_open_admitted < self.config.half_open_max_requests {
                        g.half_open_admitted += 1;
                        Ok(())
                    } else {
                        Err((BreakerState::HalfOpen, Duration::ZERO))
                    }
                }
            }
        };
        if half_opened {
            self.emit(EventKind::BreakerHalfOpened, "recovery timeout elapsed");
        }
        match result {
            Ok(()) => Ok(Permit {
                breaker: self,
                done: false,
            }),
            Err((state, retry_in)) => {
                tracing::debug!(breaker = %self.name, state = state.as_str(), "call rejected");
                Err(CallError::Open {
                    name: Arc::clone(&self.name),
                    state,
                    retry_in,
                })
            }
        }
    }

    fn on_success(&self) {
        let closed = {
            let mut g = self.inner.lock();
            g.total_requests += 1;
            g.success_count = g.success_count.saturating_add(1);
            match g.state {
                BreakerState::Closed | BreakerState::Open => {
                    g.failure_count = 0;
                    false
                }
                BreakerState::HalfOpen => {
                    if g.success_count >= self.config.half_open_max_requests {
                        g.state = BreakerState::Closed;
                        g.clear_counters();
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if closed {
            self.emit(EventKind::BreakerClosed, "probes succeeded");
        }
    }

    fn on_failure(&self) {
        let opened = {
            let mut g = self.inner.lock();
            g.total_requests += 1;
            g.total_failures += 1;
            g.failure_count = g.failure_count.saturating_add(1);
            g.last_failure_time = Some(Instant::now());
            match g.state {
                BreakerState::Closed if g.failure_count >= self.config.failure_threshold => {
                    g.state = BreakerState::Open;
                    Some(format!("{} consecutive failures", g.failure_count))
                }
                BreakerState::HalfOpen => {
                    g.state = BreakerState::Open;
                    g.success_count = 0;
                    g.half_open_admitted = 0;
                    Some("probe failed".to_string())
                }
                _ => None,
            }
        };
        if let Some(reason) = opened {
            self.emit(EventKind::BreakerOpened, reason);
        }
    }

    fn emit(&self, kind: EventKind, reason: impl Into<Arc<str>>) {
        let reason = reason.into();
        match kind {
            EventKind::BreakerOpened => {
                tracing::warn!(breaker = %self.name, reason = %reason, "circuit opened")
            }
            _ => tracing::info!(breaker = %self.name, ?kind, reason = %reason, "circuit transition"),
        }
        if let Some(bus) = &self.bus {
            bus.publish(
                Event::new(kind)
                    .with_subject(Arc::clone(&self.name))
                    .with_reason(reason),
            );
        }
    }
}

/// Admission ticket for one call; records a failure if dropped unresolved.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    done: bool,
}

impl Permit<'_> {
    fn success(mut self) {
        self.done = true;
        self.breaker.on_success();
    }

    fn failure(mut self) {
        self.done = true;
        self.breaker.on_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.on_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 2,
            ..BreakerConfig::default()
        }
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CallError<String>> {
        b.execute(|| async { Err::<(), _>("boom".to_string()) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), CallError<String>> {
        b.execute(|| async { Ok::<(), String>(()) }).await
    }

    #[tokio::test]
    async fn test_trips_after_threshold_and_rejects_without_invoking() {
        let b = CircuitBreaker::new("db", config());
        for _ in 0..3 {
            assert!(matches!(fail(&b).await, Err(CallError::Inner(_))));
        }
        assert_eq!(b.state(), BreakerState::Open);

        let calls = AtomicU32::new(0);
        let res = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            })
            .await;
        assert!(res.unwrap_err().is_rejection());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.snapshot().total_requests, 3);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let b = CircuitBreaker::new("db", config());
        fail(&b).await.ok();
        fail(&b).await.ok();
        succeed(&b).await.unwrap();
        fail(&b).await.ok();
        fail(&b).await.ok();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_closes_on_probe_successes() {
        let b = CircuitBreaker::new("hub", config());
        for _ in 0..3 {
            fail(&b).await.ok();
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(succeed(&b).await.unwrap_err().is_rejection());

        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        succeed(&b).await.unwrap();

        let stats = b.snapshot();
        assert_eq!(stats.state, BreakerState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let b = CircuitBreaker::new("hub", config());
        for _ in 0..3 {
            fail(&b).await.ok();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(fail(&b).await, Err(CallError::Inner(_))));
        assert_eq!(b.state(), BreakerState::Open);
        assert!(succeed(&b).await.unwrap_err().is_rejection());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_budget_is_enforced() {
        let b = Arc::new(CircuitBreaker::new("hub", config()));
        for _ in 0..3 {
            fail(&b).await.ok();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let mut probes = Vec::new();
        for _ in 0..2 {
            let b = Arc::clone(&b);
            let mut rx = release_rx.clone();
            probes.push(tokio::spawn(async move {
                b.execute(|| async move {
                    let _ = rx.wait_for(|v| *v).await;
                    Ok::<(), String>(())
                })
                .await
            }));
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let third = succeed(&b).await.unwrap_err();
        assert!(matches!(
            third,
            CallError::Open { state: BreakerState::HalfOpen, .. }
        ));

        release_tx.send(true).unwrap();
        for p in probes {
            p.await.unwrap().unwrap();
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_fallback_runs_instead_of_operation_when_open() {
        let b = CircuitBreaker::new("svc", config());
        for _ in 0..3 {
            fail(&b).await.ok();
        }
        let calls = AtomicU32::new(0);
        let out = b
            .execute_with_fallback(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<&str, String>("live")
                },
                || async { Ok("cached") },
            )
            .await;
        assert_eq!(out.unwrap(), "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_does_not_mask_admitted_failure() {
        let b = CircuitBreaker::new("svc", config());
        let out = b
            .execute_with_fallback(
                || async { Err::<&str, String>("down".into()) },
                || async { Ok("cached") },
            )
            .await;
        assert_eq!(out.unwrap_err(), "down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let b = CircuitBreaker::new("slow", config());
        for _ in 0..3 {
            let res = b
                .execute_with_timeout(Duration::from_millis(50), || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), String>(())
                })
                .await;
            assert!(matches!(res, Err(CallError::Timeout(_))));
        }
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_dropped_call_counts_as_failure() {
        let b = CircuitBreaker::new("dropped", config());
        let fut = b.execute(|| futures::future::pending::<Result<(), String>>());
        let _ = futures::FutureExt::now_or_never(Box::pin(fut));
        assert_eq!(b.snapshot().total_failures, 1);
    }

    #[tokio::test]
    async fn test_error_rate_recovery_closes_open_breaker() {
        let b = CircuitBreaker::new("bulk", config());
        for _ in 0..397 {
            succeed(&b).await.unwrap();
        }
        for _ in 0..3 {
            fail(&b).await.ok();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.evaluate_recovery());
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().total_requests, 0);
    }

    #[tokio::test]
    async fn test_error_rate_recovery_needs_sample_and_low_rate() {
        let small = CircuitBreaker::new("small", config());
        for _ in 0..3 {
            fail(&small).await.ok();
        }
        assert!(!small.evaluate_recovery());

        let noisy = CircuitBreaker::new("noisy", config());
        for _ in 0..95 {
            succeed(&noisy).await.unwrap();
            fail(&noisy).await.ok();
        }
        for _ in 0..3 {
            fail(&noisy).await.ok();
        }
        assert_eq!(noisy.state(), BreakerState::Open);
        assert!(!noisy.evaluate_recovery());
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let b = CircuitBreaker::new("pub", config()).with_bus(bus);
        for _ in 0..3 {
            fail(&b).await.ok();
        }
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::BreakerOpened);
        assert_eq!(ev.subject.as_deref(), Some("pub"));

        b.reset();
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::BreakerClosed);
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
