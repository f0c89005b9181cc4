//! # Runtime events emitted by the supervisor, breakers and the hub balancer.
//!
//! The [`EventKind`] enum classifies event types across five categories:
//! - **Subscriber events**: delivery problems inside the fan-out
//! - **Shutdown events**: cluster-wide stop sequence
//! - **Worker events**: process lifecycle (fork, ready, exit, restart, retire)
//! - **Breaker events**: circuit state transitions
//! - **Hub events**: health demotion/recovery, membership and failover
//!
//! The [`Event`] struct carries metadata such as timestamps, the subject
//! (worker id, breaker name or hub id), pid, exit code and delays.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use hubvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::RestartScheduled)
//!     .with_subject("worker-2")
//!     .with_reason("exit code 1")
//!     .with_attempt(3)
//!     .with_delay(Duration::from_secs(1));
//!
//! assert_eq!(ev.kind, EventKind::RestartScheduled);
//! assert_eq!(ev.subject.as_deref(), Some("worker-2"));
//! assert_eq!(ev.delay_ms, Some(1000));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets `subject` (subscriber name) and `reason` (panic message).
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets `subject` (subscriber name) and `reason` ("full" / "closed").
    SubscriberOverflow,

    // === Shutdown events ===
    /// Shutdown requested (API call or OS signal).
    ShutdownRequested,

    /// All workers exited within the shutdown timeout.
    AllStoppedWithin,

    /// Shutdown timeout exceeded; stragglers were force-terminated.
    ///
    /// Sets `reason` (comma-separated worker ids).
    GraceExceeded,

    // === Worker lifecycle events ===
    /// A worker process was spawned.
    ///
    /// Sets `subject` (worker id), `pid`, `attempt` (1 = first fork).
    WorkerForked,

    /// The worker sent `Ready` and is now serving.
    ///
    /// Sets `subject`, `pid`.
    WorkerReady,

    /// The worker failed to become ready (timeout, early exit, spawn error).
    ///
    /// Sets `subject`, `reason`, optionally `timeout_ms`.
    WorkerStartupFailed,

    /// Periodic liveness report forwarded from a worker.
    ///
    /// Sets `subject`, `pid`, `connections`.
    WorkerHeartbeat,

    /// The worker process exited.
    ///
    /// Sets `subject`, `pid`, `exit_code` (absent when killed by a signal).
    WorkerExited,

    /// The worker was force-terminated after the shutdown timeout.
    ///
    /// Sets `subject`, `pid`.
    WorkerKilled,

    /// A restart of the slot is scheduled.
    ///
    /// Sets `subject`, `attempt` (restart number), `delay_ms`, `reason`.
    RestartScheduled,

    /// The slot exhausted its restart budget and is retired permanently.
    ///
    /// Sets `subject`, `attempt` (restarts used), `reason`.
    WorkerRetired,

    /// The slot finished without restart (clean stop or policy).
    ///
    /// Sets `subject`.
    WorkerStopped,

    // === Circuit breaker events ===
    /// Breaker tripped to `Open`.
    ///
    /// Sets `subject` (breaker name), `reason` (trigger).
    BreakerOpened,

    /// Breaker moved to `HalfOpen` to probe recovery.
    BreakerHalfOpened,

    /// Breaker returned to `Closed`.
    ///
    /// Sets `reason` ("probes succeeded" / "error rate recovered" / "reset").
    BreakerClosed,

    // === Hub events ===
    /// A hub was registered.
    HubAdded,

    /// A hub was removed.
    HubRemoved,

    /// A hub's health moved down the severity ladder.
    ///
    /// Sets `subject` (hub id), `reason` ("from->to: cause").
    HubDemoted,

    /// A hub's health recovered after a successful probe.
    ///
    /// Sets `subject`, `reason` ("from->to").
    HubRecovered,

    /// Traffic was moved from one hub to another.
    ///
    /// Sets `subject` (source hub), `reason` (target hub), `connections` (sessions moved).
    FailoverCompleted,

    /// A failover attempt was rejected.
    ///
    /// Sets `subject` (source hub), `reason`.
    FailoverFailed,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Worker id, breaker name or hub id.
    pub subject: Option<Arc<str>>,
    /// Human-readable reason (errors, transitions, overflow details).
    pub reason: Option<Arc<str>>,
    /// Fork or restart number.
    pub attempt: Option<u32>,
    /// OS process id.
    pub pid: Option<u32>,
    /// Process exit code.
    pub exit_code: Option<i32>,
    /// Active connections or moved sessions.
    pub connections: Option<u64>,
    /// Timeout in milliseconds (compact).
    pub timeout_ms: Option<u32>,
    /// Delay before the next attempt in milliseconds (compact).
    pub delay_ms: Option<u32>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            subject: None,
            reason: None,
            attempt: None,
            pid: None,
            exit_code: None,
            connections: None,
            timeout_ms: None,
            delay_ms: None,
        }
    }

    /// Attaches the subject (worker id, breaker name, hub id).
    #[inline]
    pub fn with_subject(mut self, subject: impl Into<Arc<str>>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches an attempt count.
    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a process id, if known.
    #[inline]
    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    /// Attaches an exit code, if the process exited normally.
    #[inline]
    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// Attaches a connection / session count.
    #[inline]
    pub fn with_connections(mut self, n: u64) -> Self {
        self.connections = Some(n);
        self
    }

    /// Attaches a timeout duration (stored as milliseconds).
    #[inline]
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(d.as_millis().min(u128::from(u32::MAX)) as u32);
        self
    }

    /// Attaches a delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(d.as_millis().min(u128::from(u32::MAX)) as u32);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_subject(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_subject(subscriber)
            .with_reason(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let a = Event::new(EventKind::WorkerForked);
        let b = Event::new(EventKind::WorkerReady);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_durations_saturate_to_u32() {
        let ev = Event::new(EventKind::RestartScheduled)
            .with_delay(Duration::from_secs(u64::MAX / 2));
        assert_eq!(ev.delay_ms, Some(u32::MAX));
    }
}
