//! # LogWriter: renders runtime events through `tracing`.
//!
//! Worker lifecycle goes to `info`, restarts and breaker trips to `warn`,
//! retirements and forced kills to `error`. Heartbeats are `trace` only.
//!
//! ## Example output (fmt subscriber)
//! ```text
//! INFO  hubvisor::events: worker forked worker="worker-0" pid=4242 attempt=1
//! WARN  hubvisor::events: restart scheduled worker="worker-0" attempt=1 delay_ms=1000 reason="exit code 1"
//! ERROR hubvisor::events: worker retired worker="worker-0" restarts=5 reason="restart budget exhausted"
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let subject = e.subject.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");

        match e.kind {
            EventKind::ShutdownRequested => {
                tracing::info!(target: "hubvisor::events", "shutdown requested")
            }
            EventKind::AllStoppedWithin => {
                tracing::info!(target: "hubvisor::events", "all workers stopped within timeout")
            }
            EventKind::GraceExceeded => {
                tracing::error!(target: "hubvisor::events", stuck = reason, "shutdown timeout exceeded")
            }
            EventKind::WorkerForked => tracing::info!(
                target: "hubvisor::events",
                worker = subject, pid = ?e.pid, attempt = ?e.attempt,
                "worker forked"
            ),
            EventKind::WorkerReady => tracing::info!(
                target: "hubvisor::events",
                worker = subject, pid = ?e.pid,
                "worker ready"
            ),
            EventKind::WorkerStartupFailed => tracing::warn!(
                target: "hubvisor::events",
                worker = subject, timeout_ms = ?e.timeout_ms, reason,
                "worker startup failed"
            ),
            EventKind::WorkerHeartbeat => tracing::trace!(
                target: "hubvisor::events",
                worker = subject, connections = ?e.connections,
                "worker heartbeat"
            ),
            EventKind::WorkerExited => tracing::info!(
                target: "hubvisor::events",
                worker = subject, pid = ?e.pid, code = ?e.exit_code,
                "worker exited"
            ),
            EventKind::WorkerKilled => tracing::error!(
                target: "hubvisor::events",
                worker = subject, pid = ?e.pid,
                "worker force-terminated"
            ),
            EventKind::RestartScheduled => tracing::warn!(
                target: "hubvisor::events",
                worker = subject, attempt = ?e.attempt, delay_ms = ?e.delay_ms, reason,
                "restart scheduled"
            ),
            EventKind::WorkerRetired => tracing::error!(
                target: "hubvisor::events",
                worker = subject, restarts = ?e.attempt, reason,
                "worker retired"
            ),
            EventKind::WorkerStopped => tracing::info!(
                target: "hubvisor::events",
                worker = subject,
                "worker slot stopped"
            ),
            EventKind::BreakerOpened => tracing::warn!(
                target: "hubvisor::events",
                breaker = subject, reason,
                "circuit opened"
            ),
            EventKind::BreakerHalfOpened => tracing::info!(
                target: "hubvisor::events",
                breaker = subject,
                "circuit half-open"
            ),
            EventKind::BreakerClosed => tracing::info!(
                target: "hubvisor::events",
                breaker = subject, reason,
                "circuit closed"
            ),
            EventKind::HubAdded => tracing::info!(target: "hubvisor::events", hub = subject, "hub added"),
            EventKind::HubRemoved => tracing::info!(target: "hubvisor::events", hub = subject, "hub removed"),
            EventKind::HubDemoted => tracing::warn!(
                target: "hubvisor::events",
                hub = subject, reason,
                "hub demoted"
            ),
            EventKind::HubRecovered => tracing::info!(
                target: "hubvisor::events",
                hub = subject, reason,
                "hub recovered"
            ),
            EventKind::FailoverCompleted => tracing::warn!(
                target: "hubvisor::events",
                source = subject, target_hub = reason, sessions = ?e.connections,
                "failover completed"
            ),
            EventKind::FailoverFailed => tracing::error!(
                target: "hubvisor::events",
                source = subject, reason,
                "failover failed"
            ),
            EventKind::SubscriberOverflow => tracing::warn!(
                target: "hubvisor::events",
                subscriber = subject, reason,
                "subscriber dropped event"
            ),
            EventKind::SubscriberPanicked => tracing::error!(
                target: "hubvisor::events",
                subscriber = subject, reason,
                "subscriber panicked"
            ),
        }
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}
