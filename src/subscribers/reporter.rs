//! # StateReporter: mirrors worker lifecycle into the shared state.
//!
//! Keeps a local [`WorkerHealthReport`] per worker, updates it from lifecycle
//! events and writes it to [`Namespace::WorkerHealth`] under the worker id.
//! When the backend is unavailable the local copy still advances, and the next
//! successful write carries the latest state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cluster::WorkerStatus;
use crate::events::{Event, EventKind};
use crate::state::{Namespace, SharedState, Write, unix_millis};
use crate::subscribers::Subscribe;

/// Worker record as published to other processes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealthReport {
    /// Slot id.
    pub id: String,
    /// Current pid.
    pub pid: Option<u32>,
    /// Lifecycle state.
    pub status: WorkerStatus,
    /// Restarts consumed.
    pub restart_count: u32,
    /// Last reported connection count.
    pub active_connections: u64,
    /// Unix time of the last update, in milliseconds.
    pub updated_ms: u64,
}

impl WorkerHealthReport {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            pid: None,
            status: WorkerStatus::Starting,
            restart_count: 0,
            active_connections: 0,
            updated_ms: 0,
        }
    }
}

/// Subscriber writing worker records to the shared state.
pub struct StateReporter {
    state: Arc<SharedState>,
    reports: Mutex<HashMap<String, WorkerHealthReport>>,
}

impl StateReporter {
    /// Reporter writing through `state`.
    pub fn new(state: Arc<SharedState>) -> Self {
        Self {
            state,
            reports: Mutex::new(HashMap::new()),
        }
    }

    /// Latest local report for `id`.
    pub fn report(&self, id: &str) -> Option<WorkerHealthReport> {
        self.reports.lock().get(id).cloned()
    }

    fn apply(&self, e: &Event, id: &str) -> Option<WorkerHealthReport> {
        if !is_worker_event(e.kind) {
            return None;
        }
        let mut reports = self.reports.lock();
        let r = reports
            .entry(id.to_string())
            .or_insert_with(|| WorkerHealthReport::new(id));
        match e.kind {
            EventKind::WorkerForked => {
                r.status = WorkerStatus::Starting;
                r.pid = e.pid;
                r.active_connections = 0;
            }
            EventKind::WorkerReady => r.status = WorkerStatus::Running,
            EventKind::WorkerHeartbeat => {
                r.active_connections = e.connections.unwrap_or(r.active_connections);
            }
            EventKind::WorkerExited | EventKind::WorkerKilled => {
                r.pid = None;
                r.active_connections = 0;
            }
            EventKind::RestartScheduled => {
                r.status = WorkerStatus::Starting;
                r.restart_count = e.attempt.unwrap_or(r.restart_count);
            }
            EventKind::WorkerRetired => {
                r.status = WorkerStatus::Failed;
                r.pid = None;
            }
            EventKind::WorkerStopped => {
                r.status = WorkerStatus::Stopped;
                r.pid = None;
            }
            _ => {}
        }
        r.updated_ms = unix_millis();
        Some(r.clone())
    }
}

fn is_worker_event(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::WorkerForked
            | EventKind::WorkerReady
            | EventKind::WorkerHeartbeat
            | EventKind::WorkerExited
            | EventKind::WorkerKilled
            | EventKind::RestartScheduled
            | EventKind::WorkerRetired
            | EventKind::WorkerStopped
    )
}

#[async_trait]
impl Subscribe for StateReporter {
    async fn on_event(&self, e: &Event) {
        let Some(id) = e.subject.as_deref() else {
            return;
        };
        let Some(report) = self.apply(e, id) else {
            return;
        };
        if self.state.set(Namespace::WorkerHealth, id, &report).await == Write::Unavailable {
            tracing::debug!(worker = id, "worker report kept locally; shared state unavailable");
        }
    }

    fn name(&self) -> &'static str {
        "state-reporter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Lookup, MemoryStore, SharedStateConfig};

    #[tokio::test]
    async fn test_lifecycle_is_published() {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(SharedState::new(SharedStateConfig::default(), store.clone()));
        state.connect().await;
        let reporter = StateReporter::new(state.clone());

        reporter
            .on_event(&Event::new(EventKind::WorkerForked).with_subject("worker-0").with_pid(Some(7)))
            .await;
        reporter
            .on_event(&Event::new(EventKind::WorkerReady).with_subject("worker-0"))
            .await;
        reporter
            .on_event(&Event::new(EventKind::WorkerHeartbeat).with_subject("worker-0").with_connections(4))
            .await;

        let got: WorkerHealthReport = state
            .get(Namespace::WorkerHealth, "worker-0")
            .await
            .found()
            .unwrap();
        assert_eq!(got.status, WorkerStatus::Running);
        assert_eq!(got.pid, Some(7));
        assert_eq!(got.active_connections, 4);

        store.set_reachable(false);
        reporter
            .on_event(&Event::new(EventKind::WorkerRetired).with_subject("worker-0").with_attempt(5))
            .await;
        assert_eq!(reporter.report("worker-0").unwrap().status, WorkerStatus::Failed);

        store.set_reachable(true);
        let stale: Lookup<WorkerHealthReport> = state.get(Namespace::WorkerHealth, "worker-0").await;
        assert_eq!(stale.found().unwrap().status, WorkerStatus::Running);
    }

    #[tokio::test]
    async fn test_ignores_unrelated_events() {
        let state = Arc::new(SharedState::new(
            SharedStateConfig::default(),
            Arc::new(MemoryStore::new()),
        ));
        state.connect().await;
        let reporter = StateReporter::new(state);
        reporter
            .on_event(&Event::new(EventKind::BreakerOpened).with_subject("db"))
            .await;
        assert!(reporter.report("db").is_none());
    }
}
