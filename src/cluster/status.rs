//! Worker table and the status report built from it.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Lifecycle state of a worker slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Forked, waiting for `Ready` (or waiting to be re-forked).
    Starting,
    /// Sent `Ready` and serving.
    Running,
    /// `Shutdown` sent, waiting for exit.
    Stopping,
    /// Exited and will not be restarted.
    Stopped,
    /// Restart budget exhausted; retired permanently.
    Failed,
}

impl WorkerStatus {
    /// True while the slot may still hold a live process.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            WorkerStatus::Starting | WorkerStatus::Running | WorkerStatus::Stopping
        )
    }
}

/// Supervisor-side record of one worker slot.
#[derive(Clone, Debug)]
pub struct WorkerRecord {
    /// Slot id (`worker-N`).
    pub id: String,
    /// Pid of the current process, if one is running.
    pub pid: Option<u32>,
    /// When the current process was forked.
    pub start_time: Option<Instant>,
    /// Restarts consumed; never exceeds `max_restarts`.
    pub restart_count: u32,
    /// When the last restart was scheduled.
    pub last_restart_time: Option<Instant>,
    /// Current lifecycle state.
    pub status: WorkerStatus,
    /// Last reported connection count.
    pub active_connections: u64,
}

impl WorkerRecord {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            pid: None,
            start_time: None,
            restart_count: 0,
            last_restart_time: None,
            status: WorkerStatus::Starting,
            active_connections: 0,
        }
    }

    /// Time since the current process was forked (zero when none is live).
    pub fn uptime(&self) -> Duration {
        match (self.status.is_live(), self.start_time) {
            (true, Some(t)) => t.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

/// One row of [`ClusterStatus`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    /// Slot id.
    pub id: String,
    /// Current pid.
    pub pid: Option<u32>,
    /// Lifecycle state.
    pub status: WorkerStatus,
    /// Uptime in milliseconds.
    pub uptime_ms: u64,
    /// Restarts consumed.
    pub restart_count: u32,
    /// Last reported connection count.
    pub active_connections: u64,
}

/// Aggregate view over every worker slot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterStatus {
    /// Number of slots.
    pub total: usize,
    /// Slots in `Running`.
    pub running: usize,
    /// Slots retired as `Failed`.
    pub failed: usize,
    /// Per-slot details, sorted by id.
    pub workers: Vec<WorkerSnapshot>,
}

/// Worker records keyed by slot id.
///
/// Rows are never removed: slot ids are fixed, and a finished slot keeps its
/// last record (`Stopped` or `Failed`) so status reports show how it ended.
#[derive(Default)]
pub(crate) struct WorkerTable {
    inner: RwLock<HashMap<String, WorkerRecord>>,
}

impl WorkerTable {
    pub(crate) async fn insert(&self, id: &str) {
        self.inner
            .write()
            .await
            .entry(id.to_string())
            .or_insert_with(|| WorkerRecord::new(id));
    }

    pub(crate) async fn update(&self, id: &str, f: impl FnOnce(&mut WorkerRecord)) {
        if let Some(rec) = self.inner.write().await.get_mut(id) {
            f(rec);
        }
    }

    pub(crate) async fn get(&self, id: &str) -> Option<WorkerRecord> {
        self.inner.read().await.get(id).cloned()
    }

    /// Ids of slots that may still hold a process, sorted.
    pub(crate) async fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .await
            .values()
            .filter(|r| r.status.is_live())
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) async fn status(&self) -> ClusterStatus {
        let map = self.inner.read().await;
        let mut workers: Vec<WorkerSnapshot> = map
            .values()
            .map(|r| WorkerSnapshot {
                id: r.id.clone(),
                pid: r.pid,
                status: r.status,
                uptime_ms: r.uptime().as_millis() as u64,
                restart_count: r.restart_count,
                active_connections: r.active_connections,
            })
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));

        ClusterStatus {
            total: workers.len(),
            running: workers
                .iter()
                .filter(|w| w.status == WorkerStatus::Running)
                .count(),
            failed: workers
                .iter()
                .filter(|w| w.status == WorkerStatus::Failed)
                .count(),
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_status_counts_and_uptime() {
        let table = WorkerTable::default();
        for id in ["worker-1", "worker-0", "worker-2"] {
            table.insert(id).await;
        }
        let now = Instant::now();
        table
            .update("worker-0", |r| {
                r.status = WorkerStatus::Running;
                r.start_time = Some(now);
                r.pid = Some(10);
            })
            .await;
        table
            .update("worker-2", |r| r.status = WorkerStatus::Failed)
            .await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let st = table.status().await;
        assert_eq!((st.total, st.running, st.failed), (3, 1, 1));
        assert_eq!(st.workers[0].id, "worker-0");
        assert_eq!(st.workers[0].uptime_ms, 2000);
        assert_eq!(st.workers[2].uptime_ms, 0);
        assert_eq!(table.live_ids().await, vec!["worker-0", "worker-1"]);
    }
}
