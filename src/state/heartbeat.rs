//! Per-process liveness records.
//!
//! A heartbeat task samples an injected [`MetricsSource`] every
//! `heartbeat_interval` and writes a [`HeartbeatRecord`] with TTL
//! `heartbeat_ttl`. A process that stops beating simply ages out.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Resource counters reported with each heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceCounters {
    /// Open client connections.
    pub active_connections: u64,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// CPU usage in percent of one core.
    pub cpu_percent: f64,
}

/// Supplies resource counters for heartbeats.
pub trait MetricsSource: Send + Sync + 'static {
    /// Current counters.
    fn sample(&self) -> ResourceCounters;
}

impl<F> MetricsSource for F
where
    F: Fn() -> ResourceCounters + Send + Sync + 'static,
{
    fn sample(&self) -> ResourceCounters {
        self()
    }
}

/// One liveness record as stored in the shared state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Reporting process (worker id or hub id).
    pub id: String,
    /// OS process id.
    pub pid: u32,
    /// Counters at the time of the beat.
    pub counters: ResourceCounters,
    /// Unix time in milliseconds.
    pub timestamp_ms: u64,
}

impl HeartbeatRecord {
    /// Builds a record for the current process from `source`.
    pub fn sample(id: &str, source: &dyn MetricsSource) -> Self {
        Self {
            id: id.to_string(),
            pid: std::process::id(),
            counters: source.sample(),
            timestamp_ms: unix_millis(),
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
