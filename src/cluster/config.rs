//! # Supervisor configuration.
//!
//! ## Sentinel values
//! - `restart_delay = 0s` → re-fork immediately
//! - `fork_delay = 0s` → fork all workers back to back
//! - `worker_count = 0` → one worker per available CPU

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policies::RestartPolicy;

/// Settings of the process supervisor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Worker slots forked by `run_until_signal` (`0` = CPU count).
    pub worker_count: usize,

    /// Restarts a slot may consume before it is retired as `Failed`.
    pub max_restarts: u32,

    /// Minimum interval between two forks of the same slot.
    pub restart_delay: Duration,

    /// Time a fresh worker has to send `Ready`.
    pub startup_timeout: Duration,

    /// Time `shutdown` waits for workers before force-terminating them.
    pub shutdown_timeout: Duration,

    /// Pause between consecutive initial forks.
    pub fork_delay: Duration,

    /// Master switch for automatic restarts.
    pub auto_restart: bool,

    /// Which exits are restarted.
    ///
    /// A worker exiting on its own is unexpected for a server, so clean exits
    /// are restarted too unless this is narrowed to `OnFailure`.
    pub restart: RestartPolicy,

    /// Capacity of the event bus ring buffer (min 1).
    pub bus_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            max_restarts: 5,
            restart_delay: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            fork_delay: Duration::from_millis(100),
            auto_restart: true,
            restart: RestartPolicy::Always,
            bus_capacity: 1024,
        }
    }
}

impl SupervisorConfig {
    /// Worker count with the `0` sentinel resolved.
    pub fn worker_count(&self) -> usize {
        match self.worker_count {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }

    /// Bus capacity clamped to at least 1.
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}
