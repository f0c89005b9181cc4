//! Process supervision: forking, monitoring, restarting and retiring workers.
//!
//! - [`Supervisor`] owns the worker slots and the shutdown sequence.
//! - [`Spawn`] / [`ChildProcess`] abstract process creation; [`CommandSpawner`]
//!   is the OS implementation.
//! - [`ControlMessage`] is the line-delimited JSON protocol spoken over the
//!   worker's stdio (see [`crate::worker`] for the worker side).

mod actor;
mod config;
mod control;
mod process;
mod shutdown;
mod status;
mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SupervisorConfig;
pub use control::{ControlMessage, WORKER_ID_ENV};
pub use process::{ChildProcess, CommandSpawner, Spawn, SpawnedWorker};
pub use shutdown::{ShutdownSignal, wait_for_shutdown_signal};
pub use status::{ClusterStatus, WorkerRecord, WorkerSnapshot, WorkerStatus};
pub use supervisor::Supervisor;
