//! Worker-process counterpart of the supervisor.
//!
//! A worker binary checks [`worker_id_from_env`]; when set, it builds a
//! [`WorkerRuntime`] over stdio and serves until told to shut down.

mod runtime;

pub use runtime::{WorkerConfig, WorkerHandle, WorkerRuntime, worker_id_from_env};
