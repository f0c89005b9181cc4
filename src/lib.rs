//! # hubvisor
//!
//! **Hubvisor** keeps a multi-hub tool gateway serving while individual
//! worker processes, hubs or the shared-state backend fail.
//!
//! It combines four pieces:
//! - a process supervisor that forks worker processes, watches them and
//!   restarts them within a budget;
//! - a shared-state facade over a pluggable key/value + pub/sub backend that
//!   degrades to "unavailable" instead of failing;
//! - a hub balancer with health probing and failover;
//! - circuit breakers and retry policies guarding every call to a hub.
//!
//! ## Architecture
//! ```text
//!  Supervisor ──fork──► worker process ◄──stdio JSON lines──► WorkerRuntime
//!      │  WorkerActor per slot (restart budget, startup timeout)
//!      ▼
//!  Bus (broadcast) ◄── HubBalancer, CircuitBreaker
//!      │
//!      ▼
//!  subscriber_listener ──► SubscriberSet ──► LogWriter, StateReporter ──► SharedState
//!
//!  HubRouter::call(req, op)
//!    HubBalancer::select_hub ──► breaker "hub:<id>" ──► Retry ──► op(hub)
//!
//!  HealthMonitor ──probe──► HubBalancer::apply_probe ──► ServerHealth / failover
//! ```
//!
//! ## Features
//! | Area               | Description                                           | Key types                                   |
//! |--------------------|-------------------------------------------------------|---------------------------------------------|
//! | **Supervision**    | Fork, monitor, restart and retire worker processes.   | [`Supervisor`], [`CommandSpawner`]          |
//! | **Worker side**    | Readiness, heartbeats and drain on shutdown.          | [`WorkerRuntime`], [`WorkerHandle`]         |
//! | **Shared state**   | Namespaced JSON values, TTLs, pub/sub, heartbeats.    | [`state::SharedState`], [`state::StateStore`] |
//! | **Hub routing**    | Policies, session affinity, health, failover.         | [`HubBalancer`], [`HealthMonitor`], [`HubRouter`] |
//! | **Resilience**     | Circuit breakers, retry presets, named registry.      | [`resilience::CircuitBreaker`], [`resilience::Retry`] |
//! | **Subscriber API** | Hook into runtime events (logging, reporting).        | [`Subscribe`], [`LogWriter`], [`StateReporter`] |
//! | **Configuration**  | Typed defaults with env/JSON overlays.                | [`Config`], [`ConfigPatch`]                 |
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use hubvisor::{CommandSpawner, LogWriter, Subscribe, Supervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let spawner = Arc::new(CommandSpawner::current_exe()?);
//!     let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
//!
//!     let sup = Supervisor::new(SupervisorConfig::default(), spawner, subs);
//!     sup.run_until_signal().await?;
//!     Ok(())
//! }
//! ```

mod cluster;
mod config;
mod error;
mod events;
mod hub;
mod policies;
mod subscribers;
mod worker;

pub mod resilience;
pub mod state;

// ---- Public re-exports ----

pub use cluster::{
    ChildProcess, ClusterStatus, CommandSpawner, ControlMessage, ShutdownSignal, Spawn,
    SpawnedWorker, Supervisor, SupervisorConfig, WORKER_ID_ENV, WorkerRecord, WorkerSnapshot,
    WorkerStatus, wait_for_shutdown_signal,
};
pub use config::{Config, ConfigPatch, ENV_PREFIX, RetryPresets, RetrySettings};
pub use error::{ConfigError, GatewayError, RuntimeError, StateError, WorkerError};
pub use events::{Bus, Event, EventKind};
pub use hub::{
    BalancerConfig, BalancingPolicy, FailoverPolicy, FailoverReport, HealthCheckConfig,
    HealthMonitor, HealthStatus, HealthTransition, HubBalancer, HubHealthReport, HubMetadata,
    HubProbe, HubRecord, HubRouter, HubSnapshot, HubType, ProbeReport, RouteRequest, SystemStatus,
    breaker_name,
};
pub use policies::{BackoffPolicy, JitterPolicy, RestartPolicy};
pub use resilience::{FailureKind, ResilienceRegistry};
pub use subscribers::{LogWriter, StateReporter, Subscribe, SubscriberSet, WorkerHealthReport};
pub use worker::{WorkerConfig, WorkerHandle, WorkerRuntime, worker_id_from_env};
