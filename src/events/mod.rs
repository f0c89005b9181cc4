//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to runtime events emitted by the supervisor, worker actors,
//! circuit breakers, the hub balancer and subscriber workers.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Supervisor`, `WorkerActor`, `CircuitBreaker`, `HubBalancer`,
//!   `HealthMonitor`, `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: `Supervisor::subscriber_listener()` (fans out to `SubscriberSet`).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
