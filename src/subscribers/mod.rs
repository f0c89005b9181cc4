//! # Event subscribers for the hubvisor runtime.
//!
//! This module provides the [`Subscribe`] trait and built-in implementations
//! for handling runtime events broadcast through the [`Bus`](crate::events::Bus).
//!
//! ## Architecture
//! ```text
//! Event flow:
//!   WorkerActor ── publish(Event) ──► Bus ──► Supervisor listener ──► SubscriberSet
//!                                                                        │
//!                                                         ┌──────────────┼──────────────┐
//!                                                         ▼              ▼              ▼
//!                                                     LogWriter    StateReporter     Custom
//! ```
//!
//! ## Built-in subscribers
//! - [`LogWriter`] renders events through `tracing`.
//! - [`StateReporter`] mirrors worker health into the shared-state backend so
//!   other processes (and hubs) can observe it.

mod log;
mod reporter;
mod set;
mod subscriber;

pub use log::LogWriter;
pub use reporter::{StateReporter, WorkerHealthReport};
pub use set::SubscriberSet;
pub use subscriber::Subscribe;
