//! # Event subscriber trait.
//!
//! Provides [`Subscribe`], the extension point for plugging custom event handlers
//! (alerting, metrics export, audit) into the runtime.
//!
//! ```text
//! SubscriberSet ──► [bounded queue] ──► worker task ──► subscriber.on_event()
//!                                    └─► panic caught → EventKind::SubscriberPanicked
//! ```
//!
//! A full queue drops the event for that subscriber only and publishes
//! `EventKind::SubscriberOverflow`.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use hubvisor::{Subscribe, Event, EventKind};
//!
//! struct RetireAlarm;
//!
//! #[async_trait]
//! impl Subscribe for RetireAlarm {
//!     async fn on_event(&self, ev: &Event) {
//!         if matches!(ev.kind, EventKind::WorkerRetired) {
//!             // page the operator, etc.
//!         }
//!     }
//!
//!     fn name(&self) -> &'static str { "retire-alarm" }
//!     fn queue_capacity(&self) -> usize { 64 }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Event subscriber for cluster observability.
///
/// Implementations must not block the executor and should handle their own
/// errors; a slow subscriber only delays its own queue.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Processes a single event, in FIFO order per subscriber.
    async fn on_event(&self, event: &Event);

    /// Returns the subscriber name used in overflow/panic events.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Returns the preferred queue capacity for this subscriber (min 1).
    fn queue_capacity(&self) -> usize {
        1024
    }
}
