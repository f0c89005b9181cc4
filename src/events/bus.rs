//! # Runtime event bus.
//!
//! Worker actors, circuit breakers and the hub balancer all report through one
//! [`Bus`]. The supervisor keeps a single receiver and hands each event to its
//! [`SubscriberSet`](crate::SubscriberSet); components used on their own may
//! hold a bus nobody reads, in which case events are simply discarded.
//!
//! ```text
//!   WorkerActor ──┐
//!   Breaker     ──┼── publish ──► Bus ──► subscriber_listener ──► SubscriberSet
//!   HubBalancer ──┘
//! ```
//!
//! Delivery is at-most-once: the ring buffer holds the last `capacity`
//! events, a receiver that falls further behind gets `RecvError::Lagged(n)`
//! and resumes at the oldest retained event.

use tokio::sync::broadcast;

use super::event::Event;

/// Cloneable handle to the runtime event channel.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus retaining up to `capacity` events (at least one).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Hands `ev` to every current receiver. Never blocks or fails.
    pub fn publish(&self, ev: Event) {
        // no receivers is not an error for a fire-and-forget bus
        let _ = self.tx.send(ev);
    }

    /// New receiver that sees events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn test_subscriber_sees_events_after_subscribe() {
        let bus = Bus::new(8);
        bus.publish(Event::new(EventKind::WorkerForked).with_subject("dropped"));

        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventKind::WorkerReady).with_subject("w-1"));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::WorkerReady);
        assert_eq!(ev.subject.as_deref(), Some("w-1"));
    }

    #[tokio::test]
    async fn test_slow_receiver_lags_instead_of_blocking() {
        let bus = Bus::new(2);
        let mut rx = bus.subscribe();
        for kind in [EventKind::WorkerForked, EventKind::WorkerReady, EventKind::WorkerStopped] {
            bus.publish(Event::new(kind));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::WorkerReady);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let bus = Bus::new(0);
        bus.publish(Event::new(EventKind::ShutdownRequested));
    }
}
