//! In-process [`StateStore`] with TTL expiry and topic broadcast.
//!
//! Besides single-process deployments it doubles as a test backend:
//! [`MemoryStore::set_reachable`] simulates an outage without losing data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::StateError;
use crate::state::StateStore;

const TOPIC_CAPACITY: usize = 256;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory shared-state backend.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    connected: AtomicBool,
    reachable: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty, reachable, disconnected store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulates the backend going away (`false`) or coming back (`true`).
    ///
    /// While unreachable every operation fails with [`StateError::Unreachable`];
    /// stored data is kept.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| !e.expired(now)).count()
    }

    /// True if no live keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StateError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StateError::Unreachable("memory store offline".into()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StateError::Unreachable("not connected".into()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn connect(&self) -> Result<(), StateError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StateError::Unreachable("memory store offline".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // dropping the senders ends every open subscription
        self.topics.lock().clear();
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StateError> {
        self.check()?;
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(e) => Ok(Some(e.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StateError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|e| !e.expired(now)))
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<usize, StateError> {
        self.check()?;
        let topics = self.topics.lock();
        Ok(topics
            .get(topic)
            .and_then(|tx| tx.send(payload).ok())
            .unwrap_or(0))
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<String>, StateError> {
        self.check()?;
        let mut topics = self.topics.lock();
        let tx = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Ok(tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> MemoryStore {
        let store = MemoryStore::new();
        store.connect().await.unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = connected().await;
        store
            .set("k", "1".into(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.is_err());
        store.connect().await.unwrap();
        assert!(store.set("k", "v".into(), None).await.is_ok());
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_outage_keeps_data() {
        let store = connected().await;
        store.set("k", "v".into(), None).await.unwrap();

        store.set_reachable(false);
        assert!(matches!(
            store.get("k").await,
            Err(StateError::Unreachable(_))
        ));
        assert!(store.publish("t", "x".into()).await.is_err());

        store.set_reachable(true);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_pubsub_and_disconnect_closes_subscriptions() {
        let store = connected().await;
        assert_eq!(store.publish("t", "early".into()).await.unwrap(), 0);

        let mut rx = store.subscribe("t").await.unwrap();
        assert_eq!(store.publish("t", "hello".into()).await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), "hello");

        store.disconnect().await;
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
