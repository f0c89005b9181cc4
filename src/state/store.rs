use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StateError;
use crate::state::{MemoryStore, RedisStore};

/// Transport to a shared key/value + pub/sub backend.
///
/// Keys arrive fully qualified (`prefix:namespace:key`) and values are JSON
/// text. Implementations report transport problems as [`StateError`]; the
/// [`SharedState`](crate::state::SharedState) facade turns them into
/// "unavailable" results.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Opens both channels (key/value and pub/sub).
    async fn connect(&self) -> Result<(), StateError>;

    /// Releases both channels. Open subscriptions end.
    async fn disconnect(&self);

    /// Stores `value` under `key`, expiring after `ttl` if given.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StateError>;

    /// Reads `key`; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StateError>;

    /// Removes `key`; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StateError>;

    /// Publishes `payload` on `topic`; returns the number of receivers reached.
    async fn publish(&self, topic: &str, payload: String) -> Result<usize, StateError>;

    /// Subscribes to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<String>, StateError>;
}

/// Resolves a backend URL to a store.
///
/// - `memory://` is private to this process.
/// - `redis://host[:port][/db]` is shared by every process using the same URL.
///
/// Anything else is [`StateError::UnsupportedUrl`]. Opening never connects.
///
/// # Example
/// ```
/// assert!(hubvisor::state::open("memory://").is_ok());
/// assert!(hubvisor::state::open("redis://localhost:6379").is_ok());
/// assert!(hubvisor::state::open("etcd://localhost:2379").is_err());
/// ```
pub fn open(url: &str) -> Result<Arc<dyn StateStore>, StateError> {
    match url.split_once("://") {
        Some(("memory", _)) => Ok(Arc::new(MemoryStore::new())),
        Some(("redis", _)) => Ok(Arc::new(RedisStore::new(url)?)),
        _ => Err(StateError::UnsupportedUrl(url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_picks_backend_by_scheme() {
        let mem = open("memory://").unwrap();
        mem.connect().await.unwrap();
        mem.set("k", "v".into(), None).await.unwrap();
        assert_eq!(mem.get("k").await.unwrap().as_deref(), Some("v"));

        let redis = open("redis://127.0.0.1:1/").unwrap();
        assert!(matches!(redis.get("k").await, Err(StateError::Unreachable(_))));

        assert_eq!(
            open("etcd://localhost:2379").err(),
            Some(StateError::UnsupportedUrl("etcd://localhost:2379".into()))
        );
    }
}
