//! # SharedState: degrade-never-fail facade over a [`StateStore`].
//!
//! ```text
//!   caller ──► SharedState ──(prefix:namespace:key, JSON)──► StateStore
//!                 │
//!                 ├── heartbeat task   (TaskTracker, cancelled on disconnect)
//!                 └── subscription pumps (TaskTracker, cancelled on disconnect)
//! ```
//!
//! ## Rules
//! - Missing keys are [`Lookup::NotFound`]; a disabled, disconnected or
//!   unreachable backend is [`Lookup::Unavailable`] / [`Write::Unavailable`].
//!   Nothing here returns an error to the caller.
//! - `connect` and `disconnect` are idempotent. `disconnect` returns only after
//!   every background task has stopped and the store released its channels.
//! - Pub/sub is at-most-once: messages published while nobody listens are lost.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::StateError;
use crate::state::{HeartbeatRecord, MetricsSource, StateStore};

/// Shared-state settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedStateConfig {
    /// Feature flag; when `false` every operation is a no-op returning "unavailable".
    pub enabled: bool,
    /// Backend URL (`memory://` built in).
    pub url: String,
    /// Prefix of every key and topic.
    pub prefix: String,
    /// TTL applied by [`SharedState::set`]; `None` stores without expiry.
    pub default_ttl: Option<Duration>,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Lifetime of a heartbeat record. Must exceed `heartbeat_interval`.
    pub heartbeat_ttl: Duration,
}

impl Default for SharedStateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "memory://".to_string(),
            prefix: "hubvisor".to_string(),
            default_ttl: Some(Duration::from_secs(300)),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
        }
    }
}

impl SharedStateConfig {
    /// Heartbeat TTL, raised to twice the interval if configured too short.
    pub fn heartbeat_ttl(&self) -> Duration {
        if self.heartbeat_ttl > self.heartbeat_interval {
            self.heartbeat_ttl
        } else {
            self.heartbeat_interval * 2
        }
    }
}

/// Key namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Hub and backend-server health.
    ServerHealth,
    /// Worker process records and heartbeats.
    WorkerHealth,
    /// Client session bindings.
    Session,
    /// General-purpose cache.
    Cache,
    /// Application-defined namespace.
    Custom(String),
}

impl Namespace {
    /// Key segment for this namespace.
    pub fn as_str(&self) -> &str {
        match self {
            Namespace::ServerHealth => "server_health",
            Namespace::WorkerHealth => "worker_health",
            Namespace::Session => "session",
            Namespace::Cache => "cache",
            Namespace::Custom(s) => s,
        }
    }
}

/// Result of a read.
#[derive(Clone, Debug, PartialEq)]
pub enum Lookup<T> {
    /// The key holds a value.
    Found(T),
    /// The key is absent, expired or undecodable.
    NotFound,
    /// The backend could not be asked.
    Unavailable,
}

impl<T> Lookup<T> {
    /// The value, if found.
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            _ => None,
        }
    }

    /// True for [`Lookup::Unavailable`].
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Lookup::Unavailable)
    }
}

/// Result of a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Write {
    /// The backend accepted the write.
    Stored,
    /// The backend could not be reached; nothing was written.
    Unavailable,
}

struct Session {
    token: CancellationToken,
    tracker: TaskTracker,
}

/// Namespaced, JSON-encoded access to a shared-state backend.
pub struct SharedState {
    config: SharedStateConfig,
    store: Arc<dyn StateStore>,
    session: Mutex<Option<Session>>,
}

impl SharedState {
    /// Wraps `store` with `config`. Call [`connect`](Self::connect) before use.
    pub fn new(config: SharedStateConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            config,
            store,
            session: Mutex::new(None),
        }
    }

    /// Resolves `config.url` via [`open`](crate::state::open).
    pub fn from_config(config: SharedStateConfig) -> Result<Self, StateError> {
        let store = crate::state::open(&config.url)?;
        Ok(Self::new(config, store))
    }

    /// Settings in use.
    pub fn config(&self) -> &SharedStateConfig {
        &self.config
    }

    /// Opens the backend. Returns whether the facade is connected afterwards.
    pub async fn connect(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let mut session = self.session.lock().await;
        if session.is_some() {
            return true;
        }
        match self.store.connect().await {
            Ok(()) => {
                *session = Some(Session {
                    token: CancellationToken::new(),
                    tracker: TaskTracker::new(),
                });
                tracing::info!(url = %self.config.url, "shared state connected");
                true
            }
            Err(e) => {
                tracing::warn!(url = %self.config.url, error = %e, label = e.as_label(), "shared state unavailable");
                false
            }
        }
    }

    /// Stops background tasks and releases the backend. Idempotent.
    pub async fn disconnect(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        session.token.cancel();
        session.tracker.close();
        session.tracker.wait().await;
        self.store.disconnect().await;
        tracing::info!("shared state disconnected");
    }

    /// True between a successful `connect` and `disconnect`.
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Fully qualified key `prefix:namespace:key`.
    pub fn key(&self, ns: &Namespace, key: &str) -> String {
        format!("{}:{}:{}", self.config.prefix, ns.as_str(), key)
    }

    fn topic(&self, topic: &str) -> String {
        format!("{}:{}", self.config.prefix, topic)
    }

    async fn ready(&self) -> bool {
        self.config.enabled && self.session.lock().await.is_some()
    }

    /// Stores `value` with the configured default TTL.
    pub async fn set<T: Serialize>(&self, ns: Namespace, key: &str, value: &T) -> Write {
        self.set_with_ttl(ns, key, value, self.config.default_ttl).await
    }

    /// Stores `value`, expiring after `ttl` if given.
    pub async fn set_with_ttl<T: Serialize>(
        &self,
        ns: Namespace,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Write {
        if !self.ready().await {
            return Write::Unavailable;
        }
        let json = match serde_json::to_string(value) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(key, error = %e, "shared state encode failed");
                return Write::Unavailable;
            }
        };
        match self.store.set(&self.key(&ns, key), json, ttl).await {
            Ok(()) => Write::Stored,
            Err(e) => degraded("set", &e, Write::Unavailable),
        }
    }

    /// Reads and decodes a value.
    pub async fn get<T: DeserializeOwned>(&self, ns: Namespace, key: &str) -> Lookup<T> {
        if !self.ready().await {
            return Lookup::Unavailable;
        }
        match self.store.get(&self.key(&ns, key)).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(v) => Lookup::Found(v),
                Err(e) => {
                    tracing::warn!(key, error = %e, "shared state value undecodable");
                    Lookup::NotFound
                }
            },
            Ok(None) => Lookup::NotFound,
            Err(e) => degraded("get", &e, Lookup::Unavailable),
        }
    }

    /// Removes a key.
    pub async fn delete(&self, ns: Namespace, key: &str) -> Write {
        if !self.ready().await {
            return Write::Unavailable;
        }
        match self.store.delete(&self.key(&ns, key)).await {
            Ok(_) => Write::Stored,
            Err(e) => degraded("delete", &e, Write::Unavailable),
        }
    }

    /// Publishes `payload` on `topic`, best effort.
    pub async fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> Write {
        if !self.ready().await {
            return Write::Unavailable;
        }
        let json = match serde_json::to_string(payload) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(topic, error = %e, "shared state encode failed");
                return Write::Unavailable;
            }
        };
        match self.store.publish(&self.topic(topic), json).await {
            Ok(_) => Write::Stored,
            Err(e) => degraded("publish", &e, Write::Unavailable),
        }
    }

    /// Calls `handler` for each message published on `topic` until disconnect.
    ///
    /// Returns `false` if the subscription could not be opened.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> bool
    where
        F: Fn(serde_json::Value) + Send + Sync + 'static,
    {
        let guard = self.session.lock().await;
        let Some(session) = guard.as_ref().filter(|_| self.config.enabled) else {
            return false;
        };
        let mut rx = match self.store.subscribe(&self.topic(topic)).await {
            Ok(rx) => rx,
            Err(e) => return degraded("subscribe", &e, false),
        };

        let token = session.token.clone();
        let topic = topic.to_string();
        session.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(raw) => match serde_json::from_str(&raw) {
                            Ok(v) => handler(v),
                            Err(e) => tracing::warn!(%topic, error = %e, "dropping undecodable message"),
                        },
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(%topic, skipped = n, "subscription lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            tracing::debug!(%topic, "subscription pump stopped");
        });
        true
    }

    /// Starts writing heartbeats for `id` into [`Namespace::WorkerHealth`]
    /// (key `heartbeat:{id}`) until disconnect.
    ///
    /// Returns `false` when not connected.
    pub async fn spawn_heartbeat(&self, id: &str, metrics: Arc<dyn MetricsSource>) -> bool {
        let guard = self.session.lock().await;
        let Some(session) = guard.as_ref().filter(|_| self.config.enabled) else {
            return false;
        };

        let store = Arc::clone(&self.store);
        let key = self.key(&Namespace::WorkerHealth, &format!("heartbeat:{id}"));
        let interval = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let ttl = self.config.heartbeat_ttl();
        let token = session.token.clone();
        let id = id.to_string();

        session.tracker.spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let record = HeartbeatRecord::sample(&id, metrics.as_ref());
                        let json = match serde_json::to_string(&record) {
                            Ok(j) => j,
                            Err(e) => {
                                tracing::warn!(%id, error = %e, "heartbeat encode failed");
                                continue;
                            }
                        };
                        if let Err(e) = store.set(&key, json, Some(ttl)).await {
                            tracing::debug!(%id, error = %e, "heartbeat not written");
                        }
                    }
                }
            }
        });
        true
    }
}

fn degraded<R>(op: &'static str, e: &StateError, result: R) -> R {
    tracing::warn!(op, error = %e, label = e.as_label(), "shared state degraded");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryStore, ResourceCounters};
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    fn setup(config: SharedStateConfig) -> (Arc<MemoryStore>, SharedState) {
        let store = Arc::new(MemoryStore::new());
        let state = SharedState::new(config, store.clone());
        (store, state)
    }

    #[tokio::test]
    async fn test_roundtrip_and_missing_key() {
        let (_, state) = setup(SharedStateConfig::default());
        assert!(state.connect().await);
        assert!(state.connect().await);

        let w = state.set(Namespace::Cache, "a", &json!({"n": 1})).await;
        assert_eq!(w, Write::Stored);
        let v: Lookup<serde_json::Value> = state.get(Namespace::Cache, "a").await;
        assert_eq!(v, Lookup::Found(json!({"n": 1})));

        let missing: Lookup<u32> = state.get(Namespace::Cache, "b").await;
        assert_eq!(missing, Lookup::NotFound);
        assert_eq!(state.key(&Namespace::Custom("x".into()), "k"), "hubvisor:x:k");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_after_ttl_is_not_found() {
        let (_, state) = setup(SharedStateConfig::default());
        state.connect().await;
        state
            .set_with_ttl(Namespace::Session, "s1", &"hub-a", Some(Duration::from_secs(2)))
            .await;
        tokio::time::advance(Duration::from_secs(3)).await;
        let v: Lookup<String> = state.get(Namespace::Session, "s1").await;
        assert_eq!(v, Lookup::NotFound);
    }

    #[tokio::test]
    async fn test_backend_outage_reports_unavailable() {
        let (store, state) = setup(SharedStateConfig::default());
        state.connect().await;
        state.set(Namespace::Cache, "a", &1u32).await;

        store.set_reachable(false);
        assert_eq!(state.set(Namespace::Cache, "a", &2u32).await, Write::Unavailable);
        assert!(state.get::<u32>(Namespace::Cache, "a").await.is_unavailable());
        assert_eq!(state.publish("t", &1u32).await, Write::Unavailable);

        store.set_reachable(true);
        assert_eq!(state.get::<u32>(Namespace::Cache, "a").await, Lookup::Found(1));
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let (store, state) = setup(SharedStateConfig {
            enabled: false,
            ..SharedStateConfig::default()
        });
        assert!(!state.connect().await);
        assert_eq!(state.set(Namespace::Cache, "a", &1u32).await, Write::Unavailable);
        assert!(state.get::<u32>(Namespace::Cache, "a").await.is_unavailable());
        assert!(!state.subscribe("t", |_| {}).await);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_then_disconnect_stops_pump() {
        let (_, state) = setup(SharedStateConfig::default());
        state.connect().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        assert!(state.subscribe("health", move |v| { let _ = tx.send(v); }).await);
        state.publish("health", &json!({"hub": "a"})).await;
        assert_eq!(rx.recv().await, Some(json!({"hub": "a"})));

        state.disconnect().await;
        state.disconnect().await;
        assert!(!state.is_connected().await);
        // the handler (and its sender) was dropped with the pump
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_written_with_ttl() {
        let (_, state) = setup(SharedStateConfig {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_ttl: Duration::from_secs(15),
            ..SharedStateConfig::default()
        });
        state.connect().await;

        let beats = Arc::new(SyncMutex::new(0u64));
        let counter = beats.clone();
        let metrics = Arc::new(move || {
            let mut n = counter.lock();
            *n += 1;
            ResourceCounters {
                active_connections: *n,
                ..ResourceCounters::default()
            }
        });
        assert!(state.spawn_heartbeat("worker-0", metrics).await);

        tokio::time::sleep(Duration::from_secs(11)).await;
        let rec: HeartbeatRecord = state
            .get(Namespace::WorkerHealth, "heartbeat:worker-0")
            .await
            .found()
            .unwrap();
        assert_eq!(rec.id, "worker-0");
        assert_eq!(rec.counters.active_connections, 3);

        state.disconnect().await;
        state.connect().await;
        tokio::time::advance(Duration::from_secs(16)).await;
        let gone: Lookup<HeartbeatRecord> =
            state.get(Namespace::WorkerHealth, "heartbeat:worker-0").await;
        assert_eq!(gone, Lookup::NotFound);
    }

    #[test]
    fn test_heartbeat_ttl_sentinel() {
        let cfg = SharedStateConfig {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(5),
            ..SharedStateConfig::default()
        };
        assert_eq!(cfg.heartbeat_ttl(), Duration::from_secs(20));
    }
}
