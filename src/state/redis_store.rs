//! [`StateStore`] over a Redis server.
//!
//! Every process opening the same `redis://` URL sees the same keys and
//! topics, which is what lets forked workers and the supervisor share state.
//!
//! ## Connections
//! ```text
//! set/get/delete/publish ──► one multiplexed connection (cloned per call)
//! subscribe(topic)       ──► dedicated pub/sub connection ──pump──► broadcast::Sender
//!                                                                 ├─► Receiver
//!                                                                 └─► Receiver
//! ```
//! Commands are bounded by [`OP_TIMEOUT`]; a stalled server reads as
//! unreachable rather than blocking the caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::StateError;
use crate::state::StateStore;

const TOPIC_CAPACITY: usize = 256;

/// Upper bound for opening a connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a single command.
pub const OP_TIMEOUT: Duration = Duration::from_secs(2);

type Topics = Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>;

/// Redis-backed shared-state store.
pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    topics: Topics,
    pumps: Mutex<CancellationToken>,
}

impl RedisStore {
    /// Parses `url` (`redis://[user:pass@]host[:port][/db]`). No connection is
    /// made until [`StateStore::connect`].
    pub fn new(url: &str) -> Result<Self, StateError> {
        let client = redis::Client::open(url).map_err(|e| {
            tracing::debug!(%url, error = %e, "rejected redis url");
            StateError::UnsupportedUrl(url.to_string())
        })?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            topics: Arc::new(Mutex::new(HashMap::new())),
            pumps: Mutex::new(CancellationToken::new()),
        })
    }

    fn conn(&self) -> Result<MultiplexedConnection, StateError> {
        self.conn
            .lock()
            .clone()
            .ok_or_else(|| StateError::Unreachable("not connected".into()))
    }

    fn spawn_pump(&self, topic: String, mut pubsub: redis::aio::PubSub, tx: broadcast::Sender<String>) {
        let token = self.pumps.lock().clone();
        let topics = Arc::clone(&self.topics);
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.on_message());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = messages.next() => match msg {
                        Some(msg) => match msg.get_payload::<String>() {
                            Ok(payload) => {
                                let _ = tx.send(payload);
                            }
                            Err(e) => tracing::debug!(%topic, error = %e, "dropping non-text message"),
                        },
                        None => {
                            tracing::warn!(%topic, "redis subscription closed");
                            topics.lock().remove(&topic);
                            break;
                        }
                    }
                }
            }
        });
    }
}

async fn bounded<T>(
    what: &'static str,
    fut: impl Future<Output = redis::RedisResult<T>>,
    limit: Duration,
) -> Result<T, StateError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(StateError::Unreachable(format!("{what} timed out after {limit:?}"))),
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn connect(&self) -> Result<(), StateError> {
        let conn = bounded(
            "connect",
            self.client.get_multiplexed_async_connection(),
            CONNECT_TIMEOUT,
        )
        .await?;
        *self.conn.lock() = Some(conn);
        Ok(())
    }

    async fn disconnect(&self) {
        self.conn.lock().take();
        self.topics.lock().clear();
        let old = std::mem::take(&mut *self.pumps.lock());
        old.cancel();
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StateError> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let () = bounded("set", cmd.query_async(&mut conn), OP_TIMEOUT).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        let mut conn = self.conn()?;
        bounded("get", conn.get(key), OP_TIMEOUT).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StateError> {
        let mut conn = self.conn()?;
        let removed: i64 = bounded("delete", conn.del(key), OP_TIMEOUT).await?;
        Ok(removed > 0)
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<usize, StateError> {
        let mut conn = self.conn()?;
        let reached: i64 = bounded("publish", conn.publish(topic, payload), OP_TIMEOUT).await?;
        Ok(reached.max(0) as usize)
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<String>, StateError> {
        self.conn()?;
        if let Some(tx) = self.topics.lock().get(topic) {
            return Ok(tx.subscribe());
        }

        let mut pubsub = bounded("subscribe", self.client.get_async_pubsub(), CONNECT_TIMEOUT).await?;
        bounded("subscribe", pubsub.subscribe(topic), OP_TIMEOUT).await?;

        let (tx, rx) = {
            let mut topics = self.topics.lock();
            if let Some(existing) = topics.get(topic) {
                // lost a race with a concurrent subscribe; its pump serves both
                return Ok(existing.subscribe());
            }
            let (tx, rx) = broadcast::channel(TOPIC_CAPACITY);
            topics.insert(topic.to_string(), tx.clone());
            (tx, rx)
        };
        self.spawn_pump(topic.to_string(), pubsub, tx);
        Ok(rx)
    }
}
