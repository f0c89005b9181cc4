//! Shared state across process boundaries.
//!
//! - [`StateStore`] is the backend transport (key/value + pub/sub).
//! - [`MemoryStore`] is the in-process backend, [`RedisStore`] the one shared
//!   across processes; [`open`] resolves URLs to either.
//! - [`SharedState`] is the facade callers use: namespaced keys, JSON values,
//!   and "unavailable" instead of errors when the backend is gone.
//! - Heartbeats ([`HeartbeatRecord`]) are sampled from an injected [`MetricsSource`].
//!
//! Sharing is best effort and last-write-wins per key; there is no consensus.

mod heartbeat;
mod memory;
mod redis_store;
mod shared;
mod store;

pub use heartbeat::{HeartbeatRecord, MetricsSource, ResourceCounters};
pub(crate) use heartbeat::unix_millis;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use shared::{Lookup, Namespace, SharedState, SharedStateConfig, Write};
pub use store::{StateStore, open};
