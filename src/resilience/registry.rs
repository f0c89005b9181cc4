//! # Named registry of breakers and retry presets.
//!
//! An explicit object passed to call sites (the hub router, the health
//! monitor); there is no process-global instance.
//!
//! ```text
//! ResilienceRegistry
//!   ├── breakers: name → Arc<CircuitBreaker>   (created lazily, shared)
//!   ├── retries:  name → RetryConfig           (registered or preset)
//!   └── recovery monitor ── every monitoring_period ──► evaluate_recovery()
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::Bus;
use crate::resilience::{BreakerConfig, BreakerStats, CircuitBreaker, Retry, RetryConfig};

/// Registry of named resilience primitives.
pub struct ResilienceRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    retries: RwLock<HashMap<String, RetryConfig>>,
    default_breaker: BreakerConfig,
    bus: Option<Bus>,
}

impl ResilienceRegistry {
    /// Creates an empty registry; breakers created on demand use `default_breaker`.
    pub fn new(default_breaker: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            retries: RwLock::new(HashMap::new()),
            default_breaker,
            bus: None,
        }
    }

    /// Publishes breaker transitions of every breaker created from now on.
    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Returns the breaker for `name`, creating it with the default config.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breaker_with(name, self.default_breaker.clone())
    }

    /// Returns the breaker for `name`, creating it with `config` if absent.
    ///
    /// An existing breaker keeps its original config.
    pub fn breaker_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(name) {
            return Arc::clone(b);
        }
        let mut map = self.breakers.write();
        let entry = map.entry(name.to_string()).or_insert_with(|| {
            let mut b = CircuitBreaker::new(name, config);
            if let Some(bus) = &self.bus {
                b = b.with_bus(bus.clone());
            }
            Arc::new(b)
        });
        Arc::clone(entry)
    }

    /// Returns the breaker for `name` without creating one.
    pub fn get_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Registers (or replaces) a named retry configuration.
    pub fn register_retry(&self, name: impl Into<String>, config: RetryConfig) {
        self.retries.write().insert(name.into(), config);
    }

    /// Retry controller for `name`: registered config, else the preset of
    /// that name, else the default preset.
    pub fn retry(&self, name: &str) -> Retry {
        let config = self
            .retries
            .read()
            .get(name)
            .cloned()
            .or_else(|| RetryConfig::preset(name))
            .unwrap_or_default();
        Retry::new(name, config)
    }

    /// Resets every breaker to `Closed`.
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.read().values().cloned().collect();
        for b in breakers {
            b.reset();
        }
    }

    /// Snapshot of every breaker, keyed by name.
    pub fn stats(&self) -> HashMap<String, BreakerStats> {
        self.breakers
            .read()
            .iter()
            .map(|(k, b)| (k.clone(), b.snapshot()))
            .collect()
    }

    /// Spawns the passive recovery monitor.
    ///
    /// Every `monitoring_period` of the default config, each breaker is asked
    /// to [`evaluate_recovery`](CircuitBreaker::evaluate_recovery). Stops when
    /// `token` is cancelled.
    pub fn spawn_recovery_monitor(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let period = self.default_breaker.monitoring_period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let breakers: Vec<_> = self.breakers.read().values().cloned().collect();
                        for b in breakers {
                            if b.evaluate_recovery() {
                                tracing::info!(breaker = b.name(), "breaker closed by recovery monitor");
                            }
                        }
                    }
                }
            }
            tracing::debug!("recovery monitor stopped");
        })
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
