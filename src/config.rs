//! # Aggregate configuration.
//!
//! [`Config`] bundles the settings of every component, each with its own
//! `Default`. Deployments override a subset through a [`ConfigPatch`], read
//! from JSON or from `HUBVISOR_*` environment variables, and applied with
//! [`Config::merge`].
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use hubvisor::{Config, ConfigPatch};
//!
//! let patch = ConfigPatch::from_vars([
//!     ("HUBVISOR_WORKER_COUNT", "4"),
//!     ("HUBVISOR_RESTART_DELAY_MS", "250"),
//!     ("HUBVISOR_BALANCING_POLICY", "round_robin"),
//! ])
//! .unwrap();
//!
//! let cfg = Config::default().merge(patch);
//! assert_eq!(cfg.supervisor.worker_count, 4);
//! assert_eq!(cfg.supervisor.restart_delay, Duration::from_millis(250));
//! ```

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::SupervisorConfig;
use crate::error::ConfigError;
use crate::hub::{BalancerConfig, BalancingPolicy, HealthCheckConfig};
use crate::policies::BackoffPolicy;
use crate::resilience::{BreakerConfig, ResilienceRegistry, RetryConfig};
use crate::state::SharedStateConfig;

/// Prefix of every environment variable read by [`ConfigPatch::from_env`].
pub const ENV_PREFIX: &str = "HUBVISOR_";

/// Overrides applied on top of a retry preset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Replaces the preset's retry count.
    pub max_retries: Option<u32>,
    /// Replaces the preset's delay curve.
    pub backoff: Option<BackoffPolicy>,
}

impl RetrySettings {
    /// `base` with these overrides; the retry condition is kept.
    pub fn apply(&self, mut base: RetryConfig) -> RetryConfig {
        if let Some(n) = self.max_retries {
            base.max_retries = n;
        }
        if let Some(b) = self.backoff {
            base.backoff = b;
        }
        base
    }
}

/// Overrides for the named retry presets.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPresets {
    /// `network` preset.
    pub network: RetrySettings,
    /// `database` preset.
    pub database: RetrySettings,
    /// `authentication` preset.
    pub authentication: RetrySettings,
}

impl RetryPresets {
    /// Registers the three presets, with overrides applied, in `registry`.
    pub fn register(&self, registry: &ResilienceRegistry) {
        registry.register_retry("network", self.network.apply(RetryConfig::network()));
        registry.register_retry("database", self.database.apply(RetryConfig::database()));
        registry.register_retry(
            "authentication",
            self.authentication.apply(RetryConfig::authentication()),
        );
    }
}

/// Settings of every component.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Process supervisor.
    pub supervisor: SupervisorConfig,
    /// Shared-state backend.
    pub shared_state: SharedStateConfig,
    /// Default breaker for names created on demand.
    pub breaker: BreakerConfig,
    /// Retry preset overrides.
    pub retry: RetryPresets,
    /// Hub selection.
    pub balancer: BalancerConfig,
    /// Hub probing.
    pub health: HealthCheckConfig,
}

impl Config {
    /// Applies every field set in `patch`.
    pub fn merge(mut self, patch: ConfigPatch) -> Self {
        let s = &mut self.supervisor;
        set(&mut s.worker_count, patch.worker_count);
        set(&mut s.max_restarts, patch.max_restarts);
        set(&mut s.restart_delay, patch.restart_delay_ms.map(Duration::from_millis));
        set(&mut s.startup_timeout, patch.startup_timeout_ms.map(Duration::from_millis));
        set(&mut s.shutdown_timeout, patch.shutdown_timeout_ms.map(Duration::from_millis));
        set(&mut s.auto_restart, patch.auto_restart);

        let st = &mut self.shared_state;
        set(&mut st.enabled, patch.shared_state_enabled);
        set(&mut st.url, patch.shared_state_url);
        set(&mut st.prefix, patch.shared_state_prefix);
        if let Some(secs) = patch.default_ttl_secs {
            st.default_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        set(&mut st.heartbeat_interval, patch.heartbeat_interval_secs.map(Duration::from_secs));

        let b = &mut self.breaker;
        set(&mut b.failure_threshold, patch.breaker_failure_threshold);
        set(
            &mut b.recovery_timeout,
            patch.breaker_recovery_timeout_secs.map(Duration::from_secs),
        );

        set(&mut self.balancer.policy, patch.balancing_policy);
        set(&mut self.balancer.load_threshold, patch.load_threshold);
        set(&mut self.balancer.session_affinity, patch.session_affinity);

        set(&mut self.health.interval, patch.health_interval_secs.map(Duration::from_secs));
        set(&mut self.health.timeout, patch.health_timeout_ms.map(Duration::from_millis));

        if let Some(retry) = patch.retry {
            self.retry = retry;
        }
        self
    }

    /// Defaults overlaid with the `HUBVISOR_*` environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::default().merge(ConfigPatch::from_env()?))
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

/// Partial configuration; `None` leaves the current value.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub worker_count: Option<usize>,
    pub max_restarts: Option<u32>,
    pub restart_delay_ms: Option<u64>,
    pub startup_timeout_ms: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
    pub auto_restart: Option<bool>,

    pub shared_state_enabled: Option<bool>,
    pub shared_state_url: Option<String>,
    pub shared_state_prefix: Option<String>,
    /// `0` disables the default TTL.
    pub default_ttl_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,

    pub breaker_failure_threshold: Option<u32>,
    pub breaker_recovery_timeout_secs: Option<u64>,

    pub balancing_policy: Option<BalancingPolicy>,
    pub load_threshold: Option<f64>,
    pub session_affinity: Option<bool>,

    pub health_interval_secs: Option<u64>,
    pub health_timeout_ms: Option<u64>,

    /// Replaces all retry preset overrides. Not read from the environment.
    pub retry: Option<RetryPresets>,
}

impl ConfigPatch {
    /// Reads `HUBVISOR_*` variables of the current process.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Builds a patch from `(name, value)` pairs; unknown names are ignored.
    ///
    /// Names are the upper-cased field names with the `HUBVISOR_` prefix,
    /// e.g. `HUBVISOR_MAX_RESTARTS`.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut p = Self::default();
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let v = value.as_ref().trim();
            match name {
                "WORKER_COUNT" => p.worker_count = Some(parse(name, v)?),
                "MAX_RESTARTS" => p.max_restarts = Some(parse(name, v)?),
                "RESTART_DELAY_MS" => p.restart_delay_ms = Some(parse(name, v)?),
                "STARTUP_TIMEOUT_MS" => p.startup_timeout_ms = Some(parse(name, v)?),
                "SHUTDOWN_TIMEOUT_MS" => p.shutdown_timeout_ms = Some(parse(name, v)?),
                "AUTO_RESTART" => p.auto_restart = Some(parse_bool(name, v)?),
                "SHARED_STATE_ENABLED" => p.shared_state_enabled = Some(parse_bool(name, v)?),
                "SHARED_STATE_URL" => p.shared_state_url = Some(v.to_string()),
                "SHARED_STATE_PREFIX" => p.shared_state_prefix = Some(v.to_string()),
                "DEFAULT_TTL_SECS" => p.default_ttl_secs = Some(parse(name, v)?),
                "HEARTBEAT_INTERVAL_SECS" => p.heartbeat_interval_secs = Some(parse(name, v)?),
                "BREAKER_FAILURE_THRESHOLD" => p.breaker_failure_threshold = Some(parse(name, v)?),
                "BREAKER_RECOVERY_TIMEOUT_SECS" => {
                    p.breaker_recovery_timeout_secs = Some(parse(name, v)?)
                }
                "BALANCING_POLICY" => {
                    p.balancing_policy = Some(
                        serde_json::from_value(serde_json::Value::String(v.to_ascii_lowercase()))
                            .map_err(|_| invalid(name, v))?,
                    )
                }
                "LOAD_THRESHOLD" => p.load_threshold = Some(parse(name, v)?),
                "SESSION_AFFINITY" => p.session_affinity = Some(parse_bool(name, v)?),
                "HEALTH_INTERVAL_SECS" => p.health_interval_secs = Some(parse(name, v)?),
                "HEALTH_TIMEOUT_MS" => p.health_timeout_ms = Some(parse(name, v)?),
                _ => {}
            }
        }
        Ok(p)
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(name, value))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}
