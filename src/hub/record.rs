//! Hub records and health states.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Role of a hub in the deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubType {
    /// Main serving hub; at least one must always be registered.
    Primary,
    /// Serves alongside primaries.
    Secondary,
    /// Close to clients, usually smaller.
    Edge,
    /// Used when nothing better is eligible.
    Backup,
}

impl HubType {
    /// Preference order for health-first selection (lower is better).
    pub(crate) fn rank(self) -> u8 {
        match self {
            HubType::Primary => 0,
            HubType::Secondary => 1,
            HubType::Edge => 2,
            HubType::Backup => 3,
        }
    }
}

/// Health of a hub.
///
/// ```text
/// Healthy ──fail──► Degraded ──fail──► Unhealthy ──fail──► Critical
///    ▲                  ▲
///    └──── probe ok ────┘   (Degraded when utilisation ≥ load threshold)
///
/// Maintenance: set by an operator, never changed by probes.
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Fully serving.
    Healthy,
    /// Serving, but slow or loaded.
    Degraded,
    /// Not eligible for traffic.
    Unhealthy,
    /// Not eligible; repeated failures.
    Critical,
    /// Taken out by an operator.
    Maintenance,
}

impl HealthStatus {
    /// One step down the ladder after a failed probe.
    pub fn demote(self) -> Self {
        match self {
            HealthStatus::Healthy => HealthStatus::Degraded,
            HealthStatus::Degraded => HealthStatus::Unhealthy,
            HealthStatus::Unhealthy | HealthStatus::Critical => HealthStatus::Critical,
            HealthStatus::Maintenance => HealthStatus::Maintenance,
        }
    }

    /// Healthy or Degraded.
    pub fn is_serving(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Unhealthy or Critical.
    pub fn is_failing(self) -> bool {
        matches!(self, HealthStatus::Unhealthy | HealthStatus::Critical)
    }

    pub(crate) fn rank(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
            HealthStatus::Critical => 3,
            HealthStatus::Maintenance => 4,
        }
    }
}

/// Whether the health monitor may move traffic off a failing hub by itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPolicy {
    /// Fail over as soon as the hub reaches Unhealthy.
    #[default]
    Automatic,
    /// Only an operator fails over.
    Manual,
}

/// Static hub characteristics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HubMetadata {
    /// Last measured round-trip latency.
    pub network_latency: Duration,
    /// Link bandwidth in Mbit/s.
    pub bandwidth: u64,
    /// Protocols this hub serves; empty means any.
    pub supported_protocols: Vec<String>,
}

/// Balancer-side record of one hub.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HubRecord {
    /// Unique id.
    pub hub_id: String,
    /// Role.
    pub hub_type: HubType,
    /// Region label matched against the client location.
    pub location: String,
    /// Current health.
    pub health_status: HealthStatus,
    /// Failover behaviour.
    pub failover_policy: FailoverPolicy,
    /// Maximum concurrent load.
    pub capacity: u64,
    /// Current load.
    pub current_load: u64,
    /// Unix time (ms) of the last health observation.
    pub last_health_check: Option<u64>,
    /// Failed probes in a row.
    pub consecutive_errors: u32,
    /// Static characteristics.
    pub metadata: HubMetadata,
}

impl HubRecord {
    /// A healthy, idle hub with automatic failover.
    pub fn new(hub_id: impl Into<String>, hub_type: HubType, location: impl Into<String>, capacity: u64) -> Self {
        Self {
            hub_id: hub_id.into(),
            hub_type,
            location: location.into(),
            health_status: HealthStatus::Healthy,
            failover_policy: FailoverPolicy::default(),
            capacity,
            current_load: 0,
            last_health_check: None,
            consecutive_errors: 0,
            metadata: HubMetadata::default(),
        }
    }

    /// Sets the initial health.
    pub fn with_health(mut self, status: HealthStatus) -> Self {
        self.health_status = status;
        self
    }

    /// Sets the current load.
    pub fn with_load(mut self, load: u64) -> Self {
        self.current_load = load;
        self
    }

    /// Sets the failover policy.
    pub fn with_failover_policy(mut self, policy: FailoverPolicy) -> Self {
        self.failover_policy = policy;
        self
    }

    /// Sets the metadata.
    pub fn with_metadata(mut self, metadata: HubMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// `current_load / capacity`; a hub without capacity counts as full.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.current_load as f64 / self.capacity as f64
    }

    /// True if `protocol` is served (or no protocol was requested).
    pub fn supports(&self, protocol: Option<&str>) -> bool {
        match protocol {
            None => true,
            Some(p) => {
                self.metadata.supported_protocols.is_empty()
                    || self
                        .metadata
                        .supported_protocols
                        .iter()
                        .any(|s| s.eq_ignore_ascii_case(p))
            }
        }
    }
}
