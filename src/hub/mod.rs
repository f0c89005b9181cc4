//! Multi-hub load balancing, health monitoring and failover.
//!
//! - [`HubBalancer`] owns the hub table and session bindings and picks a hub
//!   per request under a [`BalancingPolicy`].
//! - [`HealthMonitor`] probes hubs through an injected [`HubProbe`], demotes or
//!   restores them and triggers automatic failover.
//! - [`HubRouter`] is the guarded call path: selection, breaker, retry.

mod balancer;
mod health;
mod record;
mod router;

pub use balancer::{
    BalancerConfig, BalancingPolicy, FailoverReport, HealthTransition, HubBalancer, HubSnapshot,
    RouteRequest, SystemStatus,
};
pub use health::{HealthCheckConfig, HealthMonitor, HubHealthReport, HubProbe, ProbeReport};
pub use record::{FailoverPolicy, HealthStatus, HubMetadata, HubRecord, HubType};
pub use router::HubRouter;

/// Name of the breaker guarding calls to `hub_id`.
pub fn breaker_name(hub_id: &str) -> String {
    format!("hub:{hub_id}")
}
