//! # HealthMonitor: periodic hub probing.
//!
//! Every `interval` the monitor probes all non-maintenance hubs in parallel.
//! Each probe runs through the hub's breaker (`hub:<id>` in the
//! [`ResilienceRegistry`]) with the configured timeout, so a hub that keeps
//! failing is rejected quickly instead of tying up the round.
//!
//! ```text
//! tick ─► probe all (join_all) ─► balancer.apply_probe ─┬─► ServerHealth "hub:<id>"
//!                                                        └─► entered Unhealthy ∧ Automatic ─► fail_over
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::hub::balancer::{HealthTransition, HubBalancer};
use crate::hub::breaker_name;
use crate::hub::record::{FailoverPolicy, HealthStatus, HubRecord};
use crate::resilience::ResilienceRegistry;
use crate::state::{Namespace, SharedState, Write};

/// Probe cadence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Time between probe rounds.
    pub interval: Duration,
    /// Per-probe deadline.
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

/// What a successful probe observed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeReport {
    /// Round-trip latency.
    pub latency: Duration,
    /// Load reported by the hub, if any.
    pub current_load: Option<u64>,
}

/// Checks one hub. Injected so tests and deployments choose the transport.
#[async_trait]
pub trait HubProbe: Send + Sync + 'static {
    /// Probes `hub`; an error counts as a failed check.
    async fn probe(&self, hub: &HubRecord) -> Result<ProbeReport, GatewayError>;
}

/// Hub health as published to other processes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubHealthReport {
    /// Hub id.
    pub hub_id: String,
    /// Health after the check.
    pub health_status: HealthStatus,
    /// Load after the check.
    pub current_load: u64,
    /// Failed probes in a row.
    pub consecutive_errors: u32,
    /// Latency of the last successful probe.
    pub latency_ms: Option<u64>,
    /// Unix time (ms) of the check.
    pub checked_at_ms: u64,
}

impl HubHealthReport {
    fn from_record(hub: &HubRecord) -> Self {
        Self {
            hub_id: hub.hub_id.clone(),
            health_status: hub.health_status,
            current_load: hub.current_load,
            consecutive_errors: hub.consecutive_errors,
            latency_ms: (hub.consecutive_errors == 0)
                .then(|| hub.metadata.network_latency.as_millis() as u64),
            checked_at_ms: hub.last_health_check.unwrap_or_default(),
        }
    }
}

/// Key of a hub's report in [`Namespace::ServerHealth`].
pub(crate) fn report_key(hub_id: &str) -> String {
    format!("hub:{hub_id}")
}

/// Periodic prober feeding the balancer.
pub struct HealthMonitor {
    balancer: Arc<HubBalancer>,
    probe: Arc<dyn HubProbe>,
    registry: Arc<ResilienceRegistry>,
    shared: Option<Arc<SharedState>>,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    /// Creates a monitor; nothing runs until [`spawn`](Self::spawn) or [`check_all`](Self::check_all).
    pub fn new(
        balancer: Arc<HubBalancer>,
        probe: Arc<dyn HubProbe>,
        registry: Arc<ResilienceRegistry>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            balancer,
            probe,
            registry,
            shared: None,
            config,
        }
    }

    /// Publishes every check result to `state`.
    pub fn with_shared_state(mut self, state: Arc<SharedState>) -> Self {
        self.shared = Some(state);
        self
    }

    /// Runs one probe round and returns the health changes it caused.
    pub async fn check_all(&self) -> Vec<HealthTransition> {
        let hubs: Vec<HubRecord> = self
            .balancer
            .hubs()
            .await
            .into_iter()
            .filter(|h| h.health_status != HealthStatus::Maintenance)
            .collect();

        let checks: Vec<_> = hubs
            .into_iter()
            .map(|hub| {
                let breaker = self.registry.breaker(&breaker_name(&hub.hub_id));
                let probe = Arc::clone(&self.probe);
                let timeout = self.config.timeout;
                async move {
                    let result = breaker
                        .execute_with_timeout(timeout, || probe.probe(&hub))
                        .await
                        .map_err(GatewayError::from);
                    (hub, result)
                }
            })
            .collect();
        let results = futures::future::join_all(checks).await;

        let mut transitions = Vec::new();
        for (hub, result) in results {
            let transition = self.balancer.apply_probe(&hub.hub_id, result).await;
            self.publish_report(&hub.hub_id).await;
            let Some(transition) = transition else {
                continue;
            };
            if transition.entered_failure() && hub.failover_policy == FailoverPolicy::Automatic {
                match self.balancer.fail_over(&hub.hub_id).await {
                    Ok(report) => tracing::info!(
                        source = %report.source,
                        target = %report.target,
                        "automatic failover"
                    ),
                    Err(e) => tracing::error!(hub = %hub.hub_id, error = %e, "automatic failover failed"),
                }
            }
            transitions.push(transition);
        }
        transitions
    }

    async fn publish_report(&self, hub_id: &str) {
        let Some(state) = &self.shared else {
            return;
        };
        let Some(hub) = self.balancer.hub(hub_id).await else {
            return;
        };
        let report = HubHealthReport::from_record(&hub);
        if state
            .set(Namespace::ServerHealth, &report_key(hub_id), &report)
            .await
            == Write::Unavailable
        {
            tracing::debug!(hub = hub_id, "hub report not published; shared state unavailable");
        }
    }

    /// Probes on every tick until `token` is cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let changed = self.check_all().await;
                        if !changed.is_empty() {
                            tracing::debug!(changes = changed.len(), "hub health round");
                        }
                    }
                }
            }
        })
    }
}
