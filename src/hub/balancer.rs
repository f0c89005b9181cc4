//! # HubBalancer: hub table, selection policies and failover.
//!
//! ```text
//! select_hub(req)
//!   ├─ session bound to an eligible hub? ──► that hub
//!   ├─ eligible = serving ∧ utilisation < load_threshold ∧ protocol supported
//!   ├─ policy picks one of `eligible` (ties broken by hub id)
//!   └─ bind session ──► hub            (empty ⇒ NoAvailableHubs)
//!
//! execute_failover(src, dst)
//!   ├─ dst registered, eligible, ≠ src?  else FailoverFailed
//!   ├─ src serving ⇒ src = Unhealthy
//!   └─ sessions(src) ──► dst ──► FailoverReport
//! ```
//!
//! The table lives behind one `tokio::sync::RwLock`, so session bindings and
//! health changes are observed atomically by selection.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::GatewayError;
use crate::events::{Bus, Event, EventKind};
use crate::hub::health::{HubHealthReport, ProbeReport, report_key};
use crate::hub::record::{HealthStatus, HubRecord, HubType};
use crate::state::{Lookup, Namespace, SharedState, unix_millis};

/// How the balancer chooses among eligible hubs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingPolicy {
    /// Best health, then lowest utilisation; hub type and latency break ties.
    #[default]
    HealthFirst,
    /// Same region as the client if possible, else lowest latency.
    Geographic,
    /// Lowest current load.
    LeastConnections,
    /// Rotate through eligible hubs in id order.
    RoundRobin,
}

/// Balancer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Selection policy.
    pub policy: BalancingPolicy,
    /// Hubs at or above this utilisation are not selected.
    pub load_threshold: f64,
    /// Keep a session on the hub it was first routed to.
    pub session_affinity: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            policy: BalancingPolicy::HealthFirst,
            load_threshold: 0.9,
            session_affinity: true,
        }
    }
}

/// Routing context of one request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteRequest {
    /// Client session for affinity.
    pub session_id: Option<String>,
    /// Client region, matched against [`HubRecord::location`].
    pub client_location: Option<String>,
    /// Required protocol.
    pub protocol: Option<String>,
}

impl RouteRequest {
    /// Request bound to `session`.
    pub fn session(session: impl Into<String>) -> Self {
        Self {
            session_id: Some(session.into()),
            ..Self::default()
        }
    }

    /// Sets the client region.
    pub fn from_location(mut self, location: impl Into<String>) -> Self {
        self.client_location = Some(location.into());
        self
    }

    /// Sets the required protocol.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}

/// A change of a hub's health.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthTransition {
    /// Hub id.
    pub hub_id: String,
    /// Previous health.
    pub from: HealthStatus,
    /// New health.
    pub to: HealthStatus,
}

impl HealthTransition {
    /// True when the hub just stopped being eligible because of failures.
    pub fn entered_failure(&self) -> bool {
        !self.from.is_failing() && self.to.is_failing()
    }
}

/// Outcome of a completed failover.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailoverReport {
    /// Hub traffic moved away from.
    pub source: String,
    /// Hub traffic moved to.
    pub target: String,
    /// Session bindings migrated.
    pub sessions_moved: usize,
    /// Unix time (ms) of the failover.
    pub at_ms: u64,
}

/// Per-hub line of [`SystemStatus`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HubSnapshot {
    /// Hub id.
    pub hub_id: String,
    /// Role.
    pub hub_type: HubType,
    /// Current health.
    pub health_status: HealthStatus,
    /// `current_load / capacity`.
    pub utilization: f64,
    /// Failed probes in a row.
    pub consecutive_errors: u32,
    /// Unix time (ms) of the last health observation.
    pub last_health_check: Option<u64>,
}

/// Aggregate health of all hubs.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SystemStatus {
    /// Worst relevant health: Critical if any hub is failing, else Degraded if
    /// any is degraded, else Healthy. Critical when no hub is registered.
    pub overall: HealthStatus,
    /// Bound sessions.
    pub active_sessions: usize,
    /// One entry per hub, ordered by id.
    pub hubs: Vec<HubSnapshot>,
}

#[derive(Default)]
struct Table {
    hubs: HashMap<String, HubRecord>,
    sessions: HashMap<String, String>,
}

/// Hub table with selection, health bookkeeping and failover.
pub struct HubBalancer {
    config: BalancerConfig,
    table: RwLock<Table>,
    rr: AtomicUsize,
    bus: Option<Bus>,
}

impl HubBalancer {
    /// Empty balancer.
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            table: RwLock::new(Table::default()),
            rr: AtomicUsize::new(0),
            bus: None,
        }
    }

    /// Publishes hub events on `bus`.
    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Balancer settings.
    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    fn publish(&self, ev: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(ev);
        }
    }

    fn eligible(&self, hub: &HubRecord, protocol: Option<&str>) -> bool {
        hub.health_status.is_serving()
            && hub.utilization() < self.config.load_threshold
            && hub.supports(protocol)
    }

    /// Registers a hub.
    pub async fn add_hub(&self, hub: HubRecord) -> Result<(), GatewayError> {
        let mut t = self.table.write().await;
        if t.hubs.contains_key(&hub.hub_id) {
            return Err(GatewayError::DuplicateHub(hub.hub_id));
        }
        tracing::info!(hub = %hub.hub_id, kind = ?hub.hub_type, location = %hub.location, "hub added");
        self.publish(Event::new(EventKind::HubAdded).with_subject(hub.hub_id.as_str()));
        t.hubs.insert(hub.hub_id.clone(), hub);
        Ok(())
    }

    /// Unregisters a hub and drops its session bindings.
    ///
    /// The last Primary hub cannot be removed.
    pub async fn remove_hub(&self, hub_id: &str) -> Result<HubRecord, GatewayError> {
        let mut t = self.table.write().await;
        let Some(hub) = t.hubs.get(hub_id) else {
            return Err(GatewayError::UnknownHub(hub_id.to_string()));
        };
        if hub.hub_type == HubType::Primary {
            let primaries = t
                .hubs
                .values()
                .filter(|h| h.hub_type == HubType::Primary)
                .count();
            if primaries <= 1 {
                return Err(GatewayError::LastPrimaryHub(hub_id.to_string()));
            }
        }
        t.sessions.retain(|_, bound| bound.as_str() != hub_id);
        let removed = t
            .hubs
            .remove(hub_id)
            .ok_or_else(|| GatewayError::UnknownHub(hub_id.to_string()))?;
        tracing::info!(hub = hub_id, "hub removed");
        self.publish(Event::new(EventKind::HubRemoved).with_subject(hub_id));
        Ok(removed)
    }

    /// Snapshot of one hub.
    pub async fn hub(&self, hub_id: &str) -> Option<HubRecord> {
        self.table.read().await.hubs.get(hub_id).cloned()
    }

    /// Snapshot of all hubs, ordered by id.
    pub async fn hubs(&self) -> Vec<HubRecord> {
        let t = self.table.read().await;
        let mut hubs: Vec<_> = t.hubs.values().cloned().collect();
        hubs.sort_by(|a, b| a.hub_id.cmp(&b.hub_id));
        hubs
    }

    /// Hub a session is currently bound to.
    pub async fn session_hub(&self, session_id: &str) -> Option<String> {
        self.table.read().await.sessions.get(session_id).cloned()
    }

    /// Forgets a session binding.
    pub async fn end_session(&self, session_id: &str) -> bool {
        self.table.write().await.sessions.remove(session_id).is_some()
    }

    /// Updates the reported load of a hub.
    pub async fn update_load(&self, hub_id: &str, load: u64) -> Result<(), GatewayError> {
        let mut t = self.table.write().await;
        let hub = t
            .hubs
            .get_mut(hub_id)
            .ok_or_else(|| GatewayError::UnknownHub(hub_id.to_string()))?;
        hub.current_load = load;
        Ok(())
    }

    /// Picks a hub for `req`.
    pub async fn select_hub(&self, req: &RouteRequest) -> Result<HubRecord, GatewayError> {
        let mut t = self.table.write().await;
        let protocol = req.protocol.as_deref();

        if self.config.session_affinity {
            if let Some(bound) = req.session_id.as_ref().and_then(|s| t.sessions.get(s)) {
                if let Some(hub) = t.hubs.get(bound).filter(|h| self.eligible(h, protocol)) {
                    return Ok(hub.clone());
                }
            }
        }

        let candidates: Vec<&HubRecord> = t
            .hubs
            .values()
            .filter(|h| self.eligible(h, protocol))
            .collect();
        let picked = self
            .pick(candidates, req.client_location.as_deref())
            .cloned()
            .ok_or(GatewayError::NoAvailableHubs)?;

        if self.config.session_affinity {
            if let Some(session) = &req.session_id {
                t.sessions.insert(session.clone(), picked.hub_id.clone());
            }
        }
        tracing::debug!(hub = %picked.hub_id, policy = ?self.config.policy, "hub selected");
        Ok(picked)
    }

    fn pick<'a>(&self, mut candidates: Vec<&'a HubRecord>, location: Option<&str>) -> Option<&'a HubRecord> {
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.hub_id.cmp(&b.hub_id));
        match self.config.policy {
            BalancingPolicy::HealthFirst => candidates.into_iter().min_by(|a, b| {
                a.health_status
                    .rank()
                    .cmp(&b.health_status.rank())
                    .then(a.utilization().total_cmp(&b.utilization()))
                    .then(a.hub_type.rank().cmp(&b.hub_type.rank()))
                    .then(a.metadata.network_latency.cmp(&b.metadata.network_latency))
            }),
            BalancingPolicy::Geographic => {
                let by_latency = |a: &&HubRecord, b: &&HubRecord| -> Ordering {
                    a.metadata
                        .network_latency
                        .cmp(&b.metadata.network_latency)
                        .then(a.utilization().total_cmp(&b.utilization()))
                };
                let local = location.and_then(|loc| {
                    candidates
                        .iter()
                        .copied()
                        .filter(|h| h.location.eq_ignore_ascii_case(loc))
                        .min_by(by_latency)
                });
                local.or_else(|| candidates.iter().copied().min_by(by_latency))
            }
            BalancingPolicy::LeastConnections => candidates.into_iter().min_by(|a, b| {
                a.current_load
                    .cmp(&b.current_load)
                    .then(a.utilization().total_cmp(&b.utilization()))
            }),
            BalancingPolicy::RoundRobin => {
                let i = self.rr.fetch_add(1, AtomicOrdering::Relaxed) % candidates.len();
                candidates.get(i).copied()
            }
        }
    }

    /// Operator override of a hub's health (e.g. entering Maintenance).
    pub async fn set_health(
        &self,
        hub_id: &str,
        status: HealthStatus,
    ) -> Result<Option<HealthTransition>, GatewayError> {
        let mut t = self.table.write().await;
        let hub = t
            .hubs
            .get_mut(hub_id)
            .ok_or_else(|| GatewayError::UnknownHub(hub_id.to_string()))?;
        let from = hub.health_status;
        hub.health_status = status;
        Ok(self.transition(hub_id, from, status, "operator"))
    }

    /// Folds a probe result into the hub record.
    ///
    /// Failure demotes one step; success restores Healthy, or Degraded when the
    /// hub is at or above the load threshold. Maintenance is left alone.
    pub async fn apply_probe(
        &self,
        hub_id: &str,
        result: Result<ProbeReport, GatewayError>,
    ) -> Option<HealthTransition> {
        let mut t = self.table.write().await;
        let hub = t.hubs.get_mut(hub_id)?;
        hub.last_health_check = Some(unix_millis());
        let from = hub.health_status;
        if from == HealthStatus::Maintenance {
            return None;
        }
        match result {
            Ok(report) => {
                hub.consecutive_errors = 0;
                hub.metadata.network_latency = report.latency;
                if let Some(load) = report.current_load {
                    hub.current_load = load;
                }
                hub.health_status = if hub.utilization() >= self.config.load_threshold {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                let to = hub.health_status;
                self.transition(hub_id, from, to, "probe ok")
            }
            Err(e) => {
                hub.consecutive_errors = hub.consecutive_errors.saturating_add(1);
                hub.health_status = from.demote();
                let to = hub.health_status;
                let errors = hub.consecutive_errors;
                tracing::debug!(hub = hub_id, errors, error = %e, "probe failed");
                self.transition(hub_id, from, to, e.as_label())
            }
        }
    }

    fn transition(
        &self,
        hub_id: &str,
        from: HealthStatus,
        to: HealthStatus,
        cause: &str,
    ) -> Option<HealthTransition> {
        if from == to {
            return None;
        }
        let reason = format!("{from:?}->{to:?}: {cause}");
        if to.rank() > from.rank() {
            tracing::warn!(hub = hub_id, from = ?from, to = ?to, cause, "hub demoted");
            self.publish(Event::new(EventKind::HubDemoted).with_subject(hub_id).with_reason(reason));
        } else {
            tracing::info!(hub = hub_id, from = ?from, to = ?to, "hub recovered");
            self.publish(Event::new(EventKind::HubRecovered).with_subject(hub_id).with_reason(reason));
        }
        Some(HealthTransition {
            hub_id: hub_id.to_string(),
            from,
            to,
        })
    }

    /// Moves traffic from `source` to `target`.
    pub async fn execute_failover(&self, source: &str, target: &str) -> Result<FailoverReport, GatewayError> {
        let result = self.failover_locked(source, target).await;
        match &result {
            Ok(report) => {
                tracing::warn!(
                    source,
                    target,
                    sessions = report.sessions_moved,
                    "failover completed"
                );
                self.publish(
                    Event::new(EventKind::FailoverCompleted)
                        .with_subject(source)
                        .with_reason(target)
                        .with_connections(report.sessions_moved as u64),
                );
            }
            Err(e) => {
                tracing::error!(source, target, error = %e, "failover failed");
                self.publish(
                    Event::new(EventKind::FailoverFailed)
                        .with_subject(source)
                        .with_reason(e.to_string()),
                );
            }
        }
        result
    }

    async fn failover_locked(&self, source: &str, target: &str) -> Result<FailoverReport, GatewayError> {
        let mut t = self.table.write().await;
        let failed = |reason: String| GatewayError::FailoverFailed {
            source_hub: source.to_string(),
            target_hub: target.to_string(),
            reason,
        };

        if !t.hubs.contains_key(source) {
            return Err(GatewayError::UnknownHub(source.to_string()));
        }
        if source == target {
            return Err(failed("source and target are the same hub".into()));
        }
        let Some(dst) = t.hubs.get(target) else {
            return Err(failed("target is not registered".into()));
        };
        if !self.eligible(dst, None) {
            return Err(failed(format!(
                "target is not eligible ({:?}, utilisation {:.2})",
                dst.health_status,
                dst.utilization()
            )));
        }

        if let Some(src) = t.hubs.get_mut(source) {
            let from = src.health_status;
            if from.is_serving() {
                src.health_status = HealthStatus::Unhealthy;
                self.transition(source, from, HealthStatus::Unhealthy, "failover");
            }
        }

        let mut sessions_moved = 0;
        for bound in t.sessions.values_mut() {
            if *bound == source {
                *bound = target.to_string();
                sessions_moved += 1;
            }
        }

        Ok(FailoverReport {
            source: source.to_string(),
            target: target.to_string(),
            sessions_moved,
            at_ms: unix_millis(),
        })
    }

    /// Fails `source` over to the best available hub.
    ///
    /// A rejected target is excluded and selection runs again until a failover
    /// succeeds or no candidate is left.
    pub async fn fail_over(&self, source: &str) -> Result<FailoverReport, GatewayError> {
        let mut rejected: Vec<String> = Vec::new();
        loop {
            let target = {
                let t = self.table.read().await;
                if !t.hubs.contains_key(source) {
                    return Err(GatewayError::UnknownHub(source.to_string()));
                }
                let candidates: Vec<&HubRecord> = t
                    .hubs
                    .values()
                    .filter(|h| h.hub_id != source && !rejected.contains(&h.hub_id))
                    .filter(|h| self.eligible(h, None))
                    .collect();
                self.pick(candidates, None).map(|h| h.hub_id.clone())
            };
            let Some(target) = target else {
                tracing::error!(source, "no failover target available");
                return Err(GatewayError::NoAvailableHubs);
            };
            match self.execute_failover(source, &target).await {
                Err(GatewayError::FailoverFailed { .. }) => rejected.push(target),
                other => return other,
            }
        }
    }

    /// Per-hub health and the overall verdict.
    pub async fn system_status(&self) -> SystemStatus {
        let t = self.table.read().await;
        let mut hubs: Vec<HubSnapshot> = t
            .hubs
            .values()
            .map(|h| HubSnapshot {
                hub_id: h.hub_id.clone(),
                hub_type: h.hub_type,
                health_status: h.health_status,
                utilization: h.utilization(),
                consecutive_errors: h.consecutive_errors,
                last_health_check: h.last_health_check,
            })
            .collect();
        hubs.sort_by(|a, b| a.hub_id.cmp(&b.hub_id));

        let overall = if hubs.is_empty() || hubs.iter().any(|h| h.health_status.is_failing()) {
            HealthStatus::Critical
        } else if hubs.iter().any(|h| h.health_status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SystemStatus {
            overall,
            active_sessions: t.sessions.len(),
            hubs,
        }
    }

    /// Adopts hub health published by other processes when it is newer than
    /// the local observation. Returns the number of hubs updated.
    ///
    /// An unavailable backend leaves every local record untouched.
    pub async fn refresh_from_shared(&self, state: &SharedState) -> usize {
        let ids: Vec<String> = self.table.read().await.hubs.keys().cloned().collect();
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            match state
                .get::<HubHealthReport>(Namespace::ServerHealth, &report_key(&id))
                .await
            {
                Lookup::Found(r) => reports.push(r),
                Lookup::NotFound => {}
                Lookup::Unavailable => {
                    tracing::debug!("shared state unavailable; keeping local hub health");
                    return 0;
                }
            }
        }

        let mut t = self.table.write().await;
        let mut adopted = 0;
        for r in reports {
            let Some(hub) = t.hubs.get_mut(&r.hub_id) else {
                continue;
            };
            if hub.health_status == HealthStatus::Maintenance
                || hub.last_health_check.is_some_and(|local| local >= r.checked_at_ms)
            {
                continue;
            }
            let from = hub.health_status;
            hub.health_status = r.health_status;
            hub.current_load = r.current_load;
            hub.consecutive_errors = r.consecutive_errors;
            hub.last_health_check = Some(r.checked_at_ms);
            self.transition(&r.hub_id, from, r.health_status, "shared state");
            adopted += 1;
        }
        adopted
    }
}
