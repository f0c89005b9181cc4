//! # Example: cluster
//!
//! The same binary is both supervisor and worker: the supervisor re-executes
//! itself with `HUBVISOR_WORKER_ID` set, and a process that finds the variable
//! runs the worker side of the control protocol.
//!
//! ```text
//! cargo run --example cluster
//! RUST_LOG=hubvisor=debug HUBVISOR_WORKER_COUNT=2 cargo run --example cluster
//! ```
//!
//! Ctrl-C sends `Shutdown` to every worker; each drains its in-flight work and
//! acknowledges before exiting.
//!
//! With the default `memory://` backend each process keeps its own state. Point
//! every process at one Redis server to share worker reports, heartbeats and
//! hub health between them (children inherit the variable):
//!
//! ```text
//! HUBVISOR_SHARED_STATE_URL=redis://127.0.0.1:6379 cargo run --example cluster
//! redis-cli --scan --pattern 'hubvisor:*'
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use hubvisor::state::{ResourceCounters, SharedState};
use hubvisor::{
    CommandSpawner, Config, GatewayError, HealthMonitor, HubBalancer, HubProbe, HubRecord,
    HubRouter, HubType, LogWriter, ProbeReport, ResilienceRegistry, RouteRequest, StateReporter,
    Subscribe, Supervisor, WorkerConfig, WorkerRuntime, worker_id_from_env,
};

/// Pretends every hub answers in 3ms.
struct StaticProbe;

#[async_trait]
impl HubProbe for StaticProbe {
    async fn probe(&self, _hub: &HubRecord) -> Result<ProbeReport, GatewayError> {
        Ok(ProbeReport {
            latency: Duration::from_millis(3),
            current_load: None,
        })
    }
}

async fn run_worker(id: String, cfg: Config) -> anyhow::Result<()> {
    let state = SharedState::from_config(cfg.shared_state)?;
    if state.connect().await {
        let counters = Arc::new(ResourceCounters::default);
        state.spawn_heartbeat(&id, counters).await;
    }

    let runtime = WorkerRuntime::from_stdio(WorkerConfig::default());
    let handle = runtime.handle();

    let token = handle.shutdown_token();
    handle.spawn(async move {
        let mut ticks = 0u64;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(2)) => {
                    ticks += 1;
                    tracing::info!(worker = %id, ticks, "serving");
                }
            }
        }
    });

    let result = runtime.run().await;
    state.disconnect().await;
    result?;
    Ok(())
}

async fn run_supervisor(cfg: Config) -> anyhow::Result<()> {
    let state = Arc::new(SharedState::from_config(cfg.shared_state.clone())?);
    if !state.connect().await {
        tracing::warn!("shared state unavailable; continuing without it");
    }

    let registry = Arc::new(ResilienceRegistry::new(cfg.breaker.clone()));
    cfg.retry.register(&registry);

    let balancer = Arc::new(HubBalancer::new(cfg.balancer.clone()));
    balancer
        .add_hub(HubRecord::new("hub-eu", HubType::Primary, "eu", 500))
        .await?;
    balancer
        .add_hub(HubRecord::new("hub-us", HubType::Secondary, "us", 500))
        .await?;

    let token = tokio_util::sync::CancellationToken::new();
    let monitor = Arc::new(
        HealthMonitor::new(
            balancer.clone(),
            Arc::new(StaticProbe),
            registry.clone(),
            cfg.health.clone(),
        )
        .with_shared_state(state.clone()),
    );
    let monitor_task = monitor.spawn(token.clone());
    let recovery_task = registry.clone().spawn_recovery_monitor(token.clone());

    let router = HubRouter::new(balancer.clone(), registry.clone());
    let hub = router
        .call(&RouteRequest::session("demo").from_location("eu"), |hub, _ctx| {
            let id = hub.hub_id.clone();
            async move { Ok::<_, GatewayError>(id) }
        })
        .await?;
    tracing::info!(%hub, "demo session routed");

    let subs: Vec<Arc<dyn Subscribe>> = vec![
        Arc::new(LogWriter::new()),
        Arc::new(StateReporter::new(state.clone())),
    ];
    let sup = Supervisor::new(
        cfg.supervisor.clone(),
        Arc::new(CommandSpawner::current_exe()?),
        subs,
    );

    let result = sup.run_until_signal().await;

    token.cancel();
    let _ = tokio::join!(monitor_task, recovery_task);
    println!("{}", serde_json::to_string_pretty(&sup.cluster_status().await)?);
    println!("{}", serde_json::to_string_pretty(&balancer.system_status().await)?);
    state.disconnect().await;

    result?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the control protocol in workers
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = Config::from_env()?;
    match worker_id_from_env() {
        Some(id) => run_worker(id, cfg).await,
        None => run_supervisor(cfg).await,
    }
}
