//! # Supervisor: forks worker slots, fans out events, and drives shutdown.
//!
//! ## Architecture
//! ```text
//! start(n):
//!   worker-0 ──fork_delay──► worker-1 ──fork_delay──► ... worker-(n-1)
//!       │                        │
//!       └──► WorkerActor::run(runtime_token.child_token(), kill_token)
//!
//! Event flow:
//!   WorkerActor ── publish(Event) ──► Bus ──► subscriber_listener ──► SubscriberSet::emit
//!
//! Shutdown path (exactly once, however many callers):
//!   shutdown(timeout)
//!     └─► restarts off, Bus.publish(ShutdownRequested)
//!     └─► runtime_token.cancel()  → every actor sends Shutdown to its worker
//!     └─► close the slot tracker, wait for all actors up to `timeout`
//!            (the JoinSet lock is never held while waiting)
//!            ├─ all joined  → AllStoppedWithin, Ok(())
//!            └─ timeout     → GraceExceeded, kill_token.cancel(),
//!                             Err(RuntimeError::GraceExceeded { stuck })
//! ```
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use hubvisor::{CommandSpawner, LogWriter, Supervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let spawner = Arc::new(CommandSpawner::current_exe()?);
//!     let sup = Supervisor::new(SupervisorConfig::default(), spawner, vec![Arc::new(LogWriter::new())]);
//!     sup.run_until_signal().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cluster::actor::WorkerActor;
use crate::cluster::shutdown::wait_for_shutdown_signal;
use crate::cluster::status::WorkerTable;
use crate::cluster::{ClusterStatus, Spawn, SupervisorConfig, WorkerRecord};
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::subscribers::{Subscribe, SubscriberSet};

/// Grace given to actors to reap force-killed workers.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Process supervisor for a pool of worker slots.
pub struct Supervisor {
    cfg: Arc<SupervisorConfig>,
    bus: Bus,
    subs: Arc<SubscriberSet>,
    spawner: Arc<dyn Spawn>,
    table: Arc<WorkerTable>,
    runtime_token: CancellationToken,
    kill_token: CancellationToken,
    restarts_enabled: Arc<AtomicBool>,
    actors: Mutex<JoinSet<()>>,
    slots: TaskTracker,
    started: AtomicBool,
    shutdown: OnceCell<Result<(), RuntimeError>>,
}

impl Supervisor {
    /// Creates a supervisor and starts delivering events to `subscribers`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        cfg: SupervisorConfig,
        spawner: Arc<dyn Spawn>,
        subscribers: Vec<Arc<dyn Subscribe>>,
    ) -> Self {
        let bus = Bus::new(cfg.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new(subscribers, bus.clone()));
        let sup = Self {
            cfg: Arc::new(cfg),
            bus,
            subs,
            spawner,
            table: Arc::new(WorkerTable::default()),
            runtime_token: CancellationToken::new(),
            kill_token: CancellationToken::new(),
            restarts_enabled: Arc::new(AtomicBool::new(true)),
            actors: Mutex::new(JoinSet::new()),
            slots: TaskTracker::new(),
            started: AtomicBool::new(false),
            shutdown: OnceCell::new(),
        };
        sup.subscriber_listener();
        sup
    }

    /// Event bus shared with every worker actor.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Configuration in use.
    pub fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }

    /// True once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.runtime_token.is_cancelled()
    }

    /// Forks `worker_count` slots sequentially, `fork_delay` apart.
    ///
    /// Returns as soon as every slot has been forked; readiness is tracked by
    /// each slot's actor.
    pub async fn start(&self, worker_count: usize) -> Result<(), RuntimeError> {
        if self.runtime_token.is_cancelled() {
            return Err(RuntimeError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyStarted);
        }
        tracing::info!(workers = worker_count, "starting cluster");

        for i in 0..worker_count {
            if i > 0 && !self.cfg.fork_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.cfg.fork_delay) => {}
                    _ = self.runtime_token.cancelled() => return Err(RuntimeError::ShuttingDown),
                }
            }

            let id = format!("worker-{i}");
            self.table.insert(&id).await;
            let actor = WorkerActor {
                id: Arc::from(id.as_str()),
                spawner: Arc::clone(&self.spawner),
                config: Arc::clone(&self.cfg),
                bus: self.bus.clone(),
                table: Arc::clone(&self.table),
                restarts_enabled: Arc::clone(&self.restarts_enabled),
            };

            let mut set = self.actors.lock().await;
            if self.runtime_token.is_cancelled() {
                return Err(RuntimeError::ShuttingDown);
            }
            set.spawn(
                self.slots
                    .track_future(actor.run(self.runtime_token.child_token(), self.kill_token.clone())),
            );
        }
        self.slots.close();
        Ok(())
    }

    /// Stops every worker: no more restarts, `Shutdown` to each live worker,
    /// force-kill after `timeout`.
    ///
    /// Concurrent and repeated calls share one shutdown sequence and all
    /// observe its result.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), RuntimeError> {
        self.shutdown
            .get_or_init(|| self.shutdown_once(timeout))
            .await
            .clone()
    }

    /// Starts `config.worker_count()` slots and runs until an OS termination
    /// signal arrives (or every slot has ended), then shuts down with
    /// `config.shutdown_timeout`.
    pub async fn run_until_signal(&self) -> Result<(), RuntimeError> {
        self.start(self.cfg.worker_count()).await?;

        tokio::select! {
            res = wait_for_shutdown_signal() => match res {
                Ok(sig) => tracing::info!(signal = sig.as_str(), "termination signal received"),
                Err(e) => {
                    tracing::error!(error = %e, "cannot listen for signals; running until all slots end");
                    self.wait_slots().await;
                }
            },
            _ = self.wait_slots() => tracing::info!("all worker slots ended"),
        }
        self.shutdown(self.cfg.shutdown_timeout).await
    }

    /// Aggregate status of every slot.
    pub async fn cluster_status(&self) -> ClusterStatus {
        self.table.status().await
    }

    /// Record of one slot.
    pub async fn worker(&self, id: &str) -> Option<WorkerRecord> {
        self.table.get(id).await
    }

    async fn shutdown_once(&self, timeout: Duration) -> Result<(), RuntimeError> {
        tracing::info!(timeout_ms = timeout.as_millis() as u64, "shutting down cluster");
        self.restarts_enabled.store(false, Ordering::SeqCst);
        self.bus.publish(Event::new(EventKind::ShutdownRequested));
        self.runtime_token.cancel();
        self.slots.close();

        if tokio::time::timeout(timeout, self.slots.wait()).await.is_ok() {
            self.reap().await;
            self.bus.publish(Event::new(EventKind::AllStoppedWithin));
            return Ok(());
        }

        let stuck = self.table.live_ids().await;
        self.bus.publish(
            Event::new(EventKind::GraceExceeded)
                .with_reason(stuck.join(","))
                .with_timeout(timeout),
        );
        self.kill_token.cancel();
        if tokio::time::timeout(KILL_WAIT, self.slots.wait()).await.is_err() {
            tracing::error!("worker actors did not finish after force kill");
            self.actors.lock().await.abort_all();
        }
        self.reap().await;
        Err(RuntimeError::GraceExceeded {
            grace: timeout,
            stuck,
        })
    }

    /// Completes once `start` has finished forking and every actor has ended.
    async fn wait_slots(&self) {
        self.slots.wait().await;
    }

    /// Collects finished actors, logging panics. Only called once every
    /// tracked actor has ended (or been aborted), so the lock is short-lived.
    async fn reap(&self) {
        let mut set = self.actors.lock().await;
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    tracing::error!(error = %e, "worker actor panicked");
                }
            }
        }
    }

    /// Subscribes to the bus and forwards events to the subscriber set (fire-and-forget).
    fn subscriber_listener(&self) {
        let mut rx = self.bus.subscribe();
        let set = Arc::clone(&self.subs);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => set.emit(&ev),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "subscriber listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WorkerStatus;
    use crate::cluster::testing::{Behavior, FakeSpawner};

    fn cfg() -> SupervisorConfig {
        SupervisorConfig {
            worker_count: 2,
            max_restarts: 2,
            restart_delay: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(3),
            fork_delay: Duration::from_millis(100),
            ..SupervisorConfig::default()
        }
    }

    fn kinds(rx: &mut broadcast::Receiver<Event>) -> Vec<EventKind> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev.kind);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_graceful_shutdown() {
        let spawner = Arc::new(FakeSpawner::new(|_, _| Behavior::Serve));
        let sup = Supervisor::new(cfg(), spawner.clone(), vec![]);
        let mut rx = sup.bus().subscribe();

        sup.start(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let st = sup.cluster_status().await;
        assert_eq!((st.total, st.running, st.failed), (2, 2, 0));
        assert!(st.workers.iter().all(|w| w.pid.is_some()));

        sup.shutdown(Duration::from_secs(3)).await.unwrap();
        let st = sup.cluster_status().await;
        assert!(st.workers.iter().all(|w| w.status == WorkerStatus::Stopped));
        assert_eq!(spawner.shutdown_acks(), 2);

        let seen = kinds(&mut rx);
        assert_eq!(seen.iter().filter(|k| **k == EventKind::WorkerReady).count(), 2);
        assert!(seen.contains(&EventKind::AllStoppedWithin));
        assert!(!seen.contains(&EventKind::RestartScheduled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_loop_retires_slot() {
        let spawner = Arc::new(FakeSpawner::new(|_, _| Behavior::CrashAfter(Duration::from_millis(10), 1)));
        let sup = Supervisor::new(cfg(), spawner.clone(), vec![]);
        let mut rx = sup.bus().subscribe();

        sup.start(1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let w = sup.worker("worker-0").await.unwrap();
        assert_eq!(w.status, WorkerStatus::Failed);
        assert_eq!(w.restart_count, 2);
        assert_eq!(spawner.forks("worker-0"), 3);
        assert_eq!(sup.cluster_status().await.failed, 1);

        let seen = kinds(&mut rx);
        assert_eq!(seen.iter().filter(|k| **k == EventKind::RestartScheduled).count(), 2);
        assert!(seen.contains(&EventKind::WorkerRetired));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(spawner.forks("worker-0"), 3);
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failures_consume_restart_budget() {
        let spawner = Arc::new(FakeSpawner::new(|_, _| Behavior::FailSpawn));
        let sup = Supervisor::new(cfg(), spawner.clone(), vec![]);
        sup.start(1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let w = sup.worker("worker-0").await.unwrap();
        assert_eq!(w.status, WorkerStatus::Failed);
        assert_eq!(w.pid, None);
        assert_eq!(spawner.forks("worker-0"), 3);
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_delay_spaces_forks() {
        let spawner = Arc::new(FakeSpawner::new(|_, _| Behavior::CrashAfter(Duration::from_millis(10), 1)));
        let sup = Supervisor::new(cfg(), spawner.clone(), vec![]);
        sup.start(1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(spawner.forks("worker-0"), 1);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(spawner.forks("worker-0"), 2);
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_timeout_counts_as_failure() {
        let spawner = Arc::new(FakeSpawner::new(|_, fork| {
            if fork == 1 { Behavior::NeverReady } else { Behavior::Serve }
        }));
        let sup = Supervisor::new(cfg(), spawner.clone(), vec![]);
        let mut rx = sup.bus().subscribe();
        sup.start(1).await.unwrap();

        tokio::time::sleep(Duration::from_secs(7)).await;
        let w = sup.worker("worker-0").await.unwrap();
        assert_eq!(w.status, WorkerStatus::Running);
        assert_eq!(w.restart_count, 1);
        assert_eq!(spawner.kills(), 1);
        assert!(kinds(&mut rx).contains(&EventKind::WorkerStartupFailed));
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_not_restarted_on_failure_policy() {
        let spawner = Arc::new(FakeSpawner::new(|_, _| Behavior::CrashAfter(Duration::from_millis(10), 0)));
        let sup = Supervisor::new(
            SupervisorConfig {
                restart: crate::policies::RestartPolicy::OnFailure,
                ..cfg()
            },
            spawner.clone(),
            vec![],
        );
        sup.start(1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let w = sup.worker("worker-0").await.unwrap();
        assert_eq!(w.status, WorkerStatus::Stopped);
        assert_eq!(spawner.forks("worker-0"), 1);
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_shutdown_runs_once() {
        let spawner = Arc::new(FakeSpawner::new(|_, _| Behavior::Serve));
        let sup = Supervisor::new(cfg(), spawner.clone(), vec![]);
        let mut rx = sup.bus().subscribe();
        sup.start(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (a, b) = tokio::join!(
            sup.shutdown(Duration::from_secs(3)),
            sup.shutdown(Duration::from_secs(3))
        );
        assert_eq!(a, Ok(()));
        assert_eq!(b, Ok(()));
        assert_eq!(sup.shutdown(Duration::from_secs(3)).await, Ok(()));

        let seen = kinds(&mut rx);
        assert_eq!(seen.iter().filter(|k| **k == EventKind::ShutdownRequested).count(), 1);
        assert_eq!(seen.iter().filter(|k| **k == EventKind::AllStoppedWithin).count(), 1);
        assert_eq!(spawner.shutdown_acks(), 2);
        assert_eq!(sup.start(1).await, Err(RuntimeError::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_worker_is_force_killed() {
        let spawner = Arc::new(FakeSpawner::new(|_, _| Behavior::IgnoreShutdown));
        let sup = Supervisor::new(cfg(), spawner.clone(), vec![]);
        let mut rx = sup.bus().subscribe();
        sup.start(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = sup.shutdown(Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(
            err,
            RuntimeError::GraceExceeded {
                grace: Duration::from_secs(2),
                stuck: vec!["worker-0".to_string()],
            }
        );
        assert_eq!(spawner.kills(), 1);
        let seen = kinds(&mut rx);
        assert!(seen.contains(&EventKind::GraceExceeded));
        assert!(seen.contains(&EventKind::WorkerKilled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_api_shutdown_during_run_until_signal_kills_stragglers() {
        let spawner = Arc::new(FakeSpawner::new(|_, _| Behavior::IgnoreShutdown));
        let sup = Arc::new(Supervisor::new(cfg(), spawner.clone(), vec![]));
        let runner = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run_until_signal().await }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sup.cluster_status().await.running, 2);

        let res = tokio::time::timeout(Duration::from_secs(60), sup.shutdown(Duration::from_secs(2)))
            .await
            .expect("shutdown must finish while run_until_signal waits");
        let expected = RuntimeError::GraceExceeded {
            grace: Duration::from_secs(2),
            stuck: vec!["worker-0".to_string(), "worker-1".to_string()],
        };
        assert_eq!(res, Err(expected.clone()));
        assert_eq!(spawner.kills(), 2);

        let run_res = tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .expect("run_until_signal returns once slots end")
            .unwrap();
        assert_eq!(run_res, Err(expected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_signal_returns_when_all_slots_end() {
        let spawner = Arc::new(FakeSpawner::new(|_, _| Behavior::CrashAfter(Duration::from_millis(10), 0)));
        let sup = Supervisor::new(
            SupervisorConfig {
                restart: crate::policies::RestartPolicy::OnFailure,
                ..cfg()
            },
            spawner,
            vec![],
        );
        let res = tokio::time::timeout(Duration::from_secs(30), sup.run_until_signal()).await;
        assert_eq!(res, Ok(Ok(())));
        let st = sup.cluster_status().await;
        assert!(st.workers.iter().all(|w| w.status == WorkerStatus::Stopped));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let spawner = Arc::new(FakeSpawner::new(|_, _| Behavior::Serve));
        let sup = Supervisor::new(cfg(), spawner, vec![]);
        sup.start(0).await.unwrap();
        assert_eq!(sup.start(1).await, Err(RuntimeError::AlreadyStarted));
        sup.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
