//! # WorkerActor: supervises one worker slot.
//!
//! ## Event flow
//! ```text
//! loop {
//!   ├─► spawn() ──► WorkerForked{pid, attempt}
//!   ├─► wait Ready (startup_timeout) ─┬─ Ready   ──► WorkerReady
//!   │                                 └─ timeout ──► kill, WorkerStartupFailed
//!   ├─► serve: heartbeats ──► WorkerHeartbeat
//!   │          exit       ──► WorkerExited{code}
//!   │          cancelled  ──► send Shutdown ─┬─ exit       ──► WorkerExited
//!   │                                        └─ kill token ──► kill, WorkerKilled
//!   └─► restart decision
//!         ├─ shutting down / auto_restart off / policy says no ──► WorkerStopped
//!         ├─ restart_count == max_restarts ──► Failed, WorkerRetired
//!         └─ RestartScheduled{attempt, delay} ──► sleep(delay) ──► loop
//! }
//! ```
//!
//! ## Rules
//! - Forks of one slot are strictly sequential.
//! - A startup failure consumes a restart like any failed exit.
//! - `delay` is whatever remains of `restart_delay` since the previous fork.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cluster::status::WorkerTable;
use crate::cluster::{ChildProcess, ControlMessage, Spawn, SpawnedWorker, SupervisorConfig, WorkerStatus};
use crate::error::WorkerError;
use crate::events::{Bus, Event, EventKind};

/// How one fork of the slot ended.
enum Attempt {
    /// The process exited on its own.
    Exited { code: Option<i32> },
    /// The process never became ready.
    StartupFailed { reason: String },
    /// The runtime was cancelled and the process was stopped.
    Shutdown,
}

pub(crate) struct WorkerActor {
    pub(crate) id: Arc<str>,
    pub(crate) spawner: Arc<dyn Spawn>,
    pub(crate) config: Arc<SupervisorConfig>,
    pub(crate) bus: Bus,
    pub(crate) table: Arc<WorkerTable>,
    pub(crate) restarts_enabled: Arc<AtomicBool>,
}

impl WorkerActor {
    /// Runs the slot until it is stopped, retired, or the runtime is cancelled.
    ///
    /// `kill` is cancelled by the supervisor once the shutdown timeout is
    /// exceeded; a worker still running at that point is force-terminated.
    pub(crate) async fn run(self, runtime: CancellationToken, kill: CancellationToken) {
        let mut restarts: u32 = 0;
        let mut attempt: u32 = 0;

        loop {
            if runtime.is_cancelled() {
                break;
            }
            attempt += 1;
            let forked_at = Instant::now();
            let outcome = self.run_once(attempt, &runtime, &kill).await;

            let (clean, reason) = match outcome {
                Attempt::Shutdown => break,
                Attempt::Exited { code } => (
                    code == Some(0),
                    match code {
                        Some(c) => format!("exit code {c}"),
                        None => "terminated by signal".to_string(),
                    },
                ),
                Attempt::StartupFailed { reason } => (false, reason),
            };

            if runtime.is_cancelled()
                || !self.config.auto_restart
                || !self.restarts_enabled.load(Ordering::SeqCst)
                || !self.config.restart.should_restart(clean)
            {
                break;
            }

            if restarts >= self.config.max_restarts {
                self.table
                    .update(&self.id, |r| {
                        r.status = WorkerStatus::Failed;
                        r.pid = None;
                    })
                    .await;
                tracing::error!(
                    worker = %self.id,
                    restarts,
                    max_restarts = self.config.max_restarts,
                    %reason,
                    "worker exceeded restart budget; slot retired"
                );
                self.bus.publish(
                    Event::new(EventKind::WorkerRetired)
                        .with_subject(Arc::clone(&self.id))
                        .with_attempt(restarts)
                        .with_reason(reason),
                );
                return;
            }

            restarts += 1;
            let delay = self.config.restart_delay.saturating_sub(forked_at.elapsed());
            let now = Instant::now();
            self.table
                .update(&self.id, |r| {
                    r.status = WorkerStatus::Starting;
                    r.pid = None;
                    r.restart_count = restarts;
                    r.last_restart_time = Some(now);
                })
                .await;
            self.bus.publish(
                Event::new(EventKind::RestartScheduled)
                    .with_subject(Arc::clone(&self.id))
                    .with_attempt(restarts)
                    .with_delay(delay)
                    .with_reason(reason),
            );

            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = runtime.cancelled() => break,
                }
            }
        }

        self.table
            .update(&self.id, |r| {
                r.status = WorkerStatus::Stopped;
                r.pid = None;
                r.active_connections = 0;
            })
            .await;
        self.bus
            .publish(Event::new(EventKind::WorkerStopped).with_subject(Arc::clone(&self.id)));
    }

    async fn run_once(
        &self,
        attempt: u32,
        runtime: &CancellationToken,
        kill: &CancellationToken,
    ) -> Attempt {
        let SpawnedWorker {
            pid,
            mut child,
            outbox,
            mut inbox,
        } = match self.spawner.spawn(&self.id).await {
            Ok(w) => w,
            Err(e) => return self.startup_failed(e, None),
        };

        self.table
            .update(&self.id, |r| {
                r.status = WorkerStatus::Starting;
                r.pid = pid;
                r.start_time = Some(Instant::now());
                r.active_connections = 0;
            })
            .await;
        self.bus.publish(
            Event::new(EventKind::WorkerForked)
                .with_subject(Arc::clone(&self.id))
                .with_pid(pid)
                .with_attempt(attempt),
        );

        // startup
        let timeout = self.config.startup_timeout;
        let ready = tokio::select! {
            r = tokio::time::timeout(timeout, wait_ready(&mut inbox)) => r,
            code = child.wait() => {
                let code = code.unwrap_or(None);
                self.publish_exit(pid, code);
                return self.startup_failed(WorkerError::ExitedDuringStartup { code }, None);
            }
            _ = runtime.cancelled() => {
                return self.stop(pid, &mut child, &outbox, &mut inbox, kill).await;
            }
        };
        match ready {
            Ok(true) => {}
            Ok(false) => {
                let code = child.wait().await.unwrap_or(None);
                self.publish_exit(pid, code);
                return self.startup_failed(WorkerError::ExitedDuringStartup { code }, None);
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(worker = %self.id, error = %e, "failed to kill unready worker");
                }
                return self.startup_failed(WorkerError::StartupTimeout { timeout }, Some(timeout));
            }
        }

        self.table
            .update(&self.id, |r| r.status = WorkerStatus::Running)
            .await;
        self.bus.publish(
            Event::new(EventKind::WorkerReady)
                .with_subject(Arc::clone(&self.id))
                .with_pid(pid),
        );

        // serve
        let mut inbox_open = true;
        loop {
            tokio::select! {
                code = child.wait() => {
                    let code = code.unwrap_or(None);
                    self.publish_exit(pid, code);
                    return Attempt::Exited { code };
                }
                msg = inbox.recv(), if inbox_open => match msg {
                    Some(ControlMessage::Heartbeat { active_connections }) => {
                        self.table
                            .update(&self.id, |r| r.active_connections = active_connections)
                            .await;
                        self.bus.publish(
                            Event::new(EventKind::WorkerHeartbeat)
                                .with_subject(Arc::clone(&self.id))
                                .with_pid(pid)
                                .with_connections(active_connections),
                        );
                    }
                    Some(other) => {
                        tracing::debug!(worker = %self.id, ?other, "unexpected control message");
                    }
                    None => inbox_open = false,
                },
                _ = runtime.cancelled() => {
                    return self.stop(pid, &mut child, &outbox, &mut inbox, kill).await;
                }
            }
        }
    }

    /// Asks the worker to shut down; force-kills it once `kill` fires.
    async fn stop(
        &self,
        pid: Option<u32>,
        child: &mut Box<dyn ChildProcess>,
        outbox: &mpsc::Sender<ControlMessage>,
        inbox: &mut mpsc::Receiver<ControlMessage>,
        kill: &CancellationToken,
    ) -> Attempt {
        self.table
            .update(&self.id, |r| r.status = WorkerStatus::Stopping)
            .await;
        if outbox.send(ControlMessage::Shutdown).await.is_err() {
            tracing::debug!(worker = %self.id, "control channel closed before shutdown");
        }

        let mut inbox_open = true;
        loop {
            tokio::select! {
                code = child.wait() => {
                    self.publish_exit(pid, code.unwrap_or(None));
                    return Attempt::Shutdown;
                }
                msg = inbox.recv(), if inbox_open => match msg {
                    Some(ControlMessage::ShutdownComplete) => {
                        tracing::debug!(worker = %self.id, "worker drained");
                    }
                    Some(_) => {}
                    None => inbox_open = false,
                },
                _ = kill.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(worker = %self.id, error = %e, "force kill failed");
                    }
                    self.bus.publish(
                        Event::new(EventKind::WorkerKilled)
                            .with_subject(Arc::clone(&self.id))
                            .with_pid(pid),
                    );
                    return Attempt::Shutdown;
                }
            }
        }
    }

    fn startup_failed(&self, err: WorkerError, timeout: Option<Duration>) -> Attempt {
        tracing::warn!(worker = %self.id, error = %err, label = err.as_label(), "worker startup failed");
        let mut ev = Event::new(EventKind::WorkerStartupFailed)
            .with_subject(Arc::clone(&self.id))
            .with_reason(err.to_string());
        if let Some(t) = timeout {
            ev = ev.with_timeout(t);
        }
        self.bus.publish(ev);
        Attempt::StartupFailed {
            reason: err.to_string(),
        }
    }

    fn publish_exit(&self, pid: Option<u32>, code: Option<i32>) {
        self.bus.publish(
            Event::new(EventKind::WorkerExited)
                .with_subject(Arc::clone(&self.id))
                .with_pid(pid)
                .with_exit_code(code),
        );
    }
}

/// Resolves to `true` on `Ready`, `false` if the channel closes first.
async fn wait_ready(inbox: &mut mpsc::Receiver<ControlMessage>) -> bool {
    while let Some(msg) = inbox.recv().await {
        if msg == ControlMessage::Ready {
            return true;
        }
    }
    false
}
