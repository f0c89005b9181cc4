//! In-process fake workers for supervisor tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::cluster::{ChildProcess, ControlMessage, Spawn, SpawnedWorker};
use crate::error::WorkerError;

/// Scripted behaviour of one fake process.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Behavior {
    /// Ready, then drains and exits 0 on `Shutdown`.
    Serve,
    /// Ready, then exits with the code after the delay.
    CrashAfter(Duration, i32),
    /// Never sends `Ready`; exits only when killed.
    NeverReady,
    /// Ready, ignores `Shutdown`; exits only when killed.
    IgnoreShutdown,
    /// Spawning fails.
    FailSpawn,
}

type Script = dyn Fn(&str, u32) -> Behavior + Send + Sync;

/// Spawner whose processes are tokio tasks following a [`Behavior`].
///
/// The script receives the slot id and the 1-based fork number of that slot.
pub(crate) struct FakeSpawner {
    script: Box<Script>,
    forks: Mutex<HashMap<String, u32>>,
    next_pid: AtomicU32,
    kills: Arc<AtomicU32>,
    acks: Arc<AtomicU32>,
}

impl FakeSpawner {
    pub(crate) fn new(script: impl Fn(&str, u32) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            forks: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1000),
            kills: Arc::new(AtomicU32::new(0)),
            acks: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Forks attempted for `id` (failed spawns included).
    pub(crate) fn forks(&self, id: &str) -> u32 {
        self.forks.lock().get(id).copied().unwrap_or(0)
    }

    /// Processes force-killed so far.
    pub(crate) fn kills(&self) -> u32 {
        self.kills.load(Ordering::SeqCst)
    }

    /// `Shutdown` messages acknowledged with `ShutdownComplete`.
    pub(crate) fn shutdown_acks(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Spawn for FakeSpawner {
    async fn spawn(&self, worker_id: &str) -> Result<SpawnedWorker, WorkerError> {
        let fork = {
            let mut forks = self.forks.lock();
            let n = forks.entry(worker_id.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let behavior = (self.script)(worker_id, fork);
        if let Behavior::FailSpawn = behavior {
            return Err(WorkerError::Spawn(std::io::Error::other("fake spawn failure")));
        }

        let (to_worker, mut from_sup) = mpsc::channel::<ControlMessage>(16);
        let (to_sup, from_worker) = mpsc::channel::<ControlMessage>(16);
        let (exit_tx, exit_rx) = watch::channel::<Option<Option<i32>>>(None);
        let exit_tx = Arc::new(exit_tx);
        let acks = Arc::clone(&self.acks);

        let proc_exit = Arc::clone(&exit_tx);
        let task = tokio::spawn(async move {
            let code = match behavior {
                Behavior::Serve => {
                    let _ = to_sup.send(ControlMessage::Ready).await;
                    loop {
                        match from_sup.recv().await {
                            Some(ControlMessage::Shutdown) => {
                                acks.fetch_add(1, Ordering::SeqCst);
                                let _ = to_sup.send(ControlMessage::ShutdownComplete).await;
                                break Some(0);
                            }
                            Some(_) => {}
                            None => break Some(0),
                        }
                    }
                }
                Behavior::CrashAfter(after, code) => {
                    let _ = to_sup.send(ControlMessage::Ready).await;
                    tokio::time::sleep(after).await;
                    Some(code)
                }
                Behavior::NeverReady | Behavior::IgnoreShutdown => {
                    if let Behavior::IgnoreShutdown = behavior {
                        let _ = to_sup.send(ControlMessage::Ready).await;
                    }
                    while from_sup.recv().await.is_some() {}
                    std::future::pending::<()>().await;
                    None
                }
                Behavior::FailSpawn => None,
            };
            let _ = proc_exit.send(Some(code));
        });

        Ok(SpawnedWorker {
            pid: Some(self.next_pid.fetch_add(1, Ordering::SeqCst)),
            child: Box::new(FakeChild {
                exit_rx,
                exit_tx,
                task,
                kills: Arc::clone(&self.kills),
            }),
            outbox: to_worker,
            inbox: from_worker,
        })
    }
}

struct FakeChild {
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    exit_tx: Arc<watch::Sender<Option<Option<i32>>>>,
    task: JoinHandle<()>,
    kills: Arc<AtomicU32>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    async fn wait(&mut self) -> Result<Option<i32>, WorkerError> {
        loop {
            if let Some(code) = *self.exit_rx.borrow_and_update() {
                return Ok(code);
            }
            if self.exit_rx.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn kill(&mut self) -> Result<(), WorkerError> {
        self.task.abort();
        self.kills.fetch_add(1, Ordering::SeqCst);
        let _ = self.exit_tx.send(Some(None));
        Ok(())
    }
}
