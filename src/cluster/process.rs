//! # Worker process spawning.
//!
//! [`Spawn`] is the seam between the supervisor and the OS: the real
//! [`CommandSpawner`] runs a program with piped stdio, tests plug in fakes.
//!
//! ```text
//!  WorkerActor ── outbox ──► writer task ──► child stdin   (JSON lines)
//!  WorkerActor ◄── inbox ─── reader task ◄── child stdout  (JSON lines)
//!                                            child stderr ──► inherited
//! ```

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::cluster::{ControlMessage, WORKER_ID_ENV};
use crate::error::WorkerError;

const CONTROL_QUEUE: usize = 64;

/// Handle to a running worker process.
#[async_trait]
pub trait ChildProcess: Send + 'static {
    /// Waits for exit; `None` when terminated by a signal. Must be cancel-safe.
    async fn wait(&mut self) -> Result<Option<i32>, WorkerError>;

    /// Force-terminates the process and reaps it.
    async fn kill(&mut self) -> Result<(), WorkerError>;
}

/// A freshly spawned worker and its control channel.
pub struct SpawnedWorker {
    /// OS process id, if known.
    pub pid: Option<u32>,
    /// Process handle.
    pub child: Box<dyn ChildProcess>,
    /// Messages to the worker.
    pub outbox: mpsc::Sender<ControlMessage>,
    /// Messages from the worker. Closes when the worker's stdout closes.
    pub inbox: mpsc::Receiver<ControlMessage>,
}

/// Produces worker processes for the supervisor.
#[async_trait]
pub trait Spawn: Send + Sync + 'static {
    /// Starts a process for slot `worker_id`.
    async fn spawn(&self, worker_id: &str) -> Result<SpawnedWorker, WorkerError>;
}

/// Spawns `program args…` with the slot id in [`WORKER_ID_ENV`].
#[derive(Clone, Debug)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    /// Spawner for `program` with no extra arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Spawner re-executing the current binary (the worker role is selected by
    /// [`WORKER_ID_ENV`]).
    pub fn current_exe() -> Result<Self, WorkerError> {
        Ok(Self::new(std::env::current_exe().map_err(WorkerError::Spawn)?))
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl Spawn for CommandSpawner {
    async fn spawn(&self, worker_id: &str) -> Result<SpawnedWorker, WorkerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ID_ENV, worker_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let stdin = child.stdin.take().ok_or(WorkerError::ChannelClosed)?;
        let stdout = child.stdout.take().ok_or(WorkerError::ChannelClosed)?;
        let pid = child.id();

        let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(CONTROL_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<ControlMessage>(CONTROL_QUEUE);

        let id = worker_id.to_string();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = out_rx.recv().await {
                let line = msg.to_line();
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    tracing::debug!(worker = %id, error = %e, "control write failed");
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let id = worker_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match ControlMessage::from_line(&line) {
                        Ok(msg) => {
                            if in_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => tracing::debug!(worker = %id, %line, "non-control output"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(worker = %id, error = %e, "control read failed");
                        break;
                    }
                }
            }
        });

        Ok(SpawnedWorker {
            pid,
            child: Box::new(OsChild(child)),
            outbox: out_tx,
            inbox: in_rx,
        })
    }
}

struct OsChild(Child);

#[async_trait]
impl ChildProcess for OsChild {
    async fn wait(&mut self) -> Result<Option<i32>, WorkerError> {
        Ok(self.0.wait().await?.code())
    }

    async fn kill(&mut self) -> Result<(), WorkerError> {
        Ok(self.0.kill().await?)
    }
}
