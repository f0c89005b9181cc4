//! # WorkerRuntime: the worker side of the control protocol.
//!
//! ```text
//!  start ──► send Ready
//!    loop ─┬─ heartbeat tick ──► send Heartbeat{in-flight}
//!          ├─ Shutdown / EOF ──► break
//!          └─ other line     ──► ignored
//!  stop accepting ──► drain in-flight (drain_timeout) ──► send ShutdownComplete ──► return
//! ```
//!
//! Work is submitted through a [`WorkerHandle`]; once shutdown begins the
//! handle refuses new work and long-running work can watch
//! [`WorkerHandle::shutdown_token`].

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cluster::{ControlMessage, WORKER_ID_ENV};
use crate::error::WorkerError;

/// Worker-side settings.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerConfig {
    /// Interval between heartbeats to the supervisor.
    pub heartbeat_interval: Duration,
    /// Longest wait for in-flight work after `Shutdown`.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(8),
        }
    }
}

/// Slot id handed down by the supervisor, if this process is a worker.
pub fn worker_id_from_env() -> Option<String> {
    std::env::var(WORKER_ID_ENV).ok().filter(|s| !s.is_empty())
}

/// Cloneable handle for submitting work to a running [`WorkerRuntime`].
#[derive(Clone)]
pub struct WorkerHandle {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl WorkerHandle {
    /// Runs `fut` as tracked in-flight work.
    ///
    /// Returns `None` once shutdown has begun; the work is not started.
    pub fn spawn<F>(&self, fut: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.is_accepting() {
            return None;
        }
        Some(self.tracker.spawn(fut))
    }

    /// False once `Shutdown` was received.
    pub fn is_accepting(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Number of in-flight tasks.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

/// Drives the control protocol over a reader/writer pair (stdin/stdout in production).
pub struct WorkerRuntime<R, W> {
    reader: R,
    writer: W,
    config: WorkerConfig,
    handle: WorkerHandle,
}

impl WorkerRuntime<tokio::io::Stdin, tokio::io::Stdout> {
    /// Runtime speaking over the process's stdin/stdout.
    ///
    /// Log output must then go to stderr.
    pub fn from_stdio(config: WorkerConfig) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), config)
    }
}

impl<R, W> WorkerRuntime<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Runtime over an arbitrary reader/writer pair.
    pub fn new(reader: R, writer: W, config: WorkerConfig) -> Self {
        Self {
            reader,
            writer,
            config,
            handle: WorkerHandle {
                tracker: TaskTracker::new(),
                token: CancellationToken::new(),
            },
        }
    }

    /// Handle for submitting work; clone freely.
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Announces readiness and serves until `Shutdown` (or the supervisor goes away),
    /// then drains in-flight work and acknowledges.
    pub async fn run(self) -> Result<(), WorkerError> {
        let Self {
            reader,
            mut writer,
            config,
            handle,
        } = self;

        send(&mut writer, &ControlMessage::Ready).await?;
        tracing::debug!("worker ready");

        let mut lines = BufReader::new(reader).lines();
        let mut tick = tokio::time::interval(config.heartbeat_interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => match ControlMessage::from_line(&line) {
                        Ok(ControlMessage::Shutdown) => {
                            tracing::info!("shutdown requested by supervisor");
                            break;
                        }
                        Ok(other) => tracing::debug!(?other, "ignoring control message"),
                        Err(_) => tracing::debug!(%line, "ignoring non-control input"),
                    },
                    None => {
                        tracing::warn!("control channel closed; shutting down");
                        break;
                    }
                },
                _ = tick.tick() => {
                    let active_connections = handle.in_flight() as u64;
                    send(&mut writer, &ControlMessage::Heartbeat { active_connections }).await?;
                }
            }
        }

        handle.token.cancel();
        handle.tracker.close();
        if tokio::time::timeout(config.drain_timeout, handle.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(in_flight = handle.in_flight(), "drain timeout exceeded");
        }

        // the supervisor may already be gone
        if let Err(e) = send(&mut writer, &ControlMessage::ShutdownComplete).await {
            tracing::debug!(error = %e, "shutdown ack not delivered");
        }
        Ok(())
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, msg: &ControlMessage) -> Result<(), WorkerError> {
    writer.write_all(msg.to_line().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

    struct SupervisorEnd {
        lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl SupervisorEnd {
        async fn recv(&mut self) -> ControlMessage {
            let line = self.lines.next_line().await.unwrap().unwrap();
            ControlMessage::from_line(&line).unwrap()
        }

        async fn send(&mut self, msg: ControlMessage) {
            self.writer.write_all(msg.to_line().as_bytes()).await.unwrap();
        }
    }

    fn pair(config: WorkerConfig) -> (SupervisorEnd, WorkerRuntime<tokio::io::ReadHalf<DuplexStream>, tokio::io::WriteHalf<DuplexStream>>) {
        let (sup_end, worker_end) = tokio::io::duplex(4096);
        let (sr, sw) = tokio::io::split(sup_end);
        let (wr, ww) = tokio::io::split(worker_end);
        (
            SupervisorEnd {
                lines: BufReader::new(sr).lines(),
                writer: sw,
            },
            WorkerRuntime::new(wr, ww, config),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_heartbeat_and_drain() {
        let (mut sup, rt) = pair(WorkerConfig {
            heartbeat_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(10),
        });
        let handle = rt.handle();
        let runner = tokio::spawn(rt.run());

        assert_eq!(sup.recv().await, ControlMessage::Ready);

        let job = handle
            .spawn(tokio::time::sleep(Duration::from_secs(3)))
            .unwrap();
        assert_eq!(
            sup.recv().await,
            ControlMessage::Heartbeat { active_connections: 1 }
        );

        sup.send(ControlMessage::Shutdown).await;
        assert_eq!(sup.recv().await, ControlMessage::ShutdownComplete);
        assert!(job.is_finished());
        assert!(handle.spawn(async {}).is_none());
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_bounds_shutdown() {
        let (mut sup, rt) = pair(WorkerConfig {
            heartbeat_interval: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(2),
        });
        let handle = rt.handle();
        let runner = tokio::spawn(rt.run());
        assert_eq!(sup.recv().await, ControlMessage::Ready);

        handle.spawn(std::future::pending::<()>()).unwrap();
        let started = tokio::time::Instant::now();
        sup.send(ControlMessage::Shutdown).await;
        assert_eq!(sup.recv().await, ControlMessage::ShutdownComplete);
        assert!(started.elapsed() >= Duration::from_secs(2));
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_eof_triggers_shutdown() {
        let (mut sup, rt) = pair(WorkerConfig::default());
        let runner = tokio::spawn(rt.run());
        assert_eq!(sup.recv().await, ControlMessage::Ready);

        sup.writer.shutdown().await.unwrap();
        assert_eq!(sup.recv().await, ControlMessage::ShutdownComplete);
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stdio_runtime_accepts_work() {
        let rt = WorkerRuntime::from_stdio(WorkerConfig::default());
        let handle = rt.handle();
        assert!(!handle.shutdown_token().is_cancelled());
        assert!(handle.spawn(async {}).is_some());
    }
}
