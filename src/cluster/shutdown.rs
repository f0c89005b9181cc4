//! Termination signals that start a graceful cluster shutdown.
//!
//! On unix the supervisor reacts to `SIGINT`, `SIGTERM` and `SIGQUIT`;
//! elsewhere only Ctrl-C is available.

/// Which signal ended [`wait_for_shutdown_signal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// `SIGINT` / Ctrl-C.
    Interrupt,
    /// `SIGTERM`, the usual request from a service manager.
    Terminate,
    /// `SIGQUIT`.
    Quit,
}

impl ShutdownSignal {
    /// Conventional signal name, for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Quit => "SIGQUIT",
        }
    }
}

/// Waits for the first termination signal.
///
/// All listeners are installed before waiting; failing to install any of them
/// is returned as `Err` so the caller can pick another way to stop.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<ShutdownSignal> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let received = tokio::select! {
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
        _ = terminate.recv() => ShutdownSignal::Terminate,
        _ = quit.recv() => ShutdownSignal::Quit,
    };
    Ok(received)
}

/// Waits for Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}
