//! Error types used by the hubvisor runtime.
//!
//! This module defines the error enums shared across the crate:
//!
//! - [`RuntimeError`]: errors raised by the process supervisor itself.
//! - [`WorkerError`]: failures while spawning or talking to a worker process.
//! - [`GatewayError`]: failures on the hub routing path (selection, failover, calls).
//! - [`StateError`]: transport-level failures of a shared-state backend.
//! - [`ConfigError`]: malformed configuration input.
//!
//! All types provide `as_label` for logs/metrics; routing errors additionally
//! expose [`GatewayError::is_retryable`] so the calling layer can pick a fallback.

use std::time::Duration;
use thiserror::Error;

use crate::resilience::{CallError, Classify, FailureKind};

/// # Errors produced by the supervisor runtime.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some workers had to be force-terminated.
    #[error("shutdown timeout {grace:?} exceeded; forced: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Workers that did not exit in time and were killed.
        stuck: Vec<String>,
    },

    /// `start` was called on a supervisor that already runs workers.
    #[error("supervisor already started")]
    AlreadyStarted,

    /// `start` was called after shutdown began.
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use hubvisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
            RuntimeError::AlreadyStarted => "runtime_already_started",
            RuntimeError::ShuttingDown => "runtime_shutting_down",
        }
    }
}

/// # Errors produced while managing a worker process.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The OS refused to spawn the process.
    #[error("spawn failed: {0}")]
    Spawn(#[source] std::io::Error),

    /// IO on the control channel or while waiting on the process failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker did not send `Ready` within the startup timeout.
    #[error("worker not ready after {timeout:?}")]
    StartupTimeout {
        /// The configured startup timeout.
        timeout: Duration,
    },

    /// The worker exited before it signalled readiness.
    #[error("worker exited during startup (code {code:?})")]
    ExitedDuringStartup {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },

    /// The control channel to the worker is closed.
    #[error("control channel closed")]
    ChannelClosed,
}

impl WorkerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::Spawn(_) => "worker_spawn_failed",
            WorkerError::Io(_) => "worker_io",
            WorkerError::StartupTimeout { .. } => "worker_startup_timeout",
            WorkerError::ExitedDuringStartup { .. } => "worker_exited_during_startup",
            WorkerError::ChannelClosed => "worker_channel_closed",
        }
    }
}

/// # Errors produced on the hub routing path.
///
/// Mirrors the taxonomy of the routing layer:
/// - transient dependency errors (`Transport`, `Timeout`) are retryable;
/// - resource exhaustion (`NoAvailableHubs`) is terminal for the request;
/// - invariant violations (`DuplicateHub`, `LastPrimaryHub`) are rejected at the call site.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No hub passed the eligibility filter.
    #[error("no available hubs")]
    NoAvailableHubs,

    /// A hub with the same id is already registered.
    #[error("hub '{0}' already exists")]
    DuplicateHub(String),

    /// Removing the hub would leave the cluster without a primary.
    #[error("cannot remove '{0}': it is the last primary hub")]
    LastPrimaryHub(String),

    /// The referenced hub is not registered.
    #[error("unknown hub '{0}'")]
    UnknownHub(String),

    /// Failover could not be completed; reselect instead of trusting the target.
    #[error("failover {source_hub} -> {target_hub} failed: {reason}")]
    FailoverFailed {
        /// Hub traffic was moving away from.
        source_hub: String,
        /// Hub traffic was moving to.
        target_hub: String,
        /// Why the failover was rejected.
        reason: String,
    },

    /// The hub's circuit breaker rejected the call.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// The call exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The call to the hub failed in transit.
    #[error("transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            GatewayError::NoAvailableHubs => "gateway_no_available_hubs",
            GatewayError::DuplicateHub(_) => "gateway_duplicate_hub",
            GatewayError::LastPrimaryHub(_) => "gateway_last_primary_hub",
            GatewayError::UnknownHub(_) => "gateway_unknown_hub",
            GatewayError::FailoverFailed { .. } => "gateway_failover_failed",
            GatewayError::CircuitOpen(_) => "gateway_circuit_open",
            GatewayError::Timeout(_) => "gateway_timeout",
            GatewayError::Transport(_) => "gateway_transport",
        }
    }

    /// Indicates whether the caller may retry the request later.
    ///
    /// # Example
    /// ```
    /// use hubvisor::GatewayError;
    ///
    /// assert!(GatewayError::Transport("reset".into()).is_retryable());
    /// assert!(!GatewayError::NoAvailableHubs.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_) | GatewayError::Timeout(_) | GatewayError::CircuitOpen(_)
        )
    }
}

impl Classify for GatewayError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            GatewayError::Timeout(_) => FailureKind::Timeout,
            GatewayError::Transport(msg) => FailureKind::from_message(msg),
            GatewayError::CircuitOpen(_) | GatewayError::NoAvailableHubs => {
                FailureKind::Unavailable
            }
            _ => FailureKind::Other,
        }
    }
}

impl From<CallError<GatewayError>> for GatewayError {
    fn from(e: CallError<GatewayError>) -> Self {
        match e {
            CallError::Open { name, .. } => GatewayError::CircuitOpen(name.to_string()),
            CallError::Timeout(d) => GatewayError::Timeout(d),
            CallError::Inner(e) => e,
        }
    }
}

/// # Transport-level failures of a shared-state backend.
///
/// The [`SharedState`](crate::state::SharedState) facade never surfaces these to
/// callers; it logs them and reports "unavailable" instead.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The backend cannot be reached.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The connection URL names a scheme no backend handles.
    #[error("unsupported backend url '{0}'")]
    UnsupportedUrl(String),

    /// A value could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(String),
}

impl StateError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StateError::Unreachable(_) => "state_unreachable",
            StateError::UnsupportedUrl(_) => "state_unsupported_url",
            StateError::Codec(_) => "state_codec",
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Codec(e.to_string())
    }
}

impl From<redis::RedisError> for StateError {
    fn from(e: redis::RedisError) -> Self {
        match e.kind() {
            redis::ErrorKind::TypeError => StateError::Codec(e.to_string()),
            _ => StateError::Unreachable(e.to_string()),
        }
    }
}

/// # Malformed configuration input.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable holds a value that does not parse.
    #[error("invalid value '{value}' for {key}")]
    Invalid {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
    },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Invalid { .. } => "config_invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_retryability() {
        assert!(GatewayError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(GatewayError::CircuitOpen("hub-a".into()).is_retryable());
        assert!(!GatewayError::LastPrimaryHub("hub-a".into()).is_retryable());
        assert!(!GatewayError::DuplicateHub("hub-a".into()).is_retryable());
    }

    #[test]
    fn test_gateway_classification() {
        assert_eq!(
            GatewayError::Transport("connection reset by peer".into()).failure_kind(),
            FailureKind::ConnectionReset
        );
        assert_eq!(
            GatewayError::Timeout(Duration::from_millis(10)).failure_kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            GatewayError::UnknownHub("x".into()).failure_kind(),
            FailureKind::Other
        );
    }

    #[test]
    fn test_breaker_errors_map_to_gateway_errors() {
        let open: CallError<GatewayError> = CallError::Open {
            name: "hub:a".into(),
            state: crate::resilience::BreakerState::Open,
            retry_in: Duration::from_secs(3),
        };
        assert_eq!(GatewayError::from(open), GatewayError::CircuitOpen("hub:a".into()));
        assert_eq!(
            GatewayError::from(CallError::Timeout(Duration::from_secs(2))),
            GatewayError::Timeout(Duration::from_secs(2))
        );
        assert_eq!(
            GatewayError::from(CallError::Inner(GatewayError::NoAvailableHubs)),
            GatewayError::NoAvailableHubs
        );
    }

    #[test]
    fn test_labels_are_stable() {
        assert_eq!(RuntimeError::AlreadyStarted.as_label(), "runtime_already_started");
        assert_eq!(
            WorkerError::StartupTimeout { timeout: Duration::from_secs(1) }.as_label(),
            "worker_startup_timeout"
        );
        assert_eq!(
            StateError::Unreachable("down".into()).as_label(),
            "state_unreachable"
        );
    }
}
