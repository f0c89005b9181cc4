//! # Failure classification for retry decisions.
//!
//! Retry presets decide by error *category*, not by concrete error type.
//! Error types opt in by implementing [`Classify`]; free-form messages (from
//! downstream servers or drivers) go through [`FailureKind::from_message`].

use serde::{Deserialize, Serialize};

/// Broad category of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Peer reset or aborted the connection.
    ConnectionReset,
    /// Peer refused the connection.
    ConnectionRefused,
    /// The call or connect exceeded its deadline.
    Timeout,
    /// A database transaction was chosen as deadlock victim.
    Deadlock,
    /// Credentials expired and must be refreshed.
    TokenExpired,
    /// The dependency reported itself unavailable.
    Unavailable,
    /// Anything else.
    Other,
}

impl FailureKind {
    /// Classifies a free-form error message.
    ///
    /// # Example
    /// ```
    /// use hubvisor::FailureKind;
    ///
    /// assert_eq!(FailureKind::from_message("read ECONNRESET"), FailureKind::ConnectionReset);
    /// assert_eq!(FailureKind::from_message("Deadlock found when trying to get lock"), FailureKind::Deadlock);
    /// assert_eq!(FailureKind::from_message("jwt expired"), FailureKind::TokenExpired);
    /// ```
    pub fn from_message(msg: &str) -> Self {
        let m = msg.to_ascii_lowercase();
        if m.contains("econnreset") || m.contains("connection reset") || m.contains("broken pipe") {
            FailureKind::ConnectionReset
        } else if m.contains("econnrefused") || m.contains("connection refused") {
            FailureKind::ConnectionRefused
        } else if m.contains("timeout") || m.contains("timed out") || m.contains("etimedout") {
            FailureKind::Timeout
        } else if m.contains("deadlock") {
            FailureKind::Deadlock
        } else if (m.contains("token") || m.contains("jwt") || m.contains("session"))
            && m.contains("expired")
        {
            FailureKind::TokenExpired
        } else if m.contains("unavailable") || m.contains("503") {
            FailureKind::Unavailable
        } else {
            FailureKind::Other
        }
    }
}

/// Maps an error value to its [`FailureKind`].
pub trait Classify {
    /// Returns the failure category of this error.
    fn failure_kind(&self) -> FailureKind;
}

impl Classify for std::io::Error {
    fn failure_kind(&self) -> FailureKind {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                FailureKind::ConnectionReset
            }
            ErrorKind::ConnectionRefused => FailureKind::ConnectionRefused,
            ErrorKind::TimedOut => FailureKind::Timeout,
            _ => FailureKind::from_message(&self.to_string()),
        }
    }
}

impl Classify for String {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::from_message(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kinds() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let timeout = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(reset.failure_kind(), FailureKind::ConnectionReset);
        assert_eq!(refused.failure_kind(), FailureKind::ConnectionRefused);
        assert_eq!(timeout.failure_kind(), FailureKind::Timeout);
    }

    #[test]
    fn test_messages() {
        assert_eq!(FailureKind::from_message("socket hang up: connection reset by peer"), FailureKind::ConnectionReset);
        assert_eq!(FailureKind::from_message("connect ECONNREFUSED 127.0.0.1:6379"), FailureKind::ConnectionRefused);
        assert_eq!(FailureKind::from_message("operation timed out"), FailureKind::Timeout);
        assert_eq!(FailureKind::from_message("access token expired"), FailureKind::TokenExpired);
        assert_eq!(FailureKind::from_message("503 Service Unavailable"), FailureKind::Unavailable);
        assert_eq!(FailureKind::from_message("invalid argument"), FailureKind::Other);
    }
}
