//! Supervisor ↔ worker control protocol.
//!
//! One JSON object per line over the worker's stdin (supervisor → worker) and
//! stdout (worker → supervisor):
//!
//! ```text
//! {"type":"ready"}
//! {"type":"heartbeat","active_connections":3}
//! {"type":"shutdown"}
//! {"type":"shutdown_complete"}
//! ```

use serde::{Deserialize, Serialize};

/// Environment variable carrying the slot id into a forked worker.
pub const WORKER_ID_ENV: &str = "HUBVISOR_WORKER_ID";

/// Control message exchanged between supervisor and worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Worker → supervisor: startup finished, serving.
    Ready,
    /// Supervisor → worker: stop accepting work, drain, exit.
    Shutdown,
    /// Worker → supervisor: periodic liveness report.
    Heartbeat {
        /// In-flight connections/requests.
        active_connections: u64,
    },
    /// Worker → supervisor: drained, about to exit.
    ShutdownComplete,
}

impl ControlMessage {
    /// Encodes as a single line, newline included.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }

    /// Decodes one line (surrounding whitespace ignored).
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(ControlMessage::Ready.to_line(), "{\"type\":\"ready\"}\n");
        assert_eq!(
            ControlMessage::from_line(" {\"type\":\"heartbeat\",\"active_connections\":3}\r\n").unwrap(),
            ControlMessage::Heartbeat { active_connections: 3 }
        );
        assert_eq!(
            ControlMessage::from_line("{\"type\":\"shutdown_complete\"}").unwrap(),
            ControlMessage::ShutdownComplete
        );
        assert!(ControlMessage::from_line("hello").is_err());
        assert!(ControlMessage::from_line("{\"type\":\"reboot\"}").is_err());
    }
}
