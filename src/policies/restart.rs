//! # Restart policies for worker slots.
//!
//! [`RestartPolicy`] determines whether a worker slot is re-forked after its
//! process exits.
//!
//! - [`RestartPolicy::Never`] the worker runs once; any exit ends the slot.
//! - [`RestartPolicy::OnFailure`] only a non-zero exit is restarted (default).
//! - [`RestartPolicy::Always`] every exit is restarted, clean ones included.
//!
//! ```text
//! exit code 0  ──► Never/OnFailure → slot stopped   Always → restart
//! exit code ≠0 ──► Never           → slot stopped   OnFailure/Always → restart
//! ```
//!
//! Restarts are still bounded by `SupervisorConfig::max_restarts` and spaced by
//! `SupervisorConfig::restart_delay`.

use serde::{Deserialize, Serialize};

/// Policy controlling whether a worker slot is restarted after its process exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Never restart.
    Never,
    /// Restart only after a failed exit (default).
    #[default]
    OnFailure,
    /// Restart after every exit.
    Always,
}

impl RestartPolicy {
    /// Returns true if an exit with the given outcome should be followed by a restart.
    pub fn should_restart(&self, clean_exit: bool) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => !clean_exit,
            RestartPolicy::Always => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_matrix() {
        assert!(!RestartPolicy::Never.should_restart(true));
        assert!(!RestartPolicy::Never.should_restart(false));
        assert!(!RestartPolicy::OnFailure.should_restart(true));
        assert!(RestartPolicy::OnFailure.should_restart(false));
        assert!(RestartPolicy::Always.should_restart(true));
        assert!(RestartPolicy::Always.should_restart(false));
    }
}
