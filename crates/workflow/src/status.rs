//! Lifecycle status shared by applications and integrations.

use serde::{Deserialize, Serialize};

/// Execution status of an application or integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecStatus {
    /// Not registered.
    None,
    /// Registered but not running.
    Stopped,
    Running,
    /// Running, but unavailable because of errors.
    Error,
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}
