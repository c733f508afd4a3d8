//! Application-side connections.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a connection.
///
/// `None` → (create) → `Unconnected` ⇄ (connect / disconnect) `Connected`;
/// removal is only allowed while `Unconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Never created, or removed.
    None,
    Unconnected,
    Connected,
}

/// A configured channel an application uses to reach an external system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub id: String,
    pub config: Value,
    pub status: ConnectionStatus,
}

impl Connection {
    pub fn new(id: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            config,
            status: ConnectionStatus::Unconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}
