//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: the documents are stored as JSON and
//! decoded by the engine.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::DbError;

fn decode<T: DeserializeOwned>(table: &'static str, id: &str, document: serde_json::Value) -> Result<T, DbError> {
    serde_json::from_value(document).map_err(|source| DbError::Corrupt {
        table,
        id: id.to_owned(),
        source,
    })
}

// ---------------------------------------------------------------------------
// transaction_snapshots
// ---------------------------------------------------------------------------

/// A persisted transaction snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SnapshotRow {
    pub id: String,
    pub integration_id: String,
    /// Step the transaction was at; `None` once finished.
    pub step: Option<String>,
    pub failed: bool,
    /// The full snapshot document.
    pub document: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl SnapshotRow {
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, DbError> {
        decode("transaction_snapshots", &self.id, self.document)
    }
}

// ---------------------------------------------------------------------------
// integrations
// ---------------------------------------------------------------------------

/// A persisted integration document.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IntegrationRow {
    pub id: String,
    pub client_id: Option<String>,
    /// Workflow, configuration, schedule and start condition.
    pub document: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationRow {
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, DbError> {
        decode("integrations", &self.id, self.document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn undecodable_rows_report_table_and_id() {
        let row = IntegrationRow {
            id: "orders".into(),
            client_id: None,
            document: json!({ "workflow": 7 }),
            updated_at: Utc::now(),
        };
        let err = row.decode::<Vec<String>>().expect_err("not a list");
        assert!(matches!(err, DbError::Corrupt { table: "integrations", ref id, .. } if id == "orders"));
    }
}
