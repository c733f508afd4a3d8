//! Persistence failures, and how they surface to the engine.

use thiserror::Error;
use workflow::FlowError;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    /// A stored document no longer decodes into its type.
    #[error("unreadable document {id} in {table}: {source}")]
    Corrupt {
        table: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Every persistence failure is a `STORE_FAIL`. Callers that treat a missing
/// row as a normal outcome match on [`DbError::NotFound`] before converting.
impl From<DbError> for FlowError {
    fn from(err: DbError) -> Self {
        FlowError::Storage(err.to_string())
    }
}
