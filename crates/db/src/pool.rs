//! Postgres pool for the snapshot and integration tables.

use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::DbError;

pub type DbPool = PgPool;

/// Pool sizing and start-up behaviour.
///
/// Snapshots are written once per finished transaction, so the pool is sized
/// by how many transactions may finish at the same time, not by step count.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Close connections idle for longer; `None` keeps them open.
    pub idle_timeout_secs: Option<u64>,
    /// Apply pending migrations right after connecting.
    pub migrate: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: Some(600),
            migrate: true,
        }
    }
}

impl PoolSettings {
    /// A single connection that only applies migrations.
    pub fn migrations_only() -> Self {
        Self {
            max_connections: 1,
            idle_timeout_secs: None,
            ..Self::default()
        }
    }

    fn options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .min_connections(self.min_connections.min(self.max_connections))
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
            .idle_timeout(self.idle_timeout_secs.map(Duration::from_secs))
    }
}

/// Connect to `database_url` and, when `settings.migrate` is set, bring the
/// schema up to date before the pool is handed out.
pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<DbPool, DbError> {
    info!(
        max_connections = settings.max_connections,
        migrate = settings.migrate,
        "connecting to snapshot store"
    );
    let pool = settings.options().connect(database_url).await.map_err(|e| {
        warn!(error = %e, "snapshot store unreachable");
        DbError::from(e)
    })?;

    if settings.migrate {
        run_migrations(&pool).await?;
    }
    Ok(pool)
}

/// Apply the migrations under `migrations/` at the workspace root.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("snapshot and integration tables up to date");
    Ok(())
}
