//! Transaction snapshot persistence.

use chrono::Utc;
use sqlx::PgPool;

use crate::{models::SnapshotRow, DbError};

const COLUMNS: &str = "id, integration_id, step, failed, document, updated_at";

/// Insert or replace the snapshot of transaction `id`.
pub async fn upsert_snapshot(
    pool: &PgPool,
    id: &str,
    integration_id: &str,
    step: Option<&str>,
    failed: bool,
    document: serde_json::Value,
) -> Result<SnapshotRow, DbError> {
    let row = sqlx::query_as::<_, SnapshotRow>(&format!(
        r#"
        INSERT INTO transaction_snapshots (id, integration_id, step, failed, document, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE
            SET integration_id = EXCLUDED.integration_id,
                step = EXCLUDED.step,
                failed = EXCLUDED.failed,
                document = EXCLUDED.document,
                updated_at = EXCLUDED.updated_at
        RETURNING {COLUMNS}
        "#
    ))
    .bind(id)
    .bind(integration_id)
    .bind(step)
    .bind(failed)
    .bind(document)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch the snapshot of transaction `id`, if one was saved.
pub async fn get_snapshot(pool: &PgPool, id: &str) -> Result<Option<SnapshotRow>, DbError> {
    let row = sqlx::query_as::<_, SnapshotRow>(&format!(
        "SELECT {COLUMNS} FROM transaction_snapshots WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// All snapshots of one integration, newest first.
pub async fn list_snapshots(pool: &PgPool, integration_id: &str) -> Result<Vec<SnapshotRow>, DbError> {
    let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
        "SELECT {COLUMNS} FROM transaction_snapshots WHERE integration_id = $1 ORDER BY updated_at DESC"
    ))
    .bind(integration_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Delete the snapshot of transaction `id`.
///
/// Returns `DbError::NotFound` if no row was deleted.
pub async fn delete_snapshot(pool: &PgPool, id: &str) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM transaction_snapshots WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}
