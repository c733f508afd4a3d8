//! Integration document CRUD operations.

use chrono::Utc;
use sqlx::PgPool;

use crate::{models::IntegrationRow, DbError};

/// Insert or replace the document of integration `id`.
pub async fn upsert_integration(
    pool: &PgPool,
    id: &str,
    client_id: Option<&str>,
    document: serde_json::Value,
) -> Result<IntegrationRow, DbError> {
    let row = sqlx::query_as::<_, IntegrationRow>(
        r#"
        INSERT INTO integrations (id, client_id, document, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE
            SET client_id = EXCLUDED.client_id,
                document = EXCLUDED.document,
                updated_at = EXCLUDED.updated_at
        RETURNING id, client_id, document, updated_at
        "#,
    )
    .bind(id)
    .bind(client_id)
    .bind(document)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch a single integration by id.
pub async fn get_integration(pool: &PgPool, id: &str) -> Result<IntegrationRow, DbError> {
    sqlx::query_as::<_, IntegrationRow>(
        "SELECT id, client_id, document, updated_at FROM integrations WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Return all integrations ordered by id.
pub async fn list_integrations(pool: &PgPool) -> Result<Vec<IntegrationRow>, DbError> {
    let rows = sqlx::query_as::<_, IntegrationRow>(
        "SELECT id, client_id, document, updated_at FROM integrations ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Permanently delete an integration.
///
/// Returns `DbError::NotFound` if no row was deleted.
pub async fn delete_integration(pool: &PgPool, id: &str) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM integrations WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}
