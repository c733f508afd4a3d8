use axum::{
    extract::{Path, State},
    Json,
};
use workflow::{Context, TransactionSnapshot};

use crate::{error::ApiError, AppState};

/// Saved transactions of one integration, newest first.
pub async fn list(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<TransactionSnapshot>>, ApiError> {
    Ok(Json(state.snapshots.list(&id).await?))
}

pub async fn get(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<TransactionSnapshot>, ApiError> {
    state
        .snapshots
        .load(&id)
        .await?
        .map(Json)
        .ok_or(ApiError::TransactionNotFound(id))
}

/// Run a saved transaction again from the step it was saved at.
pub async fn resume(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<TransactionSnapshot>, ApiError> {
    let snapshot = state
        .snapshots
        .load(&id)
        .await?
        .ok_or_else(|| ApiError::TransactionNotFound(id.clone()))?;
    let integration_id = snapshot
        .integration_id
        .clone()
        .ok_or_else(|| ApiError::BadRequest(format!("transaction '{id}' names no integration")))?;

    let it = state.integrations.get(&integration_id)?;
    let ctx = Context::new()
        .with_info("integrationId", integration_id.as_str())
        .with_info("transactionId", id.as_str());
    let trx = it.resume(snapshot, ctx).await?;
    Ok(Json(trx.snapshot()))
}
