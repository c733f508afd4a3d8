use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use engine::{Integration, IntegrationDocument};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use workflow::{Context, ExecStatus, TransactionSnapshot};

use crate::{error::ApiError, AppState};
use db::repository::integrations as it_repo;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub status: ExecStatus,
    pub steps: usize,
    pub scheduled: bool,
}

impl From<&Integration> for IntegrationSummary {
    fn from(it: &Integration) -> Self {
        Self {
            id: it.id().to_owned(),
            client_id: it.client_id().map(str::to_owned),
            status: it.status(),
            steps: it.graph().len(),
            scheduled: it.definition().schedule().is_some(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationDetail {
    #[serde(flatten)]
    pub summary: IntegrationSummary,
    pub config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_condition: Option<Value>,
}

fn ctx_for(id: &str) -> Context {
    Context::new().with_info("integrationId", id)
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<IntegrationSummary>> {
    let summaries = state
        .integrations
        .ids()
        .iter()
        .filter_map(|id| state.integrations.find(id))
        .map(|it| IntegrationSummary::from(&it))
        .collect();
    Json(summaries)
}

pub async fn get(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<IntegrationDetail>, ApiError> {
    let it = state.integrations.get(&id)?;
    let definition = it.definition();
    Ok(Json(IntegrationDetail {
        summary: IntegrationSummary::from(&it),
        config: it.config().as_ref().clone(),
        start_condition: definition.start_condition().cloned(),
    }))
}

/// Install (or replace) an integration. It is left stopped.
pub async fn install(
    State(state): State<AppState>,
    Json(doc): Json<IntegrationDocument>,
) -> Result<(StatusCode, Json<IntegrationSummary>), ApiError> {
    let ctx = ctx_for(&doc.id);
    let it = state.integrations.install(&doc, state.services.clone(), &ctx)?;

    if let Some(pool) = &state.pool {
        let document = serde_json::to_value(&doc).map_err(workflow::FlowError::from)?;
        it_repo::upsert_integration(pool, &doc.id, doc.client_id.as_deref(), document).await?;
    }

    info!(integration_id = %doc.id, "integration installed over HTTP");
    Ok((StatusCode::CREATED, Json(IntegrationSummary::from(&it))))
}

pub async fn start(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<IntegrationSummary>, ApiError> {
    let it = state.integrations.get(&id)?;
    it.start(&ctx_for(&id))?;
    Ok(Json(IntegrationSummary::from(&it)))
}

pub async fn stop(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<IntegrationSummary>, ApiError> {
    let it = state.integrations.get(&id)?;
    it.stop(&ctx_for(&id))?;
    Ok(Json(IntegrationSummary::from(&it)))
}

pub async fn remove(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.integrations.remove(&id, &ctx_for(&id))?;

    if let Some(pool) = &state.pool {
        match it_repo::delete_integration(pool, &id).await {
            Ok(()) | Err(db::DbError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Run one transaction with the request body as message.
pub async fn execute(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<Value>>,
) -> Result<Json<TransactionSnapshot>, ApiError> {
    let it = state.integrations.get(&id)?;
    let trx = it.execute(body.map(|Json(v)| v), ctx_for(&id)).await?;
    Ok(Json(trx.snapshot()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeParams {
    #[serde(default)]
    pub move_on: bool,
}

/// Step a transaction described by the body: only its current step, or to
/// the end with `?moveOn=true`. Works on stopped integrations too.
pub async fn probe(
    Path(id): Path<String>,
    Query(params): Query<ProbeParams>,
    State(state): State<AppState>,
    Json(snapshot): Json<TransactionSnapshot>,
) -> Result<Json<TransactionSnapshot>, ApiError> {
    let it = state.integrations.get(&id)?;
    let ctx = ctx_for(&id);

    let mut trx = match snapshot.step {
        Some(step) => it.create_instance_at(
            snapshot.message,
            &step,
            snapshot.previous_step,
            snapshot.failed,
            snapshot.properties,
            ctx,
        )?,
        None => it.create_instance(snapshot.message, ctx),
    };
    it.probe(&mut trx, params.move_on).await;
    Ok(Json(trx.snapshot()))
}
