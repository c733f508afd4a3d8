use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use bindings::{HttpMethod, HttpRequest, HttpResponse};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use workflow::{Context, ExecStatus};

use crate::{error::ApiError, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSummary {
    pub id: String,
    pub status: ExecStatus,
    pub relative_integrations: Vec<String>,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<ApplicationSummary>> {
    let summaries = state
        .applications
        .ids()
        .iter()
        .filter_map(|id| state.applications.find(id))
        .map(|app| ApplicationSummary {
            id: app.id().to_owned(),
            status: app.status(),
            relative_integrations: app.relative_integrations(),
        })
        .collect();
    Json(summaries)
}

/// Every path not claimed by the admin API: handed to the application
/// that mounted it.
pub async fn inbound(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let method: HttpMethod = method.as_str().parse().map_err(ApiError::BadRequest)?;
    let mut request = HttpRequest::new(method, uri.path());
    request.params = params;
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    if !body.is_empty() {
        let decoded = serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
        request = request.with_body(decoded);
    }

    let ctx = Context::new().with_info("path", uri.path());
    debug!(method = %method, path = %uri.path(), "inbound request");
    let response = state.applications.dispatch(&state.routes, request, &ctx).await?;
    Ok(into_response(response))
}

fn into_response(response: HttpResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = match response.body {
        Some(body) => (status, Json(body)).into_response(),
        None => status.into_response(),
    };
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            out.headers_mut().insert(name, value);
        }
    }
    out
}
