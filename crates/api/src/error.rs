//! Mapping of engine failures onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::warn;
use workflow::FlowError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("transaction '{0}' not found")]
    TransactionNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<db::DbError> for ApiError {
    fn from(err: db::DbError) -> Self {
        Self::Flow(err.into())
    }
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Flow(e) => e.code(),
            Self::TransactionNotFound(_) => "TRX_NONE",
            Self::BadRequest(_) => "BAD_REQUEST",
        }
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.code())
    }
}

/// HTTP status for a failure code.
pub fn status_for(code: &str) -> StatusCode {
    match code {
        "APP_NONE" | "CONN_NONE" | "EP_NONE" | "IT_NONE" | "STEP_NONE" | "TRX_NONE" => StatusCode::NOT_FOUND,
        "APP_STOP" | "IT_STOP" | "CONN_NONE_STOP" | "CONN_RUN" | "APP_REL_IT" => StatusCode::CONFLICT,
        "DEF_INVALID" | "SCH_P_CRON" | "SCH_INVALID" | "JSON" | "BAD_REQUEST" => StatusCode::BAD_REQUEST,
        "EP_FAIL" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.code(), error = %self, "request failed");
        }

        let context_id = match &self {
            Self::Flow(e) => e.context_id().map(str::to_owned),
            _ => None,
        };
        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
            "contextId": context_id,
        });
        (status, Json(body)).into_response()
    }
}
