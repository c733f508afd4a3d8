//! The error taxonomy shared by every crate in the workspace.
//!
//! Each variant maps to a short, stable code (see [`FlowError::code`]) so
//! failures can be matched on by callers and grepped for in logs.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::Context;

/// Boxed error used for failures raised by user-supplied handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the workflow core, the engine and the binding layer.
#[derive(Debug, Error)]
pub enum FlowError {
    // ------ Application / connection lifecycle ------

    /// An operation was attempted on a stopped application.
    #[error("application is stopped, failed to {operation}")]
    ApplicationStopped { operation: &'static str },

    /// The application id is not registered.
    #[error("unknown application '{0}'")]
    UnknownApplication(String),

    /// The connection id was never created (or has been removed).
    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    /// A connection can only be removed while it is unconnected.
    #[error("connection '{0}' is still connected")]
    ConnectionActive(String),

    /// The bound connection exists but is not connected.
    #[error("connection '{0}' is not connected")]
    ConnectionNotConnected(String),

    /// No endpoint is registered under this id or path.
    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    /// The endpoint handler returned an error.
    #[error("endpoint '{endpoint_id}' failed: {source}")]
    EndpointFailed {
        endpoint_id: String,
        #[source]
        source: BoxError,
    },

    /// The application still has a running integration bound to it.
    #[error("integration '{0}' bound to the application is still running")]
    RelatedIntegrationRunning(String),

    // ------ Integration lifecycle ------

    /// The integration id is not registered.
    #[error("unknown integration '{0}'")]
    UnknownIntegration(String),

    /// `execute` was called on an integration that is not running.
    #[error("integration '{0}' is not running")]
    IntegrationStopped(String),

    /// A step id does not exist in the integration's graph.
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    /// The workflow definition document is malformed.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    // ------ Scheduling ------

    /// Periodic and cron schedules are mutually exclusive.
    #[error("can not set {requested} schedule, the integration already has a {existing} schedule")]
    ScheduleConflict {
        requested: &'static str,
        existing: &'static str,
    },

    /// The schedule itself is unusable (bad cron expression, zero interval).
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    // ------ Collaborators ------

    /// The start-condition evaluator failed.
    #[error("condition evaluation failed: {0}")]
    Condition(String),

    /// A storage backend failed.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Any of the above, correlated to the flow that raised it.
    #[error("{source} ({})", render_info(.info))]
    InContext {
        context_id: Option<String>,
        info: BTreeMap<String, String>,
        #[source]
        source: Box<FlowError>,
    },
}

impl FlowError {
    /// Short stable code identifying the kind of failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ApplicationStopped { .. } => "APP_STOP",
            Self::UnknownApplication(_) => "APP_NONE",
            Self::UnknownConnection(_) => "CONN_NONE",
            Self::ConnectionActive(_) => "CONN_RUN",
            Self::ConnectionNotConnected(_) => "CONN_NONE_STOP",
            Self::UnknownEndpoint(_) => "EP_NONE",
            Self::EndpointFailed { .. } => "EP_FAIL",
            Self::RelatedIntegrationRunning(_) => "APP_REL_IT",
            Self::UnknownIntegration(_) => "IT_NONE",
            Self::IntegrationStopped(_) => "IT_STOP",
            Self::UnknownStep(_) => "STEP_NONE",
            Self::InvalidDefinition(_) => "DEF_INVALID",
            Self::ScheduleConflict { .. } => "SCH_P_CRON",
            Self::InvalidSchedule(_) => "SCH_INVALID",
            Self::Condition(_) => "COND_FAIL",
            Self::Storage(_) => "STORE_FAIL",
            Self::Json(_) => "JSON",
            Self::Io(_) => "IO",
            Self::InContext { source, .. } => source.code(),
        }
    }

    /// Id of the context the failure was raised in, if it was correlated.
    pub fn context_id(&self) -> Option<&str> {
        match self {
            Self::InContext { context_id, source, .. } => {
                context_id.as_deref().or_else(|| source.context_id())
            }
            _ => None,
        }
    }

    /// Attach the context id and info of `ctx` to this error.
    ///
    /// An error already correlated to the same context is returned unchanged.
    pub fn in_context(self, ctx: &Context) -> Self {
        if let Self::InContext { context_id, .. } = &self {
            if context_id.as_deref() == ctx.id() {
                return self;
            }
        }
        Self::InContext {
            context_id: ctx.id().map(str::to_owned),
            info: ctx.info().clone(),
            source: Box::new(self),
        }
    }

    /// Wrap a handler failure raised by `endpoint_id`.
    pub fn endpoint_failed(endpoint_id: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::EndpointFailed {
            endpoint_id: endpoint_id.into(),
            source: source.into(),
        }
    }
}

fn render_info(info: &BTreeMap<String, String>) -> String {
    info.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}
