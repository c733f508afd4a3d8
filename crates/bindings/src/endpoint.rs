//! The endpoint table of an application.
//!
//! A concrete application lists its endpoints explicitly when it is built:
//!
//! ```ignore
//! let table = EndpointTable::new()
//!     .inbound("notifyOrder", InboundEndpoint::new("/order", ExecuteIntegrations).connection_key_param("user"))
//!     .outbound("queryStock", outbound_fn(|call| Ok(Some(json!({ "stock": 7 })))));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use engine::IntegrationRegistry;
use serde_json::{json, Value};
use tracing::{debug, warn};
use workflow::{BoxError, Context, FlowError, Transaction};

use crate::http::{HttpRequest, HttpResponse};

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

/// An inbound request, resolved to the connection and integrations it
/// addresses.
pub struct InboundCall {
    pub application_id: String,
    pub endpoint_id: String,
    pub request: HttpRequest,
    /// Empty when no integration is bound for this request.
    pub integration_ids: Vec<String>,
    pub connection_id: Option<String>,
    pub ctx: Context,
    pub(crate) integrations: Option<IntegrationRegistry>,
}

impl InboundCall {
    /// Execute every addressed integration whose start condition accepts
    /// `message`, each in its own transaction.
    ///
    /// Integrations that are unknown or not running yield their error.
    pub async fn dispatch(&self, message: Option<Value>) -> Vec<(String, Result<Transaction, FlowError>)> {
        let mut results = Vec::with_capacity(self.integration_ids.len());

        for integration_id in &self.integration_ids {
            let integration = match &self.integrations {
                Some(registry) => registry.get(integration_id),
                None => Err(FlowError::UnknownIntegration(integration_id.clone())),
            };
            let integration = match integration {
                Ok(integration) => integration,
                Err(e) => {
                    results.push((integration_id.clone(), Err(e.in_context(&self.ctx))));
                    continue;
                }
            };

            match integration.can_start(message.as_ref()) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(integration_id = %integration_id, "start condition not met, skipped");
                    continue;
                }
                Err(e) => {
                    results.push((integration_id.clone(), Err(e.in_context(&self.ctx))));
                    continue;
                }
            }

            let mut ctx = self.ctx.clone();
            ctx.set_info("integrationId", integration_id.as_str());
            let outcome = integration.execute(message.clone(), ctx).await;
            results.push((integration_id.clone(), outcome));
        }

        results
    }
}

/// An outbound call on behalf of one integration.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub application_id: String,
    pub endpoint_id: String,
    pub integration_id: String,
    pub message: Value,
    /// `None` when the binding names no connection.
    pub connection_id: Option<String>,
    pub connection_config: Option<Value>,
    /// Configuration of the endpoint binding.
    pub config: Value,
    pub ctx: Context,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, call: InboundCall) -> Result<HttpResponse, BoxError>;
}

/// Outbound handlers return the reply message, or `None` when there is none.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    async fn call(&self, call: OutboundCall) -> Result<Option<Value>, BoxError>;
}

/// An [`OutboundHandler`] backed by a synchronous closure.
pub struct FnOutbound<F>(F);

pub fn outbound_fn<F>(f: F) -> FnOutbound<F>
where
    F: Fn(OutboundCall) -> Result<Option<Value>, BoxError> + Send + Sync,
{
    FnOutbound(f)
}

#[async_trait]
impl<F> OutboundHandler for FnOutbound<F>
where
    F: Fn(OutboundCall) -> Result<Option<Value>, BoxError> + Send + Sync,
{
    async fn call(&self, call: OutboundCall) -> Result<Option<Value>, BoxError> {
        (self.0)(call)
    }
}

/// Inbound handler that runs the addressed integrations with the request
/// body as message and answers with one status entry per integration.
///
/// Answers `500` when any of them failed to run or ended failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteIntegrations;

#[async_trait]
impl InboundHandler for ExecuteIntegrations {
    async fn handle(&self, call: InboundCall) -> Result<HttpResponse, BoxError> {
        let results = call.dispatch(call.request.body.clone()).await;

        let mut all_ok = true;
        let transactions: Vec<Value> = results
            .into_iter()
            .map(|(integration_id, outcome)| match outcome {
                Ok(trx) => {
                    all_ok &= !trx.is_failed();
                    json!({ "integrationId": integration_id, "transactionId": trx.id(), "failed": trx.is_failed() })
                }
                Err(e) => {
                    warn!(integration_id = %integration_id, error = %e, "inbound dispatch failed");
                    all_ok = false;
                    json!({ "integrationId": integration_id, "error": e.code() })
                }
            })
            .collect();

        let (status, label) = if all_ok { (200, "OK") } else { (500, "FAILED") };
        Ok(HttpResponse::ok(json!({ "status": label, "transactions": transactions })).with_status(status))
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// An inbound endpoint: the path it listens on and how a request names its
/// connection and integration.
#[derive(Clone)]
pub struct InboundEndpoint {
    pub path: String,
    /// Request parameter holding the connection key.
    pub connection_key_param: Option<String>,
    /// Request parameter holding the integration key.
    pub integration_key_param: Option<String>,
    /// Binding config field holding the integration key; the integration id
    /// itself when unset.
    pub integration_key_in_config: Option<String>,
    pub handler: Arc<dyn InboundHandler>,
}

impl InboundEndpoint {
    pub fn new(path: impl Into<String>, handler: impl InboundHandler + 'static) -> Self {
        Self {
            path: path.into(),
            connection_key_param: None,
            integration_key_param: None,
            integration_key_in_config: None,
            handler: Arc::new(handler),
        }
    }

    pub fn connection_key_param(mut self, param: impl Into<String>) -> Self {
        self.connection_key_param = Some(param.into());
        self
    }

    pub fn integration_key_param(mut self, param: impl Into<String>) -> Self {
        self.integration_key_param = Some(param.into());
        self
    }

    pub fn integration_key_in_config(mut self, field: impl Into<String>) -> Self {
        self.integration_key_in_config = Some(field.into());
        self
    }

    /// Key that addresses `integration_id` bound with `config`.
    pub(crate) fn integration_key(&self, integration_id: &str, config: &Value) -> Option<String> {
        match &self.integration_key_in_config {
            None => Some(integration_id.to_owned()),
            Some(field) => config.get(field).and_then(Value::as_str).map(str::to_owned),
        }
    }
}

#[derive(Clone)]
pub enum EndpointHandler {
    Inbound(InboundEndpoint),
    Outbound(Arc<dyn OutboundHandler>),
}

/// Endpoint id -> handler, built once per application.
#[derive(Clone, Default)]
pub struct EndpointTable {
    endpoints: BTreeMap<String, EndpointHandler>,
    connection_key_in_config: Option<String>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inbound(mut self, endpoint_id: impl Into<String>, endpoint: InboundEndpoint) -> Self {
        self.endpoints
            .insert(endpoint_id.into(), EndpointHandler::Inbound(endpoint));
        self
    }

    pub fn outbound(mut self, endpoint_id: impl Into<String>, handler: impl OutboundHandler + 'static) -> Self {
        self.endpoints
            .insert(endpoint_id.into(), EndpointHandler::Outbound(Arc::new(handler)));
        self
    }

    /// Index connections by this field of their config rather than by id.
    pub fn connection_key_in_config(mut self, field: impl Into<String>) -> Self {
        let field: String = field.into();
        self.connection_key_in_config = Some(field).filter(|f| !f.is_empty());
        self
    }

    pub fn get(&self, endpoint_id: &str) -> Option<&EndpointHandler> {
        self.endpoints.get(endpoint_id)
    }

    pub fn inbound_endpoint(&self, endpoint_id: &str) -> Option<&InboundEndpoint> {
        match self.endpoints.get(endpoint_id) {
            Some(EndpointHandler::Inbound(endpoint)) => Some(endpoint),
            _ => None,
        }
    }

    pub fn outbound_handler(&self, endpoint_id: &str) -> Option<&Arc<dyn OutboundHandler>> {
        match self.endpoints.get(endpoint_id) {
            Some(EndpointHandler::Outbound(handler)) => Some(handler),
            _ => None,
        }
    }

    /// `(endpoint id, endpoint)` of every inbound endpoint.
    pub fn inbound_endpoints(&self) -> impl Iterator<Item = (&str, &InboundEndpoint)> {
        self.endpoints.iter().filter_map(|(id, handler)| match handler {
            EndpointHandler::Inbound(endpoint) => Some((id.as_str(), endpoint)),
            EndpointHandler::Outbound(_) => None,
        })
    }

    /// Key that addresses connection `connection_id` configured with `config`.
    pub(crate) fn connection_key(&self, connection_id: &str, config: &Value) -> Option<String> {
        match &self.connection_key_in_config {
            None => Some(connection_id.to_owned()),
            Some(field) => config.get(field).and_then(Value::as_str).map(str::to_owned),
        }
    }
}
