//! Applications: the owners of connections and endpoints.
//!
//! [`EndpointApplication`] implements the whole [`Application`] contract on
//! top of an [`EndpointTable`]; concrete applications supply the table and,
//! optionally, [`ApplicationHooks`] for their own connect/disconnect work.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use engine::IntegrationRegistry;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use workflow::document::preview;
use workflow::{BoxError, Context, ExecStatus, FlowError};

use crate::connection::ConnectionStatus;
use crate::endpoint::{EndpointTable, InboundCall, OutboundCall};
use crate::http::{HttpRegistrar, HttpRequest, HttpResponse};
use crate::registry::BindingRegistry;

const PREVIEW_CHARS: usize = 500;

/// The contract the engine and the HTTP server see an application through.
#[async_trait]
pub trait Application: Send + Sync {
    fn id(&self) -> &str;

    fn status(&self) -> ExecStatus;

    async fn init(&self, config: Value, ctx: &Context) -> Result<(), FlowError>;

    async fn start(&self, ctx: &Context) -> Result<(), FlowError>;

    /// Fails with `APP_REL_IT` while an integration bound to the application
    /// is running.
    async fn stop(&self, ctx: &Context) -> Result<(), FlowError>;

    async fn destroy(&self, ctx: &Context) -> Result<(), FlowError>;

    // ---- connections ----

    fn create_connection(&self, connection_id: &str, config: Value, ctx: &Context) -> Result<(), FlowError>;

    async fn connect(&self, connection_id: &str, ctx: &Context) -> Result<(), FlowError>;

    async fn disconnect(&self, connection_id: &str, ctx: &Context) -> Result<(), FlowError>;

    fn remove_connection(&self, connection_id: &str, ctx: &Context) -> Result<(), FlowError>;

    fn connection_status(&self, connection_id: &str) -> ConnectionStatus;

    // ---- bindings ----

    fn add_endpoint_for_integration(
        &self,
        endpoint_id: &str,
        integration_id: &str,
        connection_id: Option<&str>,
        config: Value,
    ) -> Result<(), FlowError>;

    fn remove_endpoint_for_integration(&self, endpoint_id: &str, integration_id: &str) -> Result<(), FlowError>;

    fn has_endpoint_for_integration(&self, endpoint_id: &str, integration_id: &str) -> bool;

    /// Integrations with at least one endpoint bound to this application.
    fn relative_integrations(&self) -> Vec<String>;

    // ---- traffic ----

    async fn call_outbound_endpoint(
        &self,
        endpoint_id: &str,
        integration_id: &str,
        message: Value,
        ctx: &Context,
    ) -> Result<Option<Value>, FlowError>;

    /// Handle a request for one of the paths the application mounted.
    async fn handle(&self, request: HttpRequest, ctx: &Context) -> Result<HttpResponse, FlowError>;
}

/// Work a concrete application does at lifecycle transitions. Every hook
/// defaults to doing nothing.
#[async_trait]
pub trait ApplicationHooks: Send + Sync {
    async fn on_init(&self, _config: &Value, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    async fn on_start(&self, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    async fn on_destroy(&self, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    async fn on_connect(&self, _connection_id: &str, _config: &Value, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    async fn on_disconnect(&self, _connection_id: &str, _config: &Value, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }
}

struct NoHooks;

impl ApplicationHooks for NoHooks {}

fn hook_failed(application_id: &str, hook: &str, e: BoxError) -> FlowError {
    FlowError::endpoint_failed(format!("{application_id}:{hook}"), e)
}

// ---------------------------------------------------------------------------
// EndpointApplication
// ---------------------------------------------------------------------------

/// An [`Application`] whose endpoints come from an [`EndpointTable`].
///
/// `start` mounts every inbound endpoint at `"/" + id + path` and connects
/// every unconnected connection; `stop` undoes both.
pub struct EndpointApplication {
    id: String,
    endpoints: EndpointTable,
    hooks: Arc<dyn ApplicationHooks>,
    bindings: BindingRegistry,
    config: RwLock<Value>,
    status: RwLock<ExecStatus>,
    /// Mounted path -> endpoint id, while running.
    paths: RwLock<Vec<(String, String)>>,
    integrations: Option<IntegrationRegistry>,
    http: Option<Arc<dyn HttpRegistrar>>,
}

impl EndpointApplication {
    pub fn new(id: impl Into<String>, endpoints: EndpointTable) -> Self {
        Self {
            id: id.into(),
            endpoints,
            hooks: Arc::new(NoHooks),
            bindings: BindingRegistry::new(),
            config: RwLock::new(Value::Object(Map::new())),
            status: RwLock::new(ExecStatus::None),
            paths: RwLock::new(Vec::new()),
            integrations: None,
            http: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ApplicationHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Integrations that inbound requests are dispatched to, and whose
    /// status `stop` checks.
    pub fn with_integrations(mut self, integrations: IntegrationRegistry) -> Self {
        self.integrations = Some(integrations);
        self
    }

    /// Where inbound endpoints are mounted on `start`.
    pub fn with_http(mut self, http: Arc<dyn HttpRegistrar>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn config(&self) -> Value {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn bindings(&self) -> &BindingRegistry {
        &self.bindings
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    /// Connection ids, sorted; only the connected ones when `connected_only`.
    pub fn connection_ids(&self, connected_only: bool) -> Vec<String> {
        self.bindings.connection_ids(connected_only)
    }

    /// Currently mounted `(path, endpoint id)` pairs.
    pub fn mounted_paths(&self) -> Vec<(String, String)> {
        self.paths.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_status(&self, status: ExecStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn ensure_running(&self, operation: &'static str, ctx: &Context) -> Result<(), FlowError> {
        if self.status() == ExecStatus::Running {
            Ok(())
        } else {
            Err(FlowError::ApplicationStopped { operation }.in_context(ctx))
        }
    }

    fn endpoint_for_path(&self, path: &str) -> Option<String> {
        self.paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(mounted, _)| mounted == path)
            .map(|(_, endpoint_id)| endpoint_id.clone())
    }

    /// Resolve the connection and integrations an inbound request addresses.
    fn resolve_inbound(
        &self,
        endpoint_id: &str,
        request: &HttpRequest,
        ctx: &mut Context,
    ) -> Result<(Option<String>, Vec<String>), FlowError> {
        let endpoint = self
            .endpoints
            .inbound_endpoint(endpoint_id)
            .ok_or_else(|| FlowError::UnknownEndpoint(endpoint_id.to_owned()).in_context(ctx))?;

        let mut connection_id = endpoint
            .connection_key_param
            .as_deref()
            .and_then(|param| request.param(param))
            .and_then(|key| self.bindings.connection_for_key(key));

        let integration_id = endpoint
            .integration_key_param
            .as_deref()
            .and_then(|param| request.param(param))
            .and_then(|key| self.bindings.integration_for_key(endpoint_id, key));

        if let (Some(it), None) = (&integration_id, &connection_id) {
            connection_id = self
                .bindings
                .binding(endpoint_id, it)
                .and_then(|binding| binding.connection_id);
        }

        let Some(connection_id) = connection_id.filter(|c| !c.is_empty()) else {
            return Ok((None, integration_id.into_iter().collect()));
        };

        ctx.set_info("connectionId", connection_id.as_str());
        if self.bindings.connection_status(&connection_id) != ConnectionStatus::Connected {
            return Err(FlowError::ConnectionNotConnected(connection_id).in_context(ctx));
        }

        let integration_ids = match integration_id {
            Some(it) => vec![it],
            None => self.bindings.integrations_on_connection(endpoint_id, &connection_id),
        };
        Ok((Some(connection_id), integration_ids))
    }

    /// Best effort: paths that fail to unmount are logged.
    fn unmount(&self, mounted: &[(String, String)], ctx: &Context) {
        let Some(http) = &self.http else { return };
        for (path, _) in mounted {
            if let Err(e) = http.unregister_http_path(path, ctx) {
                warn!(path = %path, error = %e, "could not unmount path");
            }
        }
    }
}

#[async_trait]
impl Application for EndpointApplication {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ExecStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(skip_all, fields(application_id = %self.id))]
    async fn init(&self, config: Value, ctx: &Context) -> Result<(), FlowError> {
        info!(config = %preview(&config, PREVIEW_CHARS), "initialising application");

        self.hooks
            .on_init(&config, ctx)
            .await
            .map_err(|e| hook_failed(&self.id, "init", e).in_context(ctx))?;

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.set_status(ExecStatus::Stopped);
        info!("application initialised");
        Ok(())
    }

    #[instrument(skip_all, fields(application_id = %self.id))]
    async fn start(&self, ctx: &Context) -> Result<(), FlowError> {
        if self.status() == ExecStatus::Running {
            return Ok(());
        }

        self.hooks
            .on_start(ctx)
            .await
            .map_err(|e| hook_failed(&self.id, "start", e).in_context(ctx))?;

        let root = format!("/{}", self.id);
        let mut mounted = Vec::new();
        for (endpoint_id, endpoint) in self.endpoints.inbound_endpoints() {
            let path = format!("{root}{}", endpoint.path);
            if let Some(http) = &self.http {
                let ctx = ctx.clone().with_info("endpointId", endpoint_id);
                if let Err(e) = http.register_http_path(&path, &self.id, &ctx) {
                    self.unmount(&mounted, &ctx);
                    return Err(e);
                }
            }
            mounted.push((path, endpoint_id.to_owned()));
        }
        *self.paths.write().unwrap_or_else(PoisonError::into_inner) = mounted;

        self.set_status(ExecStatus::Running);

        // Connections stopped by hand are reconnected too.
        for connection_id in self.bindings.connection_ids(false) {
            if self.bindings.connection_status(&connection_id) == ConnectionStatus::Unconnected {
                let ctx = ctx.clone().with_info("connectionId", connection_id.as_str());
                self.connect(&connection_id, &ctx).await?;
            }
        }

        info!("application started");
        Ok(())
    }

    #[instrument(skip_all, fields(application_id = %self.id))]
    async fn stop(&self, ctx: &Context) -> Result<(), FlowError> {
        if self.status() != ExecStatus::Running {
            return Ok(());
        }

        if let Some(integrations) = &self.integrations {
            for integration_id in self.bindings.relative_integrations() {
                if integrations.status(&integration_id) == ExecStatus::Running {
                    let ctx = ctx.clone().with_info("integrationId", integration_id.as_str());
                    return Err(FlowError::RelatedIntegrationRunning(integration_id).in_context(&ctx));
                }
            }
        }

        let mounted = std::mem::take(&mut *self.paths.write().unwrap_or_else(PoisonError::into_inner));
        if let Some(http) = &self.http {
            for (path, _) in &mounted {
                http.unregister_http_path(path, ctx)?;
            }
        }

        for connection_id in self.bindings.connection_ids(true) {
            let ctx = ctx.clone().with_info("connectionId", connection_id.as_str());
            self.disconnect(&connection_id, &ctx).await?;
        }

        self.hooks
            .on_stop(ctx)
            .await
            .map_err(|e| hook_failed(&self.id, "stop", e).in_context(ctx))?;
        self.set_status(ExecStatus::Stopped);
        info!("application stopped");
        Ok(())
    }

    #[instrument(skip_all, fields(application_id = %self.id))]
    async fn destroy(&self, ctx: &Context) -> Result<(), FlowError> {
        self.stop(ctx).await?;
        self.hooks
            .on_destroy(ctx)
            .await
            .map_err(|e| hook_failed(&self.id, "destroy", e).in_context(ctx))?;
        info!("application destroyed");
        Ok(())
    }

    fn create_connection(&self, connection_id: &str, config: Value, _ctx: &Context) -> Result<(), FlowError> {
        let config = if config.is_null() { Value::Object(Map::new()) } else { config };
        let key = self.endpoints.connection_key(connection_id, &config);
        self.bindings.create_connection(connection_id, config, key);
        info!(application_id = %self.id, connection_id, "connection created");
        Ok(())
    }

    async fn connect(&self, connection_id: &str, ctx: &Context) -> Result<(), FlowError> {
        let ctx = ctx.clone().with_info("connectionId", connection_id);
        self.ensure_running("connect", &ctx)?;
        let connection = self
            .bindings
            .connection(connection_id)
            .ok_or_else(|| FlowError::UnknownConnection(connection_id.to_owned()).in_context(&ctx))?;

        info!(application_id = %self.id, connection_id, "connecting");
        self.hooks
            .on_connect(connection_id, &connection.config, &ctx)
            .await
            .map_err(|e| hook_failed(&self.id, "connect", e).in_context(&ctx))?;
        self.bindings
            .set_connection_status(connection_id, ConnectionStatus::Connected)
            .map_err(|e| e.in_context(&ctx))?;
        info!(application_id = %self.id, connection_id, "connected");
        Ok(())
    }

    async fn disconnect(&self, connection_id: &str, ctx: &Context) -> Result<(), FlowError> {
        let ctx = ctx.clone().with_info("connectionId", connection_id);
        self.ensure_running("disconnect", &ctx)?;
        let connection = self
            .bindings
            .connection(connection_id)
            .ok_or_else(|| FlowError::UnknownConnection(connection_id.to_owned()).in_context(&ctx))?;

        info!(application_id = %self.id, connection_id, "disconnecting");
        self.hooks
            .on_disconnect(connection_id, &connection.config, &ctx)
            .await
            .map_err(|e| hook_failed(&self.id, "disconnect", e).in_context(&ctx))?;
        self.bindings
            .set_connection_status(connection_id, ConnectionStatus::Unconnected)
            .map_err(|e| e.in_context(&ctx))?;
        info!(application_id = %self.id, connection_id, "disconnected");
        Ok(())
    }

    fn remove_connection(&self, connection_id: &str, ctx: &Context) -> Result<(), FlowError> {
        self.bindings.remove_connection(connection_id).map_err(|e| {
            e.in_context(&ctx.clone().with_info("connectionId", connection_id))
        })?;
        info!(application_id = %self.id, connection_id, "connection removed");
        Ok(())
    }

    fn connection_status(&self, connection_id: &str) -> ConnectionStatus {
        self.bindings.connection_status(connection_id)
    }

    fn add_endpoint_for_integration(
        &self,
        endpoint_id: &str,
        integration_id: &str,
        connection_id: Option<&str>,
        config: Value,
    ) -> Result<(), FlowError> {
        if self.endpoints.get(endpoint_id).is_none() {
            return Err(FlowError::UnknownEndpoint(format!("{}:{endpoint_id}", self.id)));
        }
        let config = if config.is_null() { Value::Object(Map::new()) } else { config };
        let integration_key = self
            .endpoints
            .inbound_endpoint(endpoint_id)
            .map_or_else(|| Some(integration_id.to_owned()), |ep| ep.integration_key(integration_id, &config));

        self.bindings.add_binding(
            endpoint_id,
            integration_id,
            connection_id.map(str::to_owned),
            config,
            integration_key,
        );
        Ok(())
    }

    fn remove_endpoint_for_integration(&self, endpoint_id: &str, integration_id: &str) -> Result<(), FlowError> {
        if !self.bindings.remove_binding(endpoint_id, integration_id) {
            debug!(application_id = %self.id, endpoint_id, integration_id, "endpoint was not bound");
        }
        Ok(())
    }

    fn has_endpoint_for_integration(&self, endpoint_id: &str, integration_id: &str) -> bool {
        self.bindings.has_binding(endpoint_id, integration_id)
    }

    fn relative_integrations(&self) -> Vec<String> {
        self.bindings.relative_integrations()
    }

    #[instrument(skip_all, fields(application_id = %self.id, endpoint_id = %endpoint_id, integration_id = %integration_id))]
    async fn call_outbound_endpoint(
        &self,
        endpoint_id: &str,
        integration_id: &str,
        message: Value,
        ctx: &Context,
    ) -> Result<Option<Value>, FlowError> {
        let binding = self.bindings.binding(endpoint_id, integration_id);
        let connection_id = binding.as_ref().and_then(|b| b.connection_id.clone());

        let ctx = ctx
            .clone()
            .with_info("applicationId", self.id.as_str())
            .with_info("endpointId", endpoint_id)
            .with_info("integrationId", integration_id)
            .with_info("connectionId", connection_id.as_deref().unwrap_or_default());
        self.ensure_running("call outbound endpoint", &ctx)?;

        info!(msg = %preview(&message, PREVIEW_CHARS), "calling outbound endpoint");

        if let Some(connection_id) = &connection_id {
            if self.bindings.connection_status(connection_id) != ConnectionStatus::Connected {
                return Err(FlowError::ConnectionNotConnected(connection_id.clone()).in_context(&ctx));
            }
        }

        let handler = self
            .endpoints
            .outbound_handler(endpoint_id)
            .ok_or_else(|| FlowError::UnknownEndpoint(endpoint_id.to_owned()).in_context(&ctx))?;

        let call = OutboundCall {
            application_id: self.id.clone(),
            endpoint_id: endpoint_id.to_owned(),
            integration_id: integration_id.to_owned(),
            message,
            connection_config: connection_id
                .as_deref()
                .and_then(|id| self.bindings.connection(id))
                .map(|c| c.config),
            connection_id,
            config: binding.map_or_else(|| Value::Object(Map::new()), |b| b.config),
            ctx: ctx.clone(),
        };

        let started = Instant::now();
        let reply = handler
            .call(call)
            .await
            .map_err(|e| FlowError::endpoint_failed(endpoint_id, e).in_context(&ctx))?;

        info!(
            result = %reply.as_ref().map(|r| preview(r, PREVIEW_CHARS)).unwrap_or_default(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "outbound endpoint called"
        );
        Ok(reply)
    }

    #[instrument(skip_all, fields(application_id = %self.id, path = %request.path))]
    async fn handle(&self, request: HttpRequest, ctx: &Context) -> Result<HttpResponse, FlowError> {
        self.ensure_running("handle HTTP request", ctx)?;

        let Some(endpoint_id) = self.endpoint_for_path(&request.path) else {
            let ctx = ctx.clone().with_info("path", request.path.as_str());
            return Err(FlowError::UnknownEndpoint(request.path.clone()).in_context(&ctx));
        };

        let mut ctx = ctx
            .clone()
            .with_info("applicationId", self.id.as_str())
            .with_info("endpointId", endpoint_id.as_str());
        let (connection_id, integration_ids) = self.resolve_inbound(&endpoint_id, &request, &mut ctx)?;
        if !integration_ids.is_empty() {
            ctx.set_info("integrationId", integration_ids.join(","));
        }

        let handler = self
            .endpoints
            .inbound_endpoint(&endpoint_id)
            .map(|ep| Arc::clone(&ep.handler))
            .ok_or_else(|| FlowError::UnknownEndpoint(endpoint_id.clone()).in_context(&ctx))?;

        debug!(integrations = integration_ids.len(), "dispatching inbound request");

        let call = InboundCall {
            application_id: self.id.clone(),
            endpoint_id: endpoint_id.clone(),
            request,
            integration_ids,
            connection_id,
            ctx: ctx.clone(),
            integrations: self.integrations.clone(),
        };

        handler.handle(call).await.map_err(|e| {
            warn!(error = %e, "inbound endpoint failed");
            FlowError::endpoint_failed(endpoint_id, e).in_context(&ctx)
        })
    }
}
