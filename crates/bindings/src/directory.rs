//! Applications by id, as seen from integrations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use engine::EndpointDirectory;
use serde_json::Value;
use tracing::{info, Instrument};
use workflow::{Context, EndpointStep, FlowError};

use crate::application::Application;
use crate::http::{HttpRequest, HttpResponse, HttpRoutes};

/// Registered applications. Cheap to clone; clones share the same set.
///
/// Implements [`EndpointDirectory`], so integrations bind and call their
/// endpoint steps through it.
#[derive(Clone, Default)]
pub struct ApplicationDirectory {
    applications: Arc<RwLock<HashMap<String, Arc<dyn Application>>>>,
}

impl ApplicationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `application`, returning the one it replaced.
    pub fn register(&self, application: Arc<dyn Application>) -> Option<Arc<dyn Application>> {
        info!(application_id = application.id(), "application registered");
        self.applications
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(application.id().to_owned(), application)
    }

    pub fn find(&self, id: &str) -> Option<Arc<dyn Application>> {
        self.applications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Application>, FlowError> {
        self.find(id)
            .ok_or_else(|| FlowError::UnknownApplication(id.to_owned()))
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .applications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Destroy and unregister `id`.
    pub async fn remove(&self, id: &str, ctx: &Context) -> Result<Arc<dyn Application>, FlowError> {
        let application = self.get(id).map_err(|e| e.in_context(ctx))?;
        application.destroy(ctx).await?;
        self.applications
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        info!(application_id = id, "application removed");
        Ok(application)
    }

    /// Hand `request` to the application `routes` mounted its path for.
    pub async fn dispatch(&self, routes: &HttpRoutes, request: HttpRequest, ctx: &Context) -> Result<HttpResponse, FlowError> {
        let application_id = routes.resolve(&request.path).ok_or_else(|| {
            FlowError::UnknownEndpoint(request.path.clone())
                .in_context(&ctx.clone().with_info("path", request.path.as_str()))
        })?;
        let application = self.get(&application_id).map_err(|e| e.in_context(ctx))?;
        application.handle(request, ctx).instrument(ctx.span()).await
    }
}

#[async_trait]
impl EndpointDirectory for ApplicationDirectory {
    fn bind_endpoint(&self, integration_id: &str, endpoint: &EndpointStep) -> Result<(), FlowError> {
        self.get(&endpoint.application_id)?.add_endpoint_for_integration(
            &endpoint.endpoint_id,
            integration_id,
            endpoint.connection_id.as_deref(),
            endpoint.config.clone(),
        )
    }

    fn unbind_endpoint(&self, integration_id: &str, endpoint: &EndpointStep) -> Result<(), FlowError> {
        self.get(&endpoint.application_id)?
            .remove_endpoint_for_integration(&endpoint.endpoint_id, integration_id)
    }

    async fn call_outbound_endpoint(
        &self,
        application_id: &str,
        endpoint_id: &str,
        integration_id: &str,
        message: Value,
        ctx: &Context,
    ) -> Result<Option<Value>, FlowError> {
        let application = self.get(application_id).map_err(|e| e.in_context(ctx))?;
        application
            .call_outbound_endpoint(endpoint_id, integration_id, message, ctx)
            .await
    }
}
