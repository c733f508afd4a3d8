//! The set of registered integrations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};
use workflow::{Context, ExecStatus, FlowError};

use crate::definition::IntegrationDocument;
use crate::integration::Integration;
use crate::services::Services;

/// Integrations by id. Cheap to clone; clones share the same set.
#[derive(Clone, Default)]
pub struct IntegrationRegistry {
    integrations: Arc<RwLock<HashMap<String, Integration>>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `integration`, returning the one it replaced.
    pub fn register(&self, integration: Integration) -> Option<Integration> {
        info!(integration_id = %integration.id(), "integration registered");
        self.integrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(integration.id().to_owned(), integration)
    }

    pub fn find(&self, id: &str) -> Option<Integration> {
        self.integrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn get(&self, id: &str) -> Result<Integration, FlowError> {
        self.find(id)
            .ok_or_else(|| FlowError::UnknownIntegration(id.to_owned()))
    }

    /// Status of `id`; `None` when it is not registered.
    pub fn status(&self, id: &str) -> ExecStatus {
        self.find(id).map_or(ExecStatus::None, |it| it.status())
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .integrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.integrations.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy and unregister `id`.
    pub fn remove(&self, id: &str, ctx: &Context) -> Result<Integration, FlowError> {
        let integration = self.get(id).map_err(|e| e.in_context(ctx))?;
        integration.destroy(ctx)?;
        self.integrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        info!(integration_id = id, "integration removed");
        Ok(integration)
    }

    /// Build, initialise and register the integration `doc` describes.
    ///
    /// An integration already registered under the same id is replaced. If
    /// the new one fails to initialise, the previous one is bound again and
    /// keeps its status. The new integration is left stopped.
    pub fn install(&self, doc: &IntegrationDocument, services: Services, ctx: &Context) -> Result<Integration, FlowError> {
        let definition = doc.definition().map_err(|e| e.in_context(ctx))?;
        let integration = Integration::new(doc.id.clone(), doc.client_id.clone(), definition, services);

        // Old and new share the id, so the old bindings go before the new ones.
        let previous = self.find(&doc.id);
        let previous_status = previous.as_ref().map(Integration::status);
        if let Some(previous) = &previous {
            previous.destroy(ctx)?;
        }

        if let Err(e) = integration.init(doc.config(), ctx) {
            if let (Some(previous), Some(status)) = (&previous, previous_status) {
                Self::restore(previous, status, ctx);
            }
            return Err(e);
        }

        self.register(integration.clone());
        Ok(integration)
    }

    fn restore(previous: &Integration, status: ExecStatus, ctx: &Context) {
        let restored = previous
            .init(previous.config().as_ref().clone(), ctx)
            .and_then(|()| match status {
                ExecStatus::Running => previous.start(ctx),
                _ => Ok(()),
            });
        match restored {
            Ok(()) => info!(integration_id = %previous.id(), "previous integration restored"),
            Err(e) => warn!(integration_id = %previous.id(), error = %e, "could not restore previous integration"),
        }
    }

    /// Stop every running integration, logging failures.
    pub fn stop_all(&self, ctx: &Context) {
        let integrations: Vec<Integration> = self
            .integrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for integration in integrations {
            if integration.status() == ExecStatus::Running {
                if let Err(e) = integration.stop(ctx) {
                    warn!(integration_id = %integration.id(), error = %e, "failed to stop integration");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document(id: &str) -> IntegrationDocument {
        serde_json::from_value(json!({
            "id": id,
            "config": { "k": 1 },
            "workflow": [ { "id": "01", "type": "direct", "msg": { "hello": id } } ]
        }))
        .expect("valid document")
    }

    #[test]
    fn install_registers_a_stopped_integration() {
        let registry = IntegrationRegistry::new();
        let ctx = Context::default();

        let it = registry
            .install(&document("orders"), Services::default(), &ctx)
            .expect("installed");

        assert_eq!(it.status(), ExecStatus::Stopped);
        assert_eq!(registry.status("orders"), ExecStatus::Stopped);
        assert_eq!(registry.status("missing"), ExecStatus::None);
        assert_eq!(*it.config(), json!({ "k": 1 }));
        assert_eq!(registry.ids(), vec!["orders".to_string()]);
    }

    #[test]
    fn reinstall_replaces_and_remove_destroys() {
        let registry = IntegrationRegistry::new();
        let ctx = Context::default();

        let first = registry
            .install(&document("orders"), Services::default(), &ctx)
            .expect("installed");
        registry
            .install(&document("orders"), Services::default(), &ctx)
            .expect("reinstalled");

        assert_eq!(first.status(), ExecStatus::None);
        assert_eq!(registry.len(), 1);

        let removed = registry.remove("orders", &ctx).expect("removed");
        assert_eq!(removed.status(), ExecStatus::None);
        assert!(registry.is_empty());
        assert_eq!(
            registry.remove("orders", &ctx).map(|_| ()).map_err(|e| e.code()),
            Err("IT_NONE")
        );
    }

    #[test]
    fn stop_all_stops_running_integrations() {
        let registry = IntegrationRegistry::new();
        let ctx = Context::default();
        let it = registry
            .install(&document("orders"), Services::default(), &ctx)
            .expect("installed");
        it.start(&ctx).expect("started");

        registry.stop_all(&ctx);
        assert_eq!(it.status(), ExecStatus::Stopped);
    }
}
