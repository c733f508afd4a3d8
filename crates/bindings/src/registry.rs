//! Connection and endpoint-binding bookkeeping of one application.
//!
//! All maps live in one [`State`] behind a single lock, so compound updates
//! (add a binding, bump the integration's reference count, index its key)
//! are atomic as a whole.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;
use workflow::FlowError;

use crate::connection::{Connection, ConnectionStatus};

/// What an `(endpoint, integration)` pair is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub connection_id: Option<String>,
    pub config: Value,
}

#[derive(Debug, Default)]
struct State {
    connections: HashMap<String, Connection>,
    /// Connection key -> connection id.
    connection_keys: HashMap<String, String>,
    /// (endpoint id, integration id) -> binding.
    bindings: HashMap<(String, String), Binding>,
    /// Integration id -> number of endpoints bound to it.
    ref_counts: BTreeMap<String, usize>,
    /// (endpoint id, integration key) -> integration id.
    integration_keys: HashMap<(String, String), String>,
}

/// Thread-safe binding tables of one application.
#[derive(Debug, Default)]
pub struct BindingRegistry {
    state: RwLock<State>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Create (or re-create) `id` as an unconnected connection, indexed by
    /// `key` when one is given.
    pub fn create_connection(&self, id: &str, config: Value, key: Option<String>) {
        let mut state = self.write();
        state.connection_keys.retain(|_, conn| conn != id);
        if let Some(key) = key.filter(|k| !k.is_empty()) {
            state.connection_keys.insert(key, id.to_owned());
        }
        state.connections.insert(id.to_owned(), Connection::new(id, config));
    }

    /// Remove `id` and its key. Fails with `CONN_RUN` while connected.
    pub fn remove_connection(&self, id: &str) -> Result<(), FlowError> {
        let mut state = self.write();
        if state.connections.get(id).is_some_and(Connection::is_connected) {
            return Err(FlowError::ConnectionActive(id.to_owned()));
        }
        state.connections.remove(id);
        state.connection_keys.retain(|_, conn| conn != id);
        Ok(())
    }

    /// Fails with `CONN_NONE` when `id` was never created.
    pub fn set_connection_status(&self, id: &str, status: ConnectionStatus) -> Result<(), FlowError> {
        let mut state = self.write();
        let connection = state
            .connections
            .get_mut(id)
            .ok_or_else(|| FlowError::UnknownConnection(id.to_owned()))?;
        connection.status = status;
        Ok(())
    }

    pub fn connection_status(&self, id: &str) -> ConnectionStatus {
        self.read()
            .connections
            .get(id)
            .map_or(ConnectionStatus::None, |c| c.status)
    }

    pub fn connection(&self, id: &str) -> Option<Connection> {
        self.read().connections.get(id).cloned()
    }

    /// Connection ids, sorted; only the connected ones when `connected_only`.
    pub fn connection_ids(&self, connected_only: bool) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .connections
            .values()
            .filter(|c| !connected_only || c.is_connected())
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn connection_for_key(&self, key: &str) -> Option<String> {
        self.read().connection_keys.get(key).cloned()
    }

    // ------------------------------------------------------------------
    // Endpoint bindings
    // ------------------------------------------------------------------

    /// Bind `endpoint_id` to `integration_id` through `connection_id`.
    ///
    /// Binding a pair that is already bound replaces it without counting the
    /// integration twice. `integration_key`, if any, lets inbound calls
    /// address the integration directly.
    pub fn add_binding(
        &self,
        endpoint_id: &str,
        integration_id: &str,
        connection_id: Option<String>,
        config: Value,
        integration_key: Option<String>,
    ) {
        let mut state = self.write();
        let key = (endpoint_id.to_owned(), integration_id.to_owned());
        let binding = Binding {
            connection_id: connection_id.filter(|c| !c.is_empty()),
            config,
        };

        if state.bindings.insert(key, binding).is_none() {
            *state.ref_counts.entry(integration_id.to_owned()).or_default() += 1;
        }

        state
            .integration_keys
            .retain(|(ep, _), it| !(ep == endpoint_id && it == integration_id));
        if let Some(integration_key) = integration_key.filter(|k| !k.is_empty()) {
            state.integration_keys.insert(
                (endpoint_id.to_owned(), integration_key),
                integration_id.to_owned(),
            );
        }
        debug!(endpoint_id, integration_id, "endpoint bound");
    }

    /// Returns whether the pair was bound.
    pub fn remove_binding(&self, endpoint_id: &str, integration_id: &str) -> bool {
        let mut state = self.write();
        let key = (endpoint_id.to_owned(), integration_id.to_owned());
        if state.bindings.remove(&key).is_none() {
            return false;
        }

        if let Some(count) = state.ref_counts.get_mut(integration_id) {
            *count -= 1;
            if *count == 0 {
                state.ref_counts.remove(integration_id);
            }
        }
        state
            .integration_keys
            .retain(|(ep, _), it| !(ep == endpoint_id && it == integration_id));
        debug!(endpoint_id, integration_id, "endpoint unbound");
        true
    }

    pub fn has_binding(&self, endpoint_id: &str, integration_id: &str) -> bool {
        self.read()
            .bindings
            .contains_key(&(endpoint_id.to_owned(), integration_id.to_owned()))
    }

    pub fn binding(&self, endpoint_id: &str, integration_id: &str) -> Option<Binding> {
        self.read()
            .bindings
            .get(&(endpoint_id.to_owned(), integration_id.to_owned()))
            .cloned()
    }

    /// Integrations with at least one bound endpoint, sorted.
    pub fn relative_integrations(&self) -> Vec<String> {
        self.read().ref_counts.keys().cloned().collect()
    }

    pub fn integration_for_key(&self, endpoint_id: &str, key: &str) -> Option<String> {
        self.read()
            .integration_keys
            .get(&(endpoint_id.to_owned(), key.to_owned()))
            .filter(|id| !id.is_empty())
            .cloned()
    }

    /// Integrations bound to `endpoint_id` through `connection_id`, sorted.
    pub fn integrations_on_connection(&self, endpoint_id: &str, connection_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .bindings
            .iter()
            .filter(|((ep, _), binding)| {
                ep == endpoint_id && binding.connection_id.as_deref() == Some(connection_id)
            })
            .map(|((_, it), _)| it.clone())
            .collect();
        ids.sort();
        ids
    }
}
