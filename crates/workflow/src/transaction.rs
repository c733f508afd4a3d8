//! The execution cursor of one run through a workflow graph.
//!
//! A [`Transaction`] is owned by exactly one flow of control. Fan-out
//! creates independent child transactions with [`Transaction::branch`];
//! nothing is shared between them.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::document::normalize_numbers;
use crate::step::EXCEPTION_STEP_ID;
use crate::{Context, FlowError};

/// Property under which [`Transaction::move_to_exception`] stores its detail.
pub const EXCEPTION_PROPERTY: &str = "exception";

#[derive(Debug, Clone)]
pub struct Transaction {
    id: String,
    integration_id: String,
    client_id: Option<String>,
    /// `None` once the transaction is finished.
    step: Option<String>,
    previous_step: Option<String>,
    message: Option<Value>,
    properties: Map<String, Value>,
    /// Integration configuration as it was when the transaction was created.
    config: Option<Value>,
    /// Sticky: never reset once set.
    failed: bool,
    /// Original item index of a fan-out child.
    branch_index: Option<usize>,
    ctx: Context,
    last_read: Instant,
}

impl Transaction {
    /// A transaction of `integration_id` positioned at `step`.
    ///
    /// Starting at the exception step marks the transaction failed.
    pub fn new(integration_id: impl Into<String>, step: Option<String>) -> Self {
        let failed = step.as_deref() == Some(EXCEPTION_STEP_ID);
        Self {
            id: Uuid::new_v4().to_string(),
            integration_id: integration_id.into(),
            client_id: None,
            step,
            previous_step: None,
            message: None,
            properties: Map::new(),
            config: None,
            failed,
            branch_index: None,
            ctx: Context::default(),
            last_read: Instant::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_message(mut self, message: Option<Value>) -> Self {
        self.message = message.filter(|m| !m.is_null());
        self
    }

    pub fn with_previous_step(mut self, previous_step: Option<String>) -> Self {
        self.previous_step = previous_step;
        self
    }

    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_config(mut self, config: Option<Value>) -> Self {
        self.config = config;
        self
    }

    /// Mark failed. Has no effect when `failed` is false: the flag is sticky.
    pub fn with_failed(mut self, failed: bool) -> Self {
        self.failed |= failed;
        self
    }

    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn integration_id(&self) -> &str {
        &self.integration_id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn current_step(&self) -> Option<&str> {
        self.step.as_deref()
    }

    pub fn previous_step(&self) -> Option<&str> {
        self.previous_step.as_deref()
    }

    pub fn message(&self) -> Option<&Value> {
        self.message.as_ref()
    }

    /// Replace the message. A JSON `null` clears it.
    pub fn set_message(&mut self, message: Value) {
        self.message = (!message.is_null()).then_some(message);
    }

    pub fn take_message(&mut self) -> Option<Value> {
        self.message.take()
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: Value) {
        self.properties.insert(key.into(), value);
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    pub fn config(&self) -> Option<&Value> {
        self.config.as_ref()
    }

    pub fn branch_index(&self) -> Option<usize> {
        self.branch_index
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub fn is_finished(&self) -> bool {
        self.step.is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    pub fn move_to_step(&mut self, next: impl Into<String>) {
        let next = next.into();
        if next == EXCEPTION_STEP_ID {
            self.failed = true;
        }
        self.previous_step = self.step.replace(next);
    }

    /// Divert to the exception step, recording `detail` in the properties.
    pub fn move_to_exception(&mut self, detail: impl Into<String>) {
        self.properties
            .insert(EXCEPTION_PROPERTY.to_owned(), Value::String(detail.into()));
        self.move_to_step(EXCEPTION_STEP_ID);
    }

    /// Finish the transaction. The step it finished on becomes the previous step.
    pub fn move_to_end(&mut self) {
        if let Some(step) = self.step.take() {
            self.previous_step = Some(step);
        }
    }

    /// Milliseconds since the previous call (or since creation).
    ///
    /// Resets the baseline, so it is meant for per-hop timing from the
    /// flow that owns the transaction.
    pub fn elapsed_millis(&mut self) -> u128 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_read).as_millis();
        self.last_read = now;
        elapsed
    }

    /// A child transaction carrying the `index`-th item of a fan-out.
    ///
    /// The child starts at `entry_step` with the parent's current step as its
    /// previous step, and copies the parent's integration, client,
    /// properties and config.
    pub fn branch(&self, index: usize, item: Value, entry_step: &str) -> Self {
        let mut ctx = self.ctx.clone();
        ctx.set_info("branch", index.to_string());

        Self {
            id: format!("{}.{}", self.id, index),
            integration_id: self.integration_id.clone(),
            client_id: self.client_id.clone(),
            step: Some(entry_step.to_owned()),
            previous_step: self.step.clone(),
            message: (!item.is_null()).then_some(item),
            properties: self.properties.clone(),
            config: self.config.clone(),
            failed: false,
            branch_index: Some(index),
            ctx,
            last_read: Instant::now(),
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            client_id: self.client_id.clone(),
            step: self.step.clone(),
            previous_step: self.previous_step.clone(),
            message: self.message.clone(),
            config: self.config.clone(),
            properties: self.properties.clone(),
            failed: self.failed,
            integration_id: Some(self.integration_id.clone()),
            id: Some(self.id.clone()),
        }
    }

    pub fn to_json(&self) -> Result<String, FlowError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Rebuild a transaction from a snapshot, under `ctx`.
    pub fn from_snapshot(snapshot: TransactionSnapshot, ctx: Context) -> Self {
        let mut trx = Self::new(String::new(), None).with_context(ctx);
        trx.update_all(snapshot);
        trx
    }

    /// Overwrite this transaction's state from the JSON text of a snapshot.
    pub fn restore(&mut self, json: &str) -> Result<(), FlowError> {
        let snapshot: TransactionSnapshot = serde_json::from_str(json)?;
        self.update_all(snapshot);
        Ok(())
    }

    /// Overwrite every field present in `snapshot`.
    ///
    /// Properties are replaced wholesale; numbers are normalised to the
    /// standard integer and float representations.
    pub fn update_all(&mut self, snapshot: TransactionSnapshot) {
        if let Some(id) = snapshot.id {
            self.id = id;
        }
        if let Some(integration_id) = snapshot.integration_id {
            self.integration_id = integration_id;
        }
        self.client_id = snapshot.client_id;
        self.step = snapshot.step;
        self.previous_step = snapshot.previous_step;
        self.message = snapshot
            .message
            .map(normalize_numbers)
            .filter(|m| !m.is_null());
        self.config = snapshot.config.map(normalize_numbers);
        self.failed = snapshot.failed;

        self.properties.clear();
        self.properties.extend(
            snapshot
                .properties
                .into_iter()
                .map(|(k, v)| (k, normalize_numbers(v))),
        );
    }
}

/// Serialised form of a transaction, the unit of persistence and hand-off.
///
/// Absent fields are omitted. `stepFrom` and `msg` are accepted as aliases
/// of `previousStep` and `message` on input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, alias = "stepFrom", skip_serializing_if = "Option::is_none")]
    pub previous_step: Option<String>,
    #[serde(default, alias = "msg", skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}
