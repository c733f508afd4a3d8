//! Collaborator contracts consumed by integrations, and the bundle that
//! carries them.

use std::sync::Arc;

use async_trait::async_trait;
use processors::{ProcessorRegistry, ScriptRuntime};
use serde_json::Value;
use workflow::{Context, EndpointStep, FlowError};

use crate::condition::FieldMatcher;
use crate::definition::Schedule;
use crate::storage::SnapshotStore;
use crate::EngineConfig;

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Decides whether a message (and the integration configuration) matches a
/// start condition.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &Value, message: Option<&Value>, config: &Value) -> Result<bool, FlowError>;
}

/// The applications' endpoints, as seen from an integration.
#[async_trait]
pub trait EndpointDirectory: Send + Sync {
    /// Bind `endpoint` of its application to `integration_id`.
    fn bind_endpoint(&self, integration_id: &str, endpoint: &EndpointStep) -> Result<(), FlowError>;

    fn unbind_endpoint(&self, integration_id: &str, endpoint: &EndpointStep) -> Result<(), FlowError>;

    /// Call an outbound endpoint on behalf of `integration_id`.
    ///
    /// `None` means the endpoint produced no reply.
    async fn call_outbound_endpoint(
        &self,
        application_id: &str,
        endpoint_id: &str,
        integration_id: &str,
        message: Value,
        ctx: &Context,
    ) -> Result<Option<Value>, FlowError>;
}

/// Work fired by a [`Scheduler`].
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn run(&self, task_id: &str, ctx: Context);
}

/// Periodic and cron triggers.
pub trait Scheduler: Send + Sync {
    /// Schedule `task`, replacing any task already registered as `task_id`.
    fn schedule_task(
        &self,
        task_id: &str,
        schedule: &Schedule,
        task: Arc<dyn ScheduledTask>,
        ctx: &Context,
    ) -> Result<(), FlowError>;

    fn remove_scheduled_task(&self, task_id: &str, ctx: &Context) -> Result<(), FlowError>;

    fn has_task(&self, task_id: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Everything an integration talks to, besides its own definition.
///
/// Absent collaborators make the steps that need them fail when they run.
#[derive(Clone)]
pub struct Services {
    pub config: EngineConfig,
    pub processors: Arc<ProcessorRegistry>,
    pub scripts: Option<Arc<dyn ScriptRuntime>>,
    pub endpoints: Option<Arc<dyn EndpointDirectory>>,
    pub conditions: Arc<dyn ConditionEvaluator>,
    pub scheduler: Option<Arc<dyn Scheduler>>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            processors: Arc::new(ProcessorRegistry::with_builtins()),
            scripts: None,
            endpoints: None,
            conditions: Arc::new(FieldMatcher),
            scheduler: None,
            snapshots: None,
        }
    }
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = Arc::new(processors);
        self
    }

    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptRuntime>) -> Self {
        self.scripts = Some(scripts);
        self
    }

    pub fn with_endpoints(mut self, endpoints: Arc<dyn EndpointDirectory>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn with_conditions(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }
}
