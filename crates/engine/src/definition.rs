//! Integration definitions: a workflow graph plus how and when it starts.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use workflow::{FlowError, Graph};

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// When a scheduled integration fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Schedule {
    /// Every `interval_seconds`, `repeat_count` times (0 repeats forever).
    #[serde(rename_all = "camelCase")]
    Periodic {
        interval_seconds: u64,
        #[serde(default)]
        repeat_count: u64,
        #[serde(default)]
        start_time: Option<DateTime<Utc>>,
        #[serde(default)]
        clustered: bool,
    },
    /// On a cron expression (seconds field first).
    Cron {
        expression: String,
        #[serde(default = "default_cron_clustered")]
        clustered: bool,
    },
}

fn default_cron_clustered() -> bool {
    true
}

impl Schedule {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Periodic { .. } => "periodic",
            Self::Cron { .. } => "cron",
        }
    }

    /// Whether one process per cluster should run each tick.
    pub fn is_clustered(&self) -> bool {
        match self {
            Self::Periodic { clustered, .. } | Self::Cron { clustered, .. } => *clustered,
        }
    }

    /// Reject zero intervals and unparsable cron expressions.
    pub fn validate(&self) -> Result<(), FlowError> {
        match self {
            Self::Periodic { interval_seconds: 0, .. } => Err(FlowError::InvalidSchedule(
                "the interval must be at least one second".into(),
            )),
            Self::Periodic { .. } => Ok(()),
            Self::Cron { expression, .. } => cron::Schedule::from_str(expression)
                .map(|_| ())
                .map_err(|e| FlowError::InvalidSchedule(format!("'{expression}': {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// IntegrationDefinition
// ---------------------------------------------------------------------------

/// The static part of an integration.
#[derive(Debug, Clone, Default)]
pub struct IntegrationDefinition {
    graph: Arc<Graph>,
    start_condition: Option<Value>,
    schedule: Option<Schedule>,
}

impl IntegrationDefinition {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph: Arc::new(graph),
            ..Self::default()
        }
    }

    /// Replace the workflow with the one in `doc` (JSON text or a file path).
    pub fn set_workflow(&mut self, doc: &str) -> Result<(), FlowError> {
        self.graph = Arc::new(Graph::parse(doc)?);
        Ok(())
    }

    pub fn with_graph(mut self, graph: Graph) -> Self {
        self.graph = Arc::new(graph);
        self
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Run periodically. Fails while a cron schedule is set.
    pub fn set_periodic_schedule(
        &mut self,
        interval_seconds: u64,
        repeat_count: u64,
        start_time: Option<DateTime<Utc>>,
        clustered: bool,
    ) -> Result<(), FlowError> {
        self.set_schedule(Schedule::Periodic {
            interval_seconds,
            repeat_count,
            start_time,
            clustered,
        })
    }

    /// Run on a cron expression. Fails while a periodic schedule is set.
    pub fn set_cron_schedule(&mut self, expression: impl Into<String>, clustered: bool) -> Result<(), FlowError> {
        self.set_schedule(Schedule::Cron {
            expression: expression.into(),
            clustered,
        })
    }

    /// Set the schedule; the kind cannot change once set.
    pub fn set_schedule(&mut self, schedule: Schedule) -> Result<(), FlowError> {
        if let Some(existing) = &self.schedule {
            if existing.kind_name() != schedule.kind_name() {
                return Err(FlowError::ScheduleConflict {
                    requested: schedule.kind_name(),
                    existing: existing.kind_name(),
                });
            }
        }
        schedule.validate()?;
        self.schedule = Some(schedule);
        Ok(())
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self.schedule, Some(Schedule::Periodic { .. }))
    }

    pub fn is_cron_scheduled(&self) -> bool {
        matches!(self.schedule, Some(Schedule::Cron { .. }))
    }

    pub fn is_clustered(&self) -> bool {
        self.schedule.as_ref().is_some_and(Schedule::is_clustered)
    }

    /// Condition matched by `can_start`. Strings holding JSON are decoded.
    pub fn set_start_condition(&mut self, condition: Option<Value>) {
        self.start_condition = condition.map(workflow::document::decode_embedded);
    }

    pub fn start_condition(&self) -> Option<&Value> {
        self.start_condition.as_ref()
    }
}

// ---------------------------------------------------------------------------
// IntegrationDocument
// ---------------------------------------------------------------------------

/// Everything needed to register an integration, as stored on disk, in the
/// database and on the HTTP API.
///
/// ```json
/// {
///   "id": "orders",
///   "clientId": "acme",
///   "config": { "warehouse": "north" },
///   "workflow": [ { "id": "01", "type": "direct", "msg": {} } ],
///   "startCondition": { "msg.kind": "order" },
///   "schedule": { "kind": "cron", "expression": "0 */5 * * * *" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationDocument {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub config: Value,
    /// An array of step records, or a string holding JSON text or a file path.
    pub workflow: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_condition: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
}

impl IntegrationDocument {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Build and validate the definition this document describes.
    pub fn definition(&self) -> Result<IntegrationDefinition, FlowError> {
        let graph = match &self.workflow {
            Value::String(doc) => Graph::parse(doc)?,
            Value::Null => Graph::default(),
            other => Graph::from_value(other)?,
        };

        let mut definition = IntegrationDefinition::new(graph);
        definition.set_start_condition(self.start_condition.clone());
        if let Some(schedule) = &self.schedule {
            definition.set_schedule(schedule.clone())?;
        }
        Ok(definition)
    }

    /// The configuration, with an absent value read as an empty object.
    pub fn config(&self) -> Value {
        match &self.config {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        }
    }
}
