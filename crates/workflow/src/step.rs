//! Step definitions: the nodes of a workflow graph.
//!
//! Steps are parsed from the records of a workflow definition document:
//!
//! ```json
//! [
//!   { "id": "01", "type": "direct", "msg": { "hello": "world" } },
//!   { "id": "02", "from": "01", "type": "processor", "subtype": "javascript",
//!     "script": "enrich", "async": false },
//!   { "id": "03", "from": "02", "type": "processor", "subtype": "java",
//!     "module": "billing", "class": "Invoice" },
//!   { "id": "04", "from": ["02", "03"], "type": "endpoint", "direction": "out",
//!     "app": "erp", "endpoint": "createOrder", "connection": "main",
//!     "config": { "retries": 2 } },
//!   { "id": "05", "from": "04", "type": "forEach" },
//!   { "id": "06", "from": "05", "type": "collect" }
//! ]
//! ```

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::document::decode_embedded;

/// Reserved id of the step that handles failures.
pub const EXCEPTION_STEP_ID: &str = "exception";

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single node of the workflow graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique within the graph.
    pub id: String,
    /// Free-form description, not interpreted.
    pub desc: Option<String>,
    /// Ids of the predecessor steps; empty marks a candidate first step.
    pub from: Vec<String>,
    pub kind: StepKind,
}

/// The fixed set of step kinds the engine knows how to run.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Emit a fixed message.
    Direct { message: Value },
    /// Hand the transaction to a script or a native processor.
    Processor(ProcessorRef),
    /// Receive from (`In`) or call (`Out`) an application endpoint.
    Endpoint(EndpointStep),
    /// Start a fan-out region over the items of the current message.
    ForEach,
    /// End a fan-out region, gathering the items back into one array.
    Collect,
}

/// Which handler a processor step invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorRef {
    /// A script module run by the script runtime.
    Script { script_id: String, is_async: bool },
    /// A native processor registered under `module_id` / `class_name`.
    Native { module_id: String, class_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// An endpoint step, bound to an application's endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointStep {
    pub application_id: String,
    pub endpoint_id: String,
    pub direction: Direction,
    pub connection_id: Option<String>,
    pub config: Value,
}

impl Step {
    pub fn new(id: impl Into<String>, from: Vec<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            desc: None,
            from,
            kind,
        }
    }

    /// Whether the step was declared without predecessors.
    pub fn is_root(&self) -> bool {
        self.from.is_empty()
    }

    pub fn is_collect(&self) -> bool {
        matches!(self.kind, StepKind::Collect)
    }

    pub fn is_for_each(&self) -> bool {
        matches!(self.kind, StepKind::ForEach)
    }

    /// `Some(flag)` for script processor steps, `None` for every other kind.
    pub fn is_async(&self) -> Option<bool> {
        match &self.kind {
            StepKind::Processor(ProcessorRef::Script { is_async, .. }) => Some(*is_async),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Option<&EndpointStep> {
        match &self.kind {
            StepKind::Endpoint(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    /// Short name of the step kind, as used in definition documents.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            StepKind::Direct { .. } => "direct",
            StepKind::Processor(_) => "processor",
            StepKind::Endpoint(_) => "endpoint",
            StepKind::ForEach => "forEach",
            StepKind::Collect => "collect",
        }
    }
}

// ---------------------------------------------------------------------------
// Definition records
// ---------------------------------------------------------------------------

/// `from` may be omitted, a single id, an array of ids, or a string holding
/// a JSON array of ids.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FromField {
    One(String),
    Many(Vec<String>),
}

impl FromField {
    /// `None` when a string that opens like an array does not parse as one.
    fn into_ids(self) -> Option<Vec<String>> {
        match self {
            Self::Many(ids) => Some(ids),
            Self::One(id) if id.trim_start().starts_with('[') => serde_json::from_str(&id).ok(),
            Self::One(id) if id.is_empty() => Some(Vec::new()),
            Self::One(id) => Some(vec![id]),
        }
    }
}

/// Raw shape of one record of a definition document.
#[derive(Debug, Deserialize)]
struct StepRecord {
    id: String,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    from: Option<FromField>,
    #[serde(rename = "type")]
    step_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    msg: Option<Value>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default, rename = "async")]
    is_async: Option<bool>,
    #[serde(default)]
    module: Option<String>,
    #[serde(default, rename = "class")]
    class_name: Option<String>,
    #[serde(default)]
    app: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    connection: Option<String>,
    #[serde(default)]
    config: Option<Value>,
}

impl StepRecord {
    fn into_kind(self) -> Option<(String, Option<String>, Vec<String>, StepKind)> {
        let from = match self.from {
            Some(field) => field.into_ids()?,
            None => Vec::new(),
        };

        let kind = match self.step_type.as_str() {
            "direct" => StepKind::Direct {
                message: self.msg.map(decode_embedded).unwrap_or(Value::Null),
            },
            "processor" => match self.subtype.as_deref() {
                Some("javascript") => StepKind::Processor(ProcessorRef::Script {
                    script_id: self.script?,
                    is_async: self.is_async.unwrap_or(false),
                }),
                Some("java") => StepKind::Processor(ProcessorRef::Native {
                    module_id: self.module?,
                    class_name: self.class_name?,
                }),
                _ => return None,
            },
            "endpoint" => StepKind::Endpoint(EndpointStep {
                application_id: self.app?,
                endpoint_id: self.endpoint?,
                direction: if self.direction.as_deref() == Some("in") {
                    Direction::In
                } else {
                    Direction::Out
                },
                connection_id: self.connection.filter(|c| !c.is_empty()),
                config: self
                    .config
                    .map(decode_embedded)
                    .unwrap_or_else(|| Value::Object(Default::default())),
            }),
            "forEach" => StepKind::ForEach,
            "collect" => StepKind::Collect,
            _ => return None,
        };

        Some((self.id, self.desc, from, kind))
    }
}

/// Parse the records of a definition document into steps.
///
/// Records with an unknown `type`/`subtype` combination, a malformed
/// `from`, or missing the fields their kind needs, are skipped with a
/// warning.
pub fn parse_steps(records: &[Value]) -> Vec<Step> {
    records
        .iter()
        .enumerate()
        .filter_map(|(index, record)| {
            let parsed = serde_json::from_value::<StepRecord>(record.clone())
                .ok()
                .and_then(StepRecord::into_kind);

            match parsed {
                Some((id, desc, from, kind)) => Some(Step { id, desc, from, kind }),
                None => {
                    warn!(index, record = %record, "unsupported step record, skipped");
                    None
                }
            }
        })
        .collect()
}
