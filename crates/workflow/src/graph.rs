//! The workflow graph, built once from a definition document.
//!
//! Rules enforced while building:
//! 1. Step ids must be unique.
//! 2. A forEach region (the first-successor chain from a forEach step to its
//!    collect step) must not branch and must not contain another forEach.
//!
//! Deliberately lenient:
//! - records of unknown kinds are skipped (see [`crate::step::parse_steps`]);
//! - `from` ids that name no step simply produce no edge;
//! - when several steps have no predecessors, the last one declared becomes
//!   the first step.
//!
//! A graph is immutable. Changing it means building a new one (see
//! [`Graph::with_direct_message`]).

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde_json::Value;
use tracing::warn;

use crate::step::{parse_steps, Step, StepKind, EXCEPTION_STEP_ID};
use crate::FlowError;

/// Validated, queryable step graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Steps in declaration order.
    steps: Vec<Step>,
    /// Step id -> index into `steps`.
    by_id: HashMap<String, usize>,
    /// Step id -> indices of its successors, in declaration order.
    next: HashMap<String, Vec<usize>>,
    first: Option<usize>,
}

impl Graph {
    /// Build a graph from JSON text, or from the file at the given path.
    ///
    /// Text that does not start with `[` or `{` is taken as a path. Blank
    /// text yields an empty graph.
    pub fn parse(doc: &str) -> Result<Self, FlowError> {
        let trimmed = doc.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            let value: Value = serde_json::from_str(trimmed)?;
            Self::from_value(&value)
        } else {
            Self::from_file(trimmed)
        }
    }

    /// Read and build the definition stored at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        Self::from_value(&value)
    }

    /// Build from a parsed definition document, which must be an array.
    pub fn from_value(doc: &Value) -> Result<Self, FlowError> {
        let records = doc.as_array().ok_or_else(|| {
            FlowError::InvalidDefinition("the workflow must be an array of steps".into())
        })?;
        Self::from_steps(parse_steps(records))
    }

    /// Build from already-parsed steps.
    pub fn from_steps(steps: Vec<Step>) -> Result<Self, FlowError> {
        let mut by_id = HashMap::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            if by_id.insert(step.id.clone(), index).is_some() {
                return Err(FlowError::InvalidDefinition(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let mut next: HashMap<String, Vec<usize>> = HashMap::new();
        let mut first = None;

        for (index, step) in steps.iter().enumerate() {
            if step.is_root() {
                if step.id == EXCEPTION_STEP_ID {
                    continue;
                }
                if let Some(previous) = first.replace(index) {
                    let previous: &Step = &steps[previous];
                    warn!(
                        replaced = %previous.id,
                        first = %step.id,
                        "several steps have no predecessor, the last one declared starts the graph"
                    );
                }
            } else {
                for from in &step.from {
                    next.entry(from.clone()).or_default().push(index);
                }
            }
        }

        let graph = Self {
            steps,
            by_id,
            next,
            first,
        };
        graph.check_regions()?;
        Ok(graph)
    }

    /// Reject forEach regions that branch or nest.
    fn check_regions(&self) -> Result<(), FlowError> {
        for step in self.steps.iter().filter(|s| s.is_for_each()) {
            let mut current = step;
            let mut visited = HashSet::new();
            while visited.insert(current.id.as_str()) {
                let successors = self.successor_indices(&current.id);
                if successors.len() > 1 {
                    return Err(FlowError::InvalidDefinition(format!(
                        "forEach region '{}' branches at step '{}'",
                        step.id, current.id
                    )));
                }
                let Some(&next) = successors.first() else { break };
                current = &self.steps[next];
                if current.is_collect() {
                    break;
                }
                if current.is_for_each() {
                    return Err(FlowError::InvalidDefinition(format!(
                        "forEach region '{}' contains nested forEach '{}'",
                        step.id, current.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn successor_indices(&self, step_id: &str) -> &[usize] {
        self.next.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All steps, in declaration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.by_id.get(id).map(|&index| &self.steps[index])
    }

    /// The step with no predecessors that is not the exception step.
    pub fn first_step(&self) -> Option<&Step> {
        self.first.map(|index| &self.steps[index])
    }

    pub fn exception_step(&self) -> Option<&Step> {
        self.step(EXCEPTION_STEP_ID)
    }

    /// Steps that name `step_id` in their `from` list, in declaration order.
    ///
    /// Empty when `step_id` is the last step of its path.
    pub fn next_steps(&self, step_id: &str) -> Vec<&Step> {
        self.successor_indices(step_id)
            .iter()
            .map(|&index| &self.steps[index])
            .collect()
    }

    /// Find the collect step paired with the forEach step `for_each_id`.
    ///
    /// Follows the first successor at every hop until a collect step is
    /// reached; `None` if the chain ends first.
    pub fn next_collect_step(&self, for_each_id: &str) -> Option<&Step> {
        let mut visited = HashSet::new();
        let mut current = *self.successor_indices(for_each_id).first()?;

        while !self.steps[current].is_collect() {
            if !visited.insert(current) {
                return None;
            }
            current = *self.successor_indices(&self.steps[current].id).first()?;
        }
        Some(&self.steps[current])
    }

    /// `from` references that name no step, as `(step, missing predecessor)`.
    pub fn unresolved_edges(&self) -> Vec<(&str, &str)> {
        self.steps
            .iter()
            .flat_map(|step| {
                step.from
                    .iter()
                    .filter(|from| !self.by_id.contains_key(from.as_str()))
                    .map(move |from| (step.id.as_str(), from.as_str()))
            })
            .collect()
    }

    /// A copy of this graph with the message of direct step `step_id` replaced.
    pub fn with_direct_message(&self, step_id: &str, message: Value) -> Result<Self, FlowError> {
        let index = *self
            .by_id
            .get(step_id)
            .ok_or_else(|| FlowError::UnknownStep(step_id.to_owned()))?;

        let mut graph = self.clone();
        match &mut graph.steps[index].kind {
            StepKind::Direct { message: current } => *current = message,
            _ => {
                return Err(FlowError::InvalidDefinition(format!(
                    "step '{step_id}' is not a direct step"
                )))
            }
        }
        Ok(graph)
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::step::{Direction, ProcessorRef};

    fn sample() -> Graph {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/workflow.json");
        Graph::parse(path).expect("sample workflow should load")
    }

    fn ids(steps: Vec<&Step>) -> Vec<&str> {
        steps.into_iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn sample_workflow_has_expected_shape() {
        let graph = sample();

        assert_eq!(graph.len(), 8);
        assert_eq!(graph.first_step().map(|s| s.id.as_str()), Some("01"));
        assert_eq!(graph.exception_step().map(|s| s.id.as_str()), Some("exception"));

        let counts: Vec<usize> = ["01", "02", "03", "04", "05", "06"]
            .iter()
            .map(|id| graph.next_steps(id).len())
            .collect();
        assert_eq!(counts, vec![2, 2, 1, 1, 1, 1]);
        assert!(graph.next_steps("07").is_empty());

        assert_eq!(graph.next_collect_step("05").map(|s| s.id.as_str()), Some("07"));
    }

    #[test]
    fn sample_workflow_keeps_step_details() {
        let graph = sample();

        let endpoint = graph.step("03").and_then(Step::endpoint).expect("endpoint step");
        assert_eq!(endpoint.direction, Direction::Out);
        assert_eq!(endpoint.config["callLimitPerSecond"], 100);

        assert_eq!(graph.step("02").and_then(Step::is_async), Some(false));
        assert_eq!(graph.step("04").and_then(Step::is_async), Some(true));
    }

    #[test]
    fn next_steps_invert_from_lists() {
        let graph = Graph::parse(
            r#"[
                { "id": "a", "type": "direct", "msg": {} },
                { "id": "b", "from": "a", "type": "collect" },
                { "id": "c", "from": ["a", "b"], "type": "collect" },
                { "id": "d", "from": "ghost", "type": "collect" }
            ]"#,
        )
        .expect("valid graph");

        assert_eq!(ids(graph.next_steps("a")), vec!["b", "c"]);
        assert_eq!(ids(graph.next_steps("b")), vec!["c"]);
        assert!(graph.next_steps("c").is_empty());
        assert!(graph.next_steps("ghost").is_empty());
        assert_eq!(graph.unresolved_edges(), vec![("d", "ghost")]);
    }

    #[test]
    fn exception_step_is_never_first() {
        let graph = Graph::parse(
            r#"[
                { "id": "start", "type": "direct", "msg": {} },
                { "id": "exception", "type": "processor", "subtype": "java",
                  "module": "ops", "class": "Alert" }
            ]"#,
        )
        .expect("valid graph");

        assert_eq!(graph.first_step().map(|s| s.id.as_str()), Some("start"));
        assert!(graph.exception_step().is_some());
    }

    #[test]
    fn last_root_wins_first_step() {
        let graph = Graph::parse(
            r#"[
                { "id": "a", "type": "direct", "msg": 1 },
                { "id": "b", "type": "direct", "msg": 2 }
            ]"#,
        )
        .expect("valid graph");

        assert_eq!(graph.first_step().map(|s| s.id.as_str()), Some("b"));
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let err = Graph::parse(
            r#"[
                { "id": "a", "type": "direct", "msg": 1 },
                { "id": "a", "from": "a", "type": "collect" }
            ]"#,
        )
        .expect_err("duplicate ids");

        assert_eq!(err.code(), "DEF_INVALID");
    }

    #[test]
    fn branching_region_is_rejected() {
        let err = Graph::parse(
            r#"[
                { "id": "loop", "type": "forEach" },
                { "id": "x", "from": "loop", "type": "processor", "subtype": "java",
                  "module": "m", "class": "X" },
                { "id": "y", "from": "x", "type": "collect" },
                { "id": "z", "from": "x", "type": "collect" }
            ]"#,
        )
        .expect_err("region branches at x");

        assert!(err.to_string().contains("branches at step 'x'"));
    }

    #[test]
    fn nested_region_is_rejected() {
        let err = Graph::parse(
            r#"[
                { "id": "outer", "type": "forEach" },
                { "id": "inner", "from": "outer", "type": "forEach" },
                { "id": "done", "from": "inner", "type": "collect" }
            ]"#,
        )
        .expect_err("nested forEach");

        assert!(err.to_string().contains("nested forEach 'inner'"));
    }

    #[test]
    fn collect_lookup_without_collect_is_none() {
        let graph = Graph::from_steps(vec![
            Step::new("loop", vec![], StepKind::ForEach),
            Step::new(
                "work",
                vec!["loop".into()],
                StepKind::Processor(ProcessorRef::Native {
                    module_id: "m".into(),
                    class_name: "W".into(),
                }),
            ),
        ])
        .expect("valid graph");

        assert!(graph.next_collect_step("loop").is_none());
        assert!(graph.next_collect_step("work").is_none());
    }

    #[test]
    fn direct_message_update_builds_new_graph() {
        let graph = Graph::parse(r#"[ { "id": "a", "type": "direct", "msg": { "v": 1 } } ]"#)
            .expect("valid graph");

        let updated = graph
            .with_direct_message("a", json!({ "v": 2 }))
            .expect("direct step");

        assert_eq!(graph.step("a").map(|s| &s.kind), Some(&StepKind::Direct { message: json!({ "v": 1 }) }));
        assert_eq!(updated.step("a").map(|s| &s.kind), Some(&StepKind::Direct { message: json!({ "v": 2 }) }));
        assert_eq!(
            graph.with_direct_message("missing", json!(null)).map(|_| ()).map_err(|e| e.code()),
            Err("STEP_NONE")
        );
    }

    #[test]
    fn blank_document_is_an_empty_graph() {
        let graph = Graph::parse("   ").expect("empty graph");
        assert!(graph.is_empty());
        assert!(graph.first_step().is_none());
    }
}
