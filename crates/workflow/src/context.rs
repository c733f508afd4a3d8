//! Per-flow context used for log and error correlation.

use std::collections::BTreeMap;

use tracing::Span;
use uuid::Uuid;

/// Correlation data carried by one logical flow of control.
///
/// The id ties log lines and errors back to the flow that produced them; the
/// info map holds the `key=value` pairs (application, endpoint, connection
/// ...) that describe where in the flow a message was emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    id: Option<String>,
    info: BTreeMap<String, String>,
}

impl Context {
    /// A context with a fresh random id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            info: BTreeMap::new(),
        }
    }

    /// Builder form of [`Context::set_info`].
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_info(key, value);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.info.insert(key.into(), value.into());
    }

    pub fn remove_info(&mut self, key: &str) {
        self.info.remove(key);
    }

    pub fn clear_info(&mut self) {
        self.info.clear();
    }

    pub fn info(&self) -> &BTreeMap<String, String> {
        &self.info
    }

    /// The info map rendered as `key=value, key=value`.
    pub fn info_string(&self) -> String {
        self.info
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// A `tracing` span carrying this context's id and info.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "flow",
            ctx = self.id.as_deref().unwrap_or("-"),
            info = %self.info_string()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_renders_sorted_pairs() {
        let mut ctx = Context::with_id("c1")
            .with_info("endpointId", "order")
            .with_info("applicationId", "shop");
        assert_eq!(ctx.info_string(), "applicationId=shop, endpointId=order");

        ctx.remove_info("endpointId");
        assert_eq!(ctx.info_string(), "applicationId=shop");

        ctx.clear_info();
        assert!(ctx.info().is_empty());
        assert_eq!(ctx.id(), Some("c1"));
    }

    #[test]
    fn new_contexts_get_distinct_ids() {
        assert_ne!(Context::new().id(), Context::new().id());
        assert_eq!(Context::default().id(), None);
    }
}
