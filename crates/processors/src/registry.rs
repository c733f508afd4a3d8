//! Lookup tables for native processors and scripts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use workflow::Transaction;

use crate::builtin::Log;
use crate::{Processor, ProcessorError, ScriptRuntime};

/// Module id of the processors shipped with this crate.
pub const BUILTIN_MODULE: &str = "builtin";

/// Native processors keyed by `(module id, class name)`.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<(String, String), Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in processors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(BUILTIN_MODULE, "Log", Arc::new(Log::default()));
        registry
    }

    /// Register `processor`, replacing any previous one under the same key.
    pub fn register(
        &mut self,
        module_id: impl Into<String>,
        class_name: impl Into<String>,
        processor: Arc<dyn Processor>,
    ) {
        self.processors
            .insert((module_id.into(), class_name.into()), processor);
    }

    pub fn get(&self, module_id: &str, class_name: &str) -> Result<Arc<dyn Processor>, ProcessorError> {
        self.processors
            .get(&(module_id.to_owned(), class_name.to_owned()))
            .cloned()
            .ok_or_else(|| ProcessorError::UnknownProcessor {
                module_id: module_id.to_owned(),
                class_name: class_name.to_owned(),
            })
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

/// A [`ScriptRuntime`] whose "scripts" are processors registered by id.
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: HashMap<String, Arc<dyn Processor>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, script_id: impl Into<String>, script: Arc<dyn Processor>) {
        self.scripts.insert(script_id.into(), script);
    }
}

#[async_trait]
impl ScriptRuntime for ScriptRegistry {
    async fn run(&self, script_id: &str, trx: &mut Transaction) -> Result<(), ProcessorError> {
        let script = self
            .scripts
            .get(script_id)
            .ok_or_else(|| ProcessorError::UnknownScript(script_id.to_owned()))?;
        script.process(trx).await
    }
}
