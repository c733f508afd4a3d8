//! Processor-level error type.

use thiserror::Error;

/// Errors returned by a processor or a script.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable` — the call is repeated with exponential back-off.
/// - everything else — the step fails immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// Transient failure; the engine should re-try the call.
    #[error("retryable processor error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal processor error: {0}")]
    Fatal(String),

    #[error("no processor registered as '{module_id}/{class_name}'")]
    UnknownProcessor { module_id: String, class_name: String },

    #[error("no script registered as '{0}'")]
    UnknownScript(String),
}

impl ProcessorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
