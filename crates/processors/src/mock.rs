//! `MockProcessor` — a test double for [`Processor`].
//!
//! Useful in engine and binding tests where a real processor is either
//! unavailable or irrelevant.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use workflow::Transaction;

use crate::{Processor, ProcessorError};

type MapFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
type DelayFn = Arc<dyn Fn(&Value) -> Duration + Send + Sync>;

/// Behaviour injected into `MockProcessor` at construction time.
pub enum MockBehaviour {
    /// Leave the transaction untouched.
    PassThrough,
    /// Replace the message with a specific JSON value.
    SetMessage(Value),
    /// Replace the message with `f(message)`; an absent message maps `null`.
    Map(MapFn),
    /// Move the cursor to the given step.
    RouteTo(String),
    /// Divert the transaction to the exception step with this detail.
    Divert(String),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Retryable` error on the first `n` calls, then pass through.
    FailRetryableTimes(u32),
    /// Fail with a `Fatal` error.
    FailFatal(String),
}

/// A mock processor that records every message it receives and does what it
/// was told to.
pub struct MockProcessor {
    /// Label used in test assertions.
    pub name: String,
    pub behaviour: MockBehaviour,
    /// Messages seen by this processor, in call order.
    pub calls: Arc<Mutex<Vec<Value>>>,
    delay: Option<DelayFn>,
    failures: AtomicU32,
}

impl MockProcessor {
    pub fn new(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            failures: AtomicU32::new(0),
        }
    }

    pub fn pass_through(name: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::PassThrough)
    }

    pub fn setting(name: impl Into<String>, message: Value) -> Self {
        Self::new(name, MockBehaviour::SetMessage(message))
    }

    pub fn mapping<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self::new(name, MockBehaviour::Map(Arc::new(f)))
    }

    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::FailFatal(msg.into()))
    }

    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Sleep for `f(message)` before acting, to scramble completion order.
    pub fn with_delay<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(f));
        self
    }

    /// Number of times this processor has been called.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Messages seen so far, in call order.
    pub fn seen(&self) -> Vec<Value> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Processor for MockProcessor {
    async fn process(&self, trx: &mut Transaction) -> Result<(), ProcessorError> {
        let input = trx.message().cloned().unwrap_or(Value::Null);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(input.clone());

        if let Some(delay) = &self.delay {
            tokio::time::sleep(delay(&input)).await;
        }

        match &self.behaviour {
            MockBehaviour::PassThrough => {}
            MockBehaviour::SetMessage(v) => trx.set_message(v.clone()),
            MockBehaviour::Map(f) => trx.set_message(f(&input)),
            MockBehaviour::RouteTo(step) => trx.move_to_step(step.clone()),
            MockBehaviour::Divert(detail) => trx.move_to_exception(detail.clone()),
            MockBehaviour::FailRetryable(msg) => return Err(ProcessorError::Retryable(msg.clone())),
            MockBehaviour::FailRetryableTimes(n) => {
                if self.failures.fetch_add(1, Ordering::SeqCst) < *n {
                    return Err(ProcessorError::Retryable(format!("{} not ready", self.name)));
                }
            }
            MockBehaviour::FailFatal(msg) => return Err(ProcessorError::Fatal(msg.clone())),
        }
        Ok(())
    }
}
