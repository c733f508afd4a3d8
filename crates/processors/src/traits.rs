//! The contracts processor steps are executed through.

use async_trait::async_trait;
use workflow::Transaction;

use crate::ProcessorError;

/// A native processor, registered under a module id and a class name.
///
/// A processor reads and mutates the transaction it is handed: it may
/// replace the message, set properties, or pick the next step itself with
/// [`Transaction::move_to_step`] / [`Transaction::move_to_exception`].
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, trx: &mut Transaction) -> Result<(), ProcessorError>;
}

/// Runs script processors by id.
///
/// Loading and sandboxing scripts is left to the implementation.
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    async fn run(&self, script_id: &str, trx: &mut Transaction) -> Result<(), ProcessorError>;
}

/// A [`Processor`] backed by a synchronous closure.
pub struct FnProcessor<F>(F);

/// Wrap a closure as a [`Processor`].
pub fn processor_fn<F>(f: F) -> FnProcessor<F>
where
    F: Fn(&mut Transaction) -> Result<(), ProcessorError> + Send + Sync,
{
    FnProcessor(f)
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Transaction) -> Result<(), ProcessorError> + Send + Sync,
{
    async fn process(&self, trx: &mut Transaction) -> Result<(), ProcessorError> {
        (self.0)(trx)
    }
}
