//! Processors available to every integration under the `builtin` module.

use async_trait::async_trait;
use tracing::info;
use workflow::document::preview_opt;
use workflow::Transaction;

use crate::{Processor, ProcessorError};

/// Logs the transaction's message and passes it on unchanged.
#[derive(Debug, Clone)]
pub struct Log {
    /// Longest message rendering written to the log.
    pub max_chars: usize,
}

impl Default for Log {
    fn default() -> Self {
        Self { max_chars: 1000 }
    }
}

#[async_trait]
impl Processor for Log {
    async fn process(&self, trx: &mut Transaction) -> Result<(), ProcessorError> {
        info!(
            integration_id = trx.integration_id(),
            transaction_id = trx.id(),
            step = trx.current_step().unwrap_or("-"),
            message = %preview_opt(trx.message(), self.max_chars),
            "transaction message"
        );
        Ok(())
    }
}
