//! Engine tuning knobs.

use std::path::Path;
use std::time::Duration;

use db::pool::PoolSettings;
use serde::{Deserialize, Deserializer};
use workflow::FlowError;

/// Tuning knobs shared by every integration of an engine.
///
/// Read from JSON with camelCase keys; missing keys keep their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Maximum number of times a retryable processor failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    #[serde(rename = "retryBaseDelayMs", deserialize_with = "millis")]
    pub retry_base_delay: Duration,
    /// Upper bound on forEach children running at the same time.
    pub max_parallel_branches: usize,
    /// Upper bound on the steps one transaction may take before it is failed.
    pub max_hops: usize,
    /// Postgres pool of the snapshot store, when one is configured.
    pub database: PoolSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            max_parallel_branches: 16,
            max_hops: 10_000,
            database: PoolSettings::default(),
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Back-off before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}
