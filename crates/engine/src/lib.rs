//! `engine` crate — runs integrations: lifecycle, transaction execution,
//! forEach fan-out, scheduling and the storage they persist to.

pub mod condition;
pub mod config;
pub mod definition;
pub mod integration;
pub mod registry;
pub mod scheduler;
pub mod services;
pub mod storage;

pub use condition::FieldMatcher;
pub use config::EngineConfig;
pub use definition::{IntegrationDefinition, IntegrationDocument, Schedule};
pub use integration::Integration;
pub use registry::IntegrationRegistry;
pub use scheduler::TokioScheduler;
pub use services::{ConditionEvaluator, EndpointDirectory, ScheduledTask, Scheduler, Services};
pub use storage::{KvStore, MemoryKvStore, MemorySnapshotStore, PgSnapshotStore, SnapshotStore};
