//! `workflow` crate — the step graph, the transaction cursor and the error
//! taxonomy shared by the rest of the workspace.
//!
//! Nothing here performs I/O beyond reading a definition file; executing a
//! graph is the job of the `engine` crate.

pub mod context;
pub mod document;
pub mod error;
pub mod graph;
pub mod status;
pub mod step;
pub mod transaction;

pub use context::Context;
pub use error::{BoxError, FlowError};
pub use graph::Graph;
pub use status::ExecStatus;
pub use step::{Direction, EndpointStep, ProcessorRef, Step, StepKind, EXCEPTION_STEP_ID};
pub use transaction::{Transaction, TransactionSnapshot, EXCEPTION_PROPERTY};
