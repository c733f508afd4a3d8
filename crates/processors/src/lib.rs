//! `processors` crate — the `Processor` and `ScriptRuntime` contracts,
//! their registries and the built-in processors.
//!
//! Processor steps in a workflow graph are executed through these traits;
//! the engine never knows which concrete processor it is talking to.

pub mod builtin;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use error::ProcessorError;
pub use registry::{ProcessorRegistry, ScriptRegistry, BUILTIN_MODULE};
pub use traits::{processor_fn, FnProcessor, Processor, ScriptRuntime};
