pub mod types;
pub mod error;
pub mod source;
pub mod policy;
pub mod sidecar;
pub mod instance;
pub mod builder;
pub mod processor;
pub mod processors;
pub mod rbxmx;
pub mod compiler;
pub mod config;

pub use compiler::{CancelToken, CompiledDocument, Compiler};
pub use config::CompileConfig;
pub use error::{CompileError, Stage, StageError};
pub use instance::{InstanceNode, InstanceTree, NodeId, Value};
pub use processor::{Pipeline, Processor, ProcessorConfig, ProcessorRegistry};
