use std::collections::BTreeMap;

use log::{debug, info};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    compiler::CancelToken,
    error::{CompileError, CompileResult},
    instance::{InstanceTree, Violation},
    processors,
};

/// One named pass over the instance tree. A processor either returns a tree
/// that still satisfies every invariant or fails as a whole.
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;
    fn apply(self: &Self, tree: InstanceTree) -> CompileResult<InstanceTree>;
}

pub fn processor_error(processor: &str, path: &str, message: impl Into<String>) -> CompileError {
    CompileError::Processor { processor: processor.to_string(), path: path.to_string(), message: message.into() }
}

/// A processor as it appears in configuration: `{ "name": .., "options": .. }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorConfig {
    pub name: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl ProcessorConfig {
    pub fn named(name: &str) -> Self {
        Self { name: name.to_string(), options: serde_json::Value::Null }
    }

    pub fn with_options(name: &str, options: serde_json::Value) -> Self {
        Self { name: name.to_string(), options }
    }

    /// Deserializes the options block; a missing block means all defaults.
    pub fn options<T: DeserializeOwned>(&self) -> CompileResult<T> {
        let options = match &self.options {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(options).map_err(|e| CompileError::Config(format!("bad options for processor '{}': {}", self.name, e)))
    }
}

pub type ProcessorFactory = fn(&ProcessorConfig) -> CompileResult<Box<dyn Processor>>;

/// Explicit name -> constructor table. Nothing is registered implicitly;
/// callers start from `builtin()` or `new()` and add their own.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    factories: BTreeMap<String, ProcessorFactory>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self { factories: BTreeMap::new() }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(processors::nevermore::NAME, processors::nevermore::create);
        registry.register(processors::wrap::NAME, processors::wrap::create);
        registry.register(processors::prefix::NAME, processors::prefix::create);
        return registry;
    }

    pub fn register(&mut self, name: &str, factory: ProcessorFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(|k| k.as_str()).collect()
    }

    pub fn create(&self, config: &ProcessorConfig) -> CompileResult<Box<dyn Processor>> {
        let Some(factory) = self.factories.get(&config.name) else {
            return Err(CompileError::Config(format!("unknown processor '{}' (known: {})", config.name, self.names().join(", "))));
        };
        factory(config)
    }
}

/// Processors in configured order. Order is part of the build's identity and
/// is never changed here.
pub struct Pipeline {
    processors: Vec<Box<dyn Processor>>,
}

impl Pipeline {
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self { processors }
    }

    pub fn from_configs(configs: &[ProcessorConfig], registry: &ProcessorRegistry) -> CompileResult<Self> {
        let mut processors = Vec::with_capacity(configs.len());
        for config in configs {
            processors.push(registry.create(config)?);
        }
        Ok(Self::new(processors))
    }

    pub fn names(&self) -> Vec<String> {
        self.processors.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn run(&self, mut tree: InstanceTree, cancel: &CancelToken) -> CompileResult<InstanceTree> {
        for processor in &self.processors {
            if cancel.is_cancelled() {
                return Err(CompileError::Cancelled);
            }

            let name = processor.name();
            tree = processor.apply(tree)?;
            check(&tree, name)?;
            debug!("processor '{}' done, {} instances", name, tree.root.count());
        }
        info!("applied {} processor(s)", self.processors.len());
        Ok(tree)
    }
}

fn check(tree: &InstanceTree, processor: &str) -> CompileResult<()> {
    match tree.validate() {
        Ok(()) => Ok(()),
        Err(Violation::DuplicateName { path }) => Err(CompileError::NameConflict { path, processor: Some(processor.to_string()) }),
        Err(violation) => Err(processor_error(processor, violation.path(), violation.to_string())),
    }
}
