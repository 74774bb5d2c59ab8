use serde::Deserialize;

use crate::{error::CompileResult, instance::InstanceTree, processor::{processor_error, Processor, ProcessorConfig}};

pub const NAME: &str = "wrap";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WrapOptions {
    pub name: String,
    #[serde(default = "default_class")]
    pub class: String,
}

fn default_class() -> String {
    "Folder".to_string()
}

/// Moves every child of the root under a single new node.
pub struct WrapProcessor {
    options: WrapOptions,
}

impl WrapProcessor {
    pub fn new(options: WrapOptions) -> Self {
        Self { options }
    }
}

pub fn create(config: &ProcessorConfig) -> CompileResult<Box<dyn Processor>> {
    Ok(Box::new(WrapProcessor::new(config.options()?)))
}

impl Processor for WrapProcessor {
    fn name(&self) -> &str {
        NAME
    }

    fn apply(self: &Self, mut tree: InstanceTree) -> CompileResult<InstanceTree> {
        if self.options.name.is_empty() || self.options.class.is_empty() {
            return Err(processor_error(NAME, "", "wrapper name and class must not be empty"));
        }

        let mut wrapper = tree.new_node(&self.options.class, &self.options.name);
        wrapper.children = std::mem::take(&mut tree.root.children);
        tree.root.children.push(wrapper);
        return Ok(tree);
    }
}
