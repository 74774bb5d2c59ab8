use serde::Deserialize;

use crate::{error::CompileResult, instance::InstanceTree, processor::{Processor, ProcessorConfig}};

pub const NAME: &str = "prefix";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrefixOptions {
    pub prefix: String,
    #[serde(default = "default_classes")]
    pub classes: Vec<String>,
}

fn default_classes() -> Vec<String> {
    vec!["ModuleScript".to_string()]
}

/// Prepends `prefix` to the name of every non-root node of a listed class.
pub struct PrefixProcessor {
    options: PrefixOptions,
}

impl PrefixProcessor {
    pub fn new(options: PrefixOptions) -> Self {
        Self { options }
    }
}

pub fn create(config: &ProcessorConfig) -> CompileResult<Box<dyn Processor>> {
    Ok(Box::new(PrefixProcessor::new(config.options()?)))
}

impl Processor for PrefixProcessor {
    fn name(&self) -> &str {
        NAME
    }

    fn apply(self: &Self, mut tree: InstanceTree) -> CompileResult<InstanceTree> {
        let options = &self.options;
        for child in &mut tree.root.children {
            child.visit_mut(&mut |node| {
                if options.classes.iter().any(|c| *c == node.class) {
                    node.name = format!("{}{}", options.prefix, node.name);
                }
            });
        }
        Ok(tree)
    }
}
