use std::collections::HashMap;

use log::debug;
use serde::Deserialize;

use crate::{error::CompileResult, instance::InstanceTree, processor::{processor_error, Processor, ProcessorConfig}};

pub const NAME: &str = "nevermore";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NevermoreOptions {
    pub container: String,
    pub loader: String,
    pub require_loader: bool,
    pub unique_module_names: bool,
    pub module_class: String,
}

impl Default for NevermoreOptions {
    fn default() -> Self {
        Self {
            container: "Nevermore".to_string(),
            loader: "NevermoreEngine".to_string(),
            require_loader: false,
            unique_module_names: true,
            module_class: "ModuleScript".to_string(),
        }
    }
}

/// Lays the tree out for a Nevermore-style loader: modules are required by
/// name, so module names must be unique everywhere; everything except the
/// loader is moved into the container folder.
pub struct NevermoreProcessor {
    options: NevermoreOptions,
}

impl NevermoreProcessor {
    pub fn new(options: NevermoreOptions) -> Self {
        Self { options }
    }

    fn check_unique_modules(&self, tree: &InstanceTree) -> CompileResult<()> {
        let mut seen: HashMap<&str, String> = HashMap::new();
        let mut duplicate = None;
        for child in &tree.root.children {
            child.visit(&child.name, &mut |path, node| {
                if duplicate.is_some() || node.class != self.options.module_class || node.name == self.options.loader {
                    return;
                }
                match seen.get(node.name.as_str()) {
                    Some(first) => duplicate = Some((path.to_string(), first.clone())),
                    None => {
                        seen.insert(&node.name, path.to_string());
                    }
                }
            });
        }

        match duplicate {
            Some((path, first)) => Err(processor_error(NAME, &path, format!("module name is already used by '{}'", first))),
            None => Ok(()),
        }
    }
}

pub fn create(config: &ProcessorConfig) -> CompileResult<Box<dyn Processor>> {
    Ok(Box::new(NevermoreProcessor::new(config.options()?)))
}

impl Processor for NevermoreProcessor {
    fn name(&self) -> &str {
        NAME
    }

    fn apply(self: &Self, mut tree: InstanceTree) -> CompileResult<InstanceTree> {
        let options = &self.options;
        if options.container.is_empty() || options.loader.is_empty() {
            return Err(processor_error(NAME, "", "container and loader names must not be empty"));
        }
        if options.unique_module_names {
            self.check_unique_modules(&tree)?;
        }

        let mut rest = std::mem::take(&mut tree.root.children);
        let loader = rest.iter().position(|c| c.name == options.loader).map(|index| rest.remove(index));
        if loader.is_none() && options.require_loader {
            return Err(processor_error(NAME, "", format!("loader module '{}' not found at the root", options.loader)));
        }

        let mut container = tree.new_node("Folder", &options.container);
        debug!("moving {} instance(s) into '{}'", rest.len(), options.container);
        container.children = rest;
        tree.root.children.push(container);

        if let Some(mut loader) = loader {
            loader.class = options.module_class.clone();
            tree.root.children.push(loader);
        }
        return Ok(tree);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instance::InstanceNode;

    fn module(tree: &mut InstanceTree, name: &str) -> InstanceNode {
        tree.new_node("ModuleScript", name)
    }

    fn sample() -> InstanceTree {
        let mut tree = InstanceTree::new("Folder", "src");
        let mut loader = tree.new_node("Script", "NevermoreEngine");
        loader.properties.insert("Source".into(), crate::instance::Value::ProtectedString("return {}".into()));
        let mut shared = tree.new_node("Folder", "Shared");
        let signal = module(&mut tree, "Signal");
        shared.children.push(signal);
        let maid = module(&mut tree, "Maid");
        tree.root.children.push(loader);
        tree.root.children.push(maid);
        tree.root.children.push(shared);
        tree
    }

    #[test]
    fn wraps_modules_and_keeps_loader_at_root() {
        let tree = NevermoreProcessor::new(NevermoreOptions::default()).apply(sample()).unwrap();

        let names: Vec<&str> = tree.root.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Nevermore", "NevermoreEngine"]);
        assert_eq!(tree.find_path("NevermoreEngine").unwrap().class, "ModuleScript");
        assert!(tree.find_path("Nevermore/Maid").is_some());
        assert!(tree.find_path("Nevermore/Shared/Signal").is_some());
        assert_eq!(tree.validate(), Ok(()));
    }

    #[test]
    fn duplicate_module_names_fail_with_second_path() {
        let mut tree = sample();
        let dup = module(&mut tree, "Signal");
        tree.root.children.push(dup);

        let err = NevermoreProcessor::new(NevermoreOptions::default()).apply(tree).unwrap_err();
        let crate::CompileError::Processor { processor, path, message } = err else { panic!("expected processor error") };
        assert_eq!(processor, "nevermore");
        assert_eq!(path, "Signal");
        assert!(message.contains("Shared/Signal"));
    }

    #[test]
    fn duplicates_allowed_when_disabled() {
        let mut tree = sample();
        let dup = module(&mut tree, "Signal");
        tree.root.children.push(dup);
        let options = NevermoreOptions { unique_module_names: false, ..Default::default() };
        assert!(NevermoreProcessor::new(options).apply(tree).is_ok());
    }

    #[test]
    fn missing_loader_only_fails_when_required() {
        let tree = InstanceTree::new("Folder", "src");
        let tree = NevermoreProcessor::new(NevermoreOptions::default()).apply(tree).unwrap();
        assert_eq!(tree.root.children.len(), 1);

        let options = NevermoreOptions { require_loader: true, ..Default::default() };
        let err = NevermoreProcessor::new(options).apply(InstanceTree::new("Folder", "src")).unwrap_err();
        assert!(matches!(err, crate::CompileError::Processor { .. }));
    }
}
