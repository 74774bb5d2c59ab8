use std::{fs, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};

use crate::{
    error::{CompileError, CompileResult},
    policy::MappingPolicy,
    processor::ProcessorConfig,
    processors,
    rbxmx::ReferentStyle,
};

/// Everything one compilation run needs. Immutable once handed to the
/// compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompileConfig {
    pub source_root: PathBuf,
    pub output_path: PathBuf,
    pub processors: Vec<ProcessorConfig>,
    pub policy: MappingPolicy,
    pub root_name: Option<String>,
    pub referents: ReferentStyle,
    pub threads: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("src/"),
            output_path: PathBuf::from("model.rbxmx"),
            processors: vec![ProcessorConfig::named(processors::nevermore::NAME)],
            policy: MappingPolicy::default(),
            root_name: None,
            referents: ReferentStyle::Sequential,
            threads: rayon::current_num_threads(),
        }
    }
}

impl CompileConfig {
    pub fn new(source_root: impl Into<PathBuf>, output_path: impl Into<PathBuf>, processors: Vec<ProcessorConfig>) -> Self {
        Self { source_root: source_root.into(), output_path: output_path.into(), processors, ..Default::default() }
    }

    /// Reads a JSON config. Relative paths inside it are taken relative to
    /// the file's directory.
    pub fn load(path: &Path) -> CompileResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| CompileError::io(path, e))?;
        let mut config: CompileConfig = serde_json::from_str(&text)
            .map_err(|e| CompileError::Config(format!("{}: {}", path.display(), e)))?;

        let base = path.parent().unwrap_or(Path::new(""));
        config.source_root = base.join(&config.source_root);
        config.output_path = base.join(&config.output_path);
        Ok(config)
    }
}
