use std::{
    fmt::Write as _,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{atomic::{AtomicBool, Ordering}, Arc},
};

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::{
    builder,
    config::CompileConfig,
    error::{AtStage, CompileError, CompileResult, Stage, StageError},
    policy::CompiledPolicy,
    processor::{Pipeline, ProcessorRegistry},
    rbxmx,
    source::Walker,
};

/// Shared cancellation flag. Checked between stages and by the walker, so a
/// cancelled run never hands partial output to the next stage.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Serialized model plus what is needed to check a rebuild reproduces it.
/// `generated_at` is metadata only and never part of `bytes`.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledDocument {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub source_root: PathBuf,
    pub output_path: PathBuf,
    pub pipeline: Vec<String>,
    pub pipeline_fingerprint: String,
    pub content_digest: String,
    pub instance_count: usize,
    pub generated_at: DateTime<Utc>,
}

impl CompiledDocument {
    pub fn write_manifest(&self, path: &Path) -> CompileResult<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| CompileError::Config(e.to_string()))?;
        write_atomic(path, &json)
    }
}

pub struct Compiler {
    config: CompileConfig,
    registry: ProcessorRegistry,
    cancel: CancelToken,
}

impl Compiler {
    pub fn new(config: CompileConfig) -> Self {
        Self::with_registry(config, ProcessorRegistry::builtin())
    }

    pub fn with_registry(config: CompileConfig, registry: ProcessorRegistry) -> Self {
        Self { config, registry, cancel: CancelToken::new() }
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Full run: render in memory, then replace the output file atomically.
    pub fn compile(&self) -> Result<CompiledDocument, StageError> {
        let document = self.render()?;
        self.checkpoint(Stage::Write)?;
        write_atomic(&self.config.output_path, &document.bytes).at_stage(Stage::Write)?;
        info!("wrote {} ({} bytes)", self.config.output_path.display(), document.bytes.len());
        Ok(document)
    }

    /// Walk, build, process and serialize without touching the output path.
    pub fn render(&self) -> Result<CompiledDocument, StageError> {
        let config = &self.config;
        let policy = CompiledPolicy::new(config.policy.clone()).at_stage(Stage::Config)?;
        let pipeline = Pipeline::from_configs(&config.processors, &self.registry).at_stage(Stage::Config)?;
        let pipeline_fingerprint = fingerprint(&config.processors).at_stage(Stage::Config)?;

        self.checkpoint(Stage::Walk)?;
        let ignored = |name: &str| policy.is_ignored(name);
        let source = Walker::new(config.threads, self.cancel.clone())
            .skipping(&ignored)
            .walk(&config.source_root)
            .at_stage(Stage::Walk)?;
        info!("walked {} ({} entries)", config.source_root.display(), source.count() - 1);

        self.checkpoint(Stage::Build)?;
        let tree = builder::build(&source, &policy, config.root_name.as_deref()).at_stage(Stage::Build)?;
        drop(source);
        info!("built {} instances", tree.root.count());

        self.checkpoint(Stage::Process)?;
        let tree = pipeline.run(tree, &self.cancel).at_stage(Stage::Process)?;

        self.checkpoint(Stage::Serialize)?;
        let bytes = rbxmx::write_document(&tree, config.referents).at_stage(Stage::Serialize)?;

        Ok(CompiledDocument {
            content_digest: sha256_hex(&bytes),
            bytes,
            source_root: config.source_root.clone(),
            output_path: config.output_path.clone(),
            pipeline: pipeline.names(),
            pipeline_fingerprint,
            instance_count: tree.root.count(),
            generated_at: Utc::now(),
        })
    }

    fn checkpoint(&self, stage: Stage) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            return Err(StageError { stage, error: CompileError::Cancelled });
        }
        Ok(())
    }
}

fn fingerprint(processors: &[crate::processor::ProcessorConfig]) -> CompileResult<String> {
    let json = serde_json::to_vec(processors).map_err(|e| CompileError::Config(e.to_string()))?;
    Ok(sha256_hex(&json))
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().fold(String::new(), |mut acc, b| {
        let _ = write!(acc, "{:02x}", b);
        acc
    })
}

/// Writes next to `path` and renames into place, so readers never see a
/// half-written file and a failed write leaves the old one untouched. An
/// existing target keeps its permissions; a new one gets the usual
/// umask-filtered mode.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> CompileResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let existing = fs::metadata(path).ok();
    if existing.as_ref().is_some_and(|metadata| metadata.is_dir()) {
        return Err(CompileError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidInput, "output path is a directory")));
    }

    let mut temp = tempfile::Builder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.permissions(fs::Permissions::from_mode(0o666));
    }
    let mut file: NamedTempFile = temp.tempfile_in(dir).map_err(|e| CompileError::io(dir, e))?;
    if let Some(metadata) = existing {
        file.as_file().set_permissions(metadata.permissions()).map_err(|e| CompileError::io(file.path(), e))?;
    }
    file.write_all(bytes).map_err(|e| CompileError::io(file.path(), e))?;
    file.as_file().sync_all().map_err(|e| CompileError::io(file.path(), e))?;
    file.persist(path).map_err(|e| CompileError::io(path, e.error))?;
    Ok(())
}
