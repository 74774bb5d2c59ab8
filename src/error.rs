use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Failure of a single compilation step. Every variant carries the entity
/// that caused it: a filesystem path, an instance path or a processor name.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("I/O error at {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("malformed input in {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("name conflict at '{path}'{}", processor_suffix(processor))]
    NameConflict { path: String, processor: Option<String> },

    #[error("processor '{processor}' failed at '{path}': {message}")]
    Processor { processor: String, path: String, message: String },

    #[error("cannot serialize property '{property}' of '{path}': {message}")]
    Serialization { path: String, property: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("compilation cancelled")]
    Cancelled,
}

fn processor_suffix(processor: &Option<String>) -> String {
    match processor {
        Some(name) => format!(" after processor '{}'", name),
        None => String::new(),
    }
}

impl CompileError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse { path: path.into(), message: message.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Walk,
    Build,
    Process,
    Serialize,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "config",
            Stage::Walk => "walk",
            Stage::Build => "build",
            Stage::Process => "process",
            Stage::Serialize => "serialize",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

/// The first error of a run, tagged with the stage that produced it.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {error}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub error: CompileError,
}

pub type CompileResult<T> = Result<T, CompileError>;

pub trait AtStage<T> {
    fn at_stage(self, stage: Stage) -> Result<T, StageError>;
}

impl<T> AtStage<T> for CompileResult<T> {
    fn at_stage(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|error| StageError { stage, error })
    }
}
