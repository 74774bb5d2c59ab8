use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use elixir::{processor::ProcessorConfig, rbxmx::ReferentStyle, CompileConfig, CompileError, Compiler};
use log::{error, info};

/// Compile a directory of scripts and assets into an rbxmx model.
#[derive(Parser, Debug)]
#[command(name = "elixir", version)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Source directory (default: src/)
    #[arg(long, short = 's')]
    source: Option<PathBuf>,

    /// Output model file (default: model.rbxmx)
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Processor to run, in order; repeat to build a pipeline. Replaces the configured list
    #[arg(long = "processor", short = 'p')]
    processors: Vec<String>,

    /// Run with no processors at all
    #[arg(long, conflicts_with = "processors")]
    no_processors: bool,

    /// Name of the root instance (default: source directory name)
    #[arg(long)]
    root_name: Option<String>,

    /// Worker threads used to read the source tree
    #[arg(long)]
    threads: Option<usize>,

    /// Emit random referent ids instead of sequential ones
    #[arg(long)]
    random_referents: bool,

    /// Also write a JSON manifest with digests of the build
    #[arg(long)]
    manifest: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let manifest = args.manifest;

    let document = Compiler::new(config).compile()?;
    info!("compiled {} instances, digest {}", document.instance_count, document.content_digest);

    if let Some(path) = manifest {
        document.write_manifest(&path)?;
        info!("wrote manifest {}", path.display());
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<CompileConfig, CompileError> {
    let mut config = match &args.config {
        Some(path) => CompileConfig::load(path)?,
        None => CompileConfig::default(),
    };

    if let Some(source) = &args.source {
        config.source_root = source.clone();
    }
    if let Some(output) = &args.output {
        config.output_path = output.clone();
    }
    if !args.processors.is_empty() {
        config.processors = args.processors.iter().map(|name| ProcessorConfig::named(name)).collect();
    }
    if args.no_processors {
        config.processors.clear();
    }
    if let Some(root_name) = &args.root_name {
        config.root_name = Some(root_name.clone());
    }
    if let Some(threads) = args.threads {
        if threads == 0 {
            return Err(CompileError::Config("--threads must be at least 1".to_string()));
        }
        config.threads = threads;
    }
    if args.random_referents {
        config.referents = ReferentStyle::Random;
    }
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("elixir").chain(argv.iter().copied()))
    }

    #[test]
    fn flags_override_defaults() {
        let config = load_config(&args(&["-s", "game", "-o", "out.rbxmx", "-p", "wrap", "-p", "prefix", "--random-referents"])).unwrap();
        assert_eq!(config.source_root, PathBuf::from("game"));
        assert_eq!(config.output_path, PathBuf::from("out.rbxmx"));
        assert_eq!(config.processors, vec![ProcessorConfig::named("wrap"), ProcessorConfig::named("prefix")]);
        assert_eq!(config.referents, ReferentStyle::Random);
    }

    #[test]
    fn no_flags_reproduce_default_invocation() {
        let config = load_config(&args(&[])).unwrap();
        assert_eq!(config.source_root, PathBuf::from("src/"));
        assert_eq!(config.processors, vec![ProcessorConfig::named("nevermore")]);
        assert!(load_config(&args(&["--no-processors"])).unwrap().processors.is_empty());
        assert!(matches!(load_config(&args(&["--threads", "0"])), Err(CompileError::Config(_))));
    }
}
