//! `clap`-derive front-end for the `dfo` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

/// A container-image build orchestrator driven by declarative `dfo.yaml` descriptors.
#[derive(Debug, Parser)]
#[clap(about, long_about = None)]
pub(crate) struct Cli {
    /// Set the logging level. One of [off|error|warn|info|debug|trace]. Defaults to warn. You
    /// can also leave this unset and use the RUST_LOG env variable.
    #[clap(long = "log-level")]
    pub(crate) log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Generate a Containerfile from a single descriptor.
    Single(SingleArgs),
    /// Walk a directory tree and generate Containerfiles for every descriptor found.
    All(AllArgs),
    /// Walk, build, cache, and optionally push every descriptor in dependency order.
    Orchestrate(OrchestrateArgs),
}

/// Flags shared across all three subcommands.
#[derive(Debug, Parser, Clone)]
pub(crate) struct Common {
    /// Directory to search for descriptors (or, for `single`, the directory holding one).
    #[arg(long)]
    pub(crate) directory: Option<PathBuf>,

    /// Alpine distribution version used to resolve packages (e.g. `3.19`). Defaults to the
    /// latest stable release advertised by the package index.
    #[arg(long)]
    pub(crate) alpine_version: Option<String>,

    /// Registry to qualify built image names with. Required for `orchestrate`.
    #[arg(long, env = "DFO_REGISTRY")]
    pub(crate) registry: Option<String>,

    #[arg(long, env = "DFO_GIT_USER")]
    pub(crate) git_user: Option<String>,

    #[arg(long, env = "DFO_GIT_PASS")]
    pub(crate) git_pass: Option<String>,

    #[arg(long, env = "DFO_STORAGE_PATH")]
    pub(crate) storage_path: Option<PathBuf>,

    #[arg(long, env = "DFO_STORAGE_DRIVER")]
    pub(crate) storage_driver: Option<String>,

    #[arg(long)]
    pub(crate) isolation: Option<String>,

    /// Bound on per-layer build concurrency.
    #[arg(long, env = "DFO_CONCURRENCY")]
    pub(crate) concurrency: Option<usize>,

    /// Ignore the build cache and rebuild every container.
    #[arg(long)]
    pub(crate) force_rebuild: bool,

    /// Push each built image after a successful build or cache hit.
    #[arg(long)]
    pub(crate) push: bool,

    /// Emit a CI workflow document to this path in addition to building.
    #[arg(long)]
    pub(crate) workflow: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub(crate) struct SingleArgs {
    /// Path to the `dfo.yaml` descriptor to generate.
    pub(crate) descriptor: PathBuf,

    #[command(flatten)]
    pub(crate) common: Common,
}

#[derive(Debug, Parser)]
pub(crate) struct AllArgs {
    #[command(flatten)]
    pub(crate) common: Common,
}

#[derive(Debug, Parser)]
pub(crate) struct OrchestrateArgs {
    #[command(flatten)]
    pub(crate) common: Common,
}
