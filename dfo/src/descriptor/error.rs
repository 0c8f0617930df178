use std::path::PathBuf;

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to read descriptor at '{}': {source}", path.display()))]
    Read {
        path: PathBuf,
        source: crate::fs::error::Error,
    },

    #[snafu(display("Failed to parse descriptor at '{}': {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("Invalid descriptor at '{}': {message}", path.display()))]
    Invalid { path: PathBuf, message: String },

    #[snafu(display(
        "Undefined variable reference(s) in '{}': {}",
        path.display(),
        offenders.join(", ")
    ))]
    UndefinedVariable {
        path: PathBuf,
        offenders: Vec<String>,
    },

    #[snafu(display("Unknown pipeline '{name}' used in '{}'", path.display()))]
    UnknownPipeline { path: PathBuf, name: String },

    #[snafu(display(
        "Invalid parameters for pipeline '{name}' in '{}': {message}",
        path.display()
    ))]
    PipelineParamsInvalid {
        path: PathBuf,
        name: String,
        message: String,
    },
}
