//! Merges CLI flags, `DFO_*` environment variables, and an optional `dfo.toml` into a single
//! [`RunConfig`], in that precedence order.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::ResultExt;

use crate::cli::{Cli, Command};

pub(crate) use error::Result;

const CONFIG_FILENAME: &str = "dfo.toml";

#[derive(Debug, Clone)]
pub(crate) struct RunConfig {
    pub(crate) directory: PathBuf,
    pub(crate) descriptor_filename: String,
    pub(crate) alpine_version: Option<String>,
    pub(crate) registry: Option<String>,
    pub(crate) git_user: Option<String>,
    pub(crate) git_pass: Option<String>,
    pub(crate) storage_path: Option<PathBuf>,
    pub(crate) storage_driver: Option<String>,
    pub(crate) isolation: Option<String>,
    pub(crate) concurrency: usize,
    pub(crate) force_rebuild: bool,
    pub(crate) push: bool,
    pub(crate) workflow: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlFile {
    #[serde(default)]
    dfo: TomlTable,
}

#[derive(Debug, Default, Deserialize)]
struct TomlTable {
    directory: Option<PathBuf>,
    #[serde(rename = "descriptor-filename")]
    descriptor_filename: Option<String>,
    #[serde(rename = "alpine-version")]
    alpine_version: Option<String>,
    registry: Option<String>,
    #[serde(rename = "git-user")]
    git_user: Option<String>,
    #[serde(rename = "git-pass")]
    git_pass: Option<String>,
    #[serde(rename = "storage-path")]
    storage_path: Option<PathBuf>,
    #[serde(rename = "storage-driver")]
    storage_driver: Option<String>,
    isolation: Option<String>,
    concurrency: Option<usize>,
    #[serde(rename = "force-rebuild")]
    force_rebuild: Option<bool>,
    push: Option<bool>,
    workflow: Option<PathBuf>,
}

impl RunConfig {
    /// `common`'s string/path fields already reflect CLI-flag-or-`DFO_*`-env-var (clap resolves
    /// that precedence itself via `env = "..."` on each field); this layers `dfo.toml` and
    /// built-in defaults underneath, and separately checks `DFO_PUSH`/`DFO_FORCE_REBUILD` for
    /// the two boolean flags, which clap doesn't bind to an environment variable.
    pub(crate) fn load(cli: &Cli) -> Result<RunConfig> {
        let file = load_toml_file(&std::env::current_dir().unwrap_or_default())?;
        let common = match &cli.command {
            Command::Single(args) => &args.common,
            Command::All(args) => &args.common,
            Command::Orchestrate(args) => &args.common,
        };

        let registry = common.registry.clone().or_else(|| file.dfo.registry.clone());

        if matches!(cli.command, Command::Orchestrate(_)) && registry.is_none() {
            return error::ConfigInvalidSnafu {
                field: "registry".to_string(),
            }
            .fail();
        }

        let concurrency = common
            .concurrency
            .or(file.dfo.concurrency)
            .unwrap_or(dfo_config::DEFAULT_CONCURRENCY);

        let force_rebuild = common.force_rebuild
            || env_flag("DFO_FORCE_REBUILD")
            || file.dfo.force_rebuild.unwrap_or(false);

        let push = common.push || env_flag("DFO_PUSH") || file.dfo.push.unwrap_or(false);

        Ok(RunConfig {
            directory: common.directory.clone().unwrap_or_else(|| {
                file.dfo
                    .directory
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("."))
            }),
            descriptor_filename: file
                .dfo
                .descriptor_filename
                .clone()
                .unwrap_or_else(|| "dfo.yaml".to_string()),
            alpine_version: common
                .alpine_version
                .clone()
                .or_else(|| file.dfo.alpine_version.clone()),
            registry,
            git_user: common.git_user.clone().or_else(|| file.dfo.git_user.clone()),
            git_pass: common.git_pass.clone().or_else(|| file.dfo.git_pass.clone()),
            storage_path: common
                .storage_path
                .clone()
                .or_else(|| file.dfo.storage_path.clone()),
            storage_driver: common
                .storage_driver
                .clone()
                .or_else(|| file.dfo.storage_driver.clone()),
            isolation: common.isolation.clone().or_else(|| file.dfo.isolation.clone()),
            concurrency,
            force_rebuild,
            push,
            workflow: common.workflow.clone().or_else(|| file.dfo.workflow.clone()),
        })
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE")
    )
}

/// Walks `start` and its ancestors looking for `dfo.toml`. A file found but unreadable or
/// malformed is a hard error; a file simply absent everywhere degrades to built-in defaults.
fn load_toml_file(start: &Path) -> Result<TomlFile> {
    for dir in start.ancestors() {
        let candidate = dir.join(CONFIG_FILENAME);
        if candidate.is_file() {
            let text = std::fs::read_to_string(&candidate).context(error::ReadSnafu {
                path: candidate.clone(),
            })?;
            return toml::from_str(&text).context(error::ParseSnafu { path: candidate });
        }
    }
    Ok(TomlFile::default())
}

pub(crate) mod error {
    use std::path::PathBuf;

    use snafu::Snafu;

    pub(crate) type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to read config file '{}': {source}", path.display()))]
        Read {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to parse config file '{}': {source}", path.display()))]
        Parse {
            path: PathBuf,
            source: toml::de::Error,
        },

        #[snafu(display(
            "'{field}' has no value from --{field}, DFO_{field} (upper-cased), or dfo.toml"
        ))]
        ConfigInvalid { field: String },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cli::{Common, OrchestrateArgs};

    fn common() -> Common {
        Common {
            directory: None,
            alpine_version: None,
            registry: None,
            git_user: None,
            git_pass: None,
            storage_path: None,
            storage_driver: None,
            isolation: None,
            concurrency: None,
            force_rebuild: false,
            push: false,
            workflow: None,
        }
    }

    #[test]
    fn orchestrate_without_registry_anywhere_is_config_invalid() {
        let cli = Cli {
            log_level: None,
            command: Command::Orchestrate(OrchestrateArgs { common: common() }),
        };
        let err = RunConfig::load(&cli).unwrap_err();
        assert!(matches!(err, error::Error::ConfigInvalid { .. }));
    }

    #[test]
    fn concurrency_defaults_when_unset_everywhere() {
        let cli = Cli {
            log_level: None,
            command: Command::Orchestrate(OrchestrateArgs {
                common: Common {
                    registry: Some("registry.example.com".to_string()),
                    ..common()
                },
            }),
        };
        let config = RunConfig::load(&cli).unwrap();
        assert_eq!(config.concurrency, dfo_config::DEFAULT_CONCURRENCY);
    }
}
