//! The external builder contract: initialize / build-container / push-image / close.
//!
//! The reference implementation shells out to a configured build tool via `duct`, the same
//! way the rest of this system treats container tooling as a synchronous external collaborator.

use std::path::{Path, PathBuf};

use duct::cmd;
use lazy_static::lazy_static;
use regex::Regex;
use snafu::{ensure, ResultExt};

use oci_cli_wrapper::ImageTool;

pub(crate) use error::Result;

#[derive(Debug, Clone)]
pub(crate) struct BuildResult {
    pub(crate) container_name: String,
    pub(crate) image_name: String,
    pub(crate) digest: String,
    pub(crate) full_ref: String,
}

pub(crate) trait ExternalBuilder {
    fn initialize(&mut self) -> Result<()>;
    fn build_container(
        &self,
        container_name: &str,
        containerfile_path: &Path,
        context_dir: &Path,
    ) -> Result<BuildResult>;
    fn push_image(&self, image_name: &str) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

lazy_static! {
    /// A known transient BuildKit failure signature worth retrying on.
    static ref TRANSIENT_BUILD_ERROR: Regex = Regex::new(
        "failed to solve with frontend dockerfile.v0.*frontend grpc server closed unexpectedly"
    )
    .unwrap();
}

const MAX_BUILD_ATTEMPTS: u32 = 3;

/// Shells out to `tool_path` (e.g. `docker` or `podman`) to build and tag an image, then asks
/// `image_tool` for its digest.
pub(crate) struct ProcessBuilder {
    tool_path: PathBuf,
    registry: Option<String>,
    image_tool: ImageTool,
    /// Extra flags threaded straight onto the build invocation (e.g. `--storage-driver`,
    /// `--isolation`, git credentials as `--build-arg`), ahead of the positional context dir.
    extra_build_args: Vec<String>,
}

impl ProcessBuilder {
    pub(crate) fn new(tool_path: PathBuf, registry: Option<String>, image_tool: ImageTool) -> Self {
        Self {
            tool_path,
            registry,
            image_tool,
            extra_build_args: Vec::new(),
        }
    }

    pub(crate) fn with_extra_build_args(mut self, extra_build_args: Vec<String>) -> Self {
        self.extra_build_args = extra_build_args;
        self
    }

    fn qualified_image_name(&self, container_name: &str) -> String {
        match &self.registry {
            Some(registry) => format!("{registry}/{container_name}:latest"),
            None => format!("{container_name}:latest"),
        }
    }
}

impl ExternalBuilder for ProcessBuilder {
    fn initialize(&mut self) -> Result<()> {
        ensure!(
            self.tool_path.exists() || which::which(&self.tool_path).is_ok(),
            error::ToolNotFoundSnafu {
                path: self.tool_path.clone(),
            }
        );
        Ok(())
    }

    fn build_container(
        &self,
        container_name: &str,
        containerfile_path: &Path,
        context_dir: &Path,
    ) -> Result<BuildResult> {
        let image_name = self.qualified_image_name(container_name);

        let mut args: Vec<String> = vec![
            "build".to_string(),
            "-f".to_string(),
            containerfile_path.display().to_string(),
            "-t".to_string(),
            image_name.clone(),
        ];
        args.extend(self.extra_build_args.iter().cloned());
        args.push(context_dir.display().to_string());

        let mut last_stdout = String::new();
        let mut last_stderr = String::new();
        for attempt in 1..=MAX_BUILD_ATTEMPTS {
            let output = cmd(&self.tool_path, &args)
                .stdout_capture()
                .stderr_capture()
                .unchecked()
                .run()
                .context(error::SpawnSnafu {
                    container_name: container_name.to_string(),
                })?;

            last_stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            last_stderr = String::from_utf8_lossy(&output.stderr).into_owned();

            if output.status.success() {
                let digest = self
                    .image_tool
                    .get_digest(&image_name)
                    .unwrap_or_else(|_| normalize_image_id(last_stdout.lines().last().unwrap_or("")));

                return Ok(BuildResult {
                    container_name: container_name.to_string(),
                    image_name: image_name.clone(),
                    digest: digest.clone(),
                    full_ref: format!("{image_name}@{digest}"),
                });
            }

            if attempt < MAX_BUILD_ATTEMPTS && TRANSIENT_BUILD_ERROR.is_match(&last_stderr) {
                log::warn!(
                    "Build of '{container_name}' hit a known transient error, retrying (attempt {attempt}/{MAX_BUILD_ATTEMPTS})"
                );
                continue;
            }

            return error::BuildFailedSnafu {
                container_name: container_name.to_string(),
                stderr: last_stderr,
            }
            .fail();
        }

        error::BuildFailedSnafu {
            container_name: container_name.to_string(),
            stderr: last_stderr,
        }
        .fail()
    }

    fn push_image(&self, image_name: &str) -> Result<()> {
        let args = vec!["push".to_string(), image_name.to_string()];
        cmd(&self.tool_path, &args)
            .stdout_capture()
            .stderr_capture()
            .run()
            .context(error::PushSnafu {
                image_name: image_name.to_string(),
            })?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Normalises an arbitrary tool-reported image id into a canonical `sha256:<hex>` form, used
/// only when the digest lookup itself failed.
fn normalize_image_id(id: &str) -> String {
    let hex = id.trim().trim_start_matches("sha256:");
    format!("sha256:{hex}")
}

pub(crate) mod error {
    use std::path::PathBuf;

    use snafu::Snafu;

    pub(crate) type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("Build tool not found at '{}'", path.display()))]
        ToolNotFound { path: PathBuf },

        #[snafu(display("Failed to spawn build for '{container_name}': {source}"))]
        Spawn {
            container_name: String,
            source: std::io::Error,
        },

        #[snafu(display("Build failed for '{container_name}':\n{stderr}"))]
        BuildFailed {
            container_name: String,
            stderr: String,
        },

        #[snafu(display("Failed to push '{image_name}': {source}"))]
        Push {
            image_name: String,
            source: std::io::Error,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_image_id_strips_existing_prefix() {
        assert_eq!(normalize_image_id("sha256:abc123"), "sha256:abc123");
        assert_eq!(normalize_image_id("abc123"), "sha256:abc123");
        assert_eq!(normalize_image_id("  sha256:abc123\n"), "sha256:abc123");
    }

    #[test]
    fn transient_error_regex_matches_known_frontend_failure() {
        let sample = "failed to solve with frontend dockerfile.v0: failed to solve with frontend gateway.v0: frontend grpc server closed unexpectedly";
        assert!(TRANSIENT_BUILD_ERROR.is_match(sample));
        assert!(!TRANSIENT_BUILD_ERROR.is_match("some other failure entirely"));
    }
}
