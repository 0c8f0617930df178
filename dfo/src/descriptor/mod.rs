//! Typed in-memory form of a per-container `dfo.yaml` build recipe.

pub mod error;
pub(crate) mod pipeline;
pub(crate) mod vars;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ensure, ResultExt};

use crate::fs::Filesystem;
use error::Result;

pub(crate) use pipeline::BuiltinPipeline;

#[derive(Debug, Clone)]
pub(crate) struct Descriptor {
    pub(crate) package: Package,
    pub(crate) vars: BTreeMap<String, String>,
    pub(crate) stages: Vec<Stage>,
}

#[derive(Debug, Clone)]
pub(crate) struct Package {
    pub(crate) name: String,
    pub(crate) labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Stage {
    pub(crate) name: String,
    pub(crate) environment: Environment,
    pub(crate) pipeline: Vec<PipelineStep>,
    pub(crate) is_final: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum ImageBase {
    /// A container managed by this system; resolved through the image resolver (or the
    /// previously-built-sibling map) to a pinned digest.
    BaseImage(String),
    /// A verbatim, un-pinned reference outside this system's control.
    ExternalImage(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Environment {
    pub(crate) base: ImageBase,
    pub(crate) packages: Vec<String>,
    pub(crate) rootfs_packages: Vec<String>,
    pub(crate) args: BTreeMap<String, String>,
    pub(crate) environment: BTreeMap<String, String>,
    pub(crate) workdir: Option<String>,
    pub(crate) user: Option<String>,
    pub(crate) entrypoint: Option<Vec<String>>,
    pub(crate) cmd: Option<Vec<String>>,
    pub(crate) expose: Vec<String>,
    pub(crate) volume: Option<Vec<String>>,
    pub(crate) stopsignal: Option<String>,
}


#[derive(Debug, Clone)]
pub(crate) struct RunStep {
    pub(crate) shell: String,
    pub(crate) build_deps: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct FetchStep {
    pub(crate) url: String,
    pub(crate) destination: String,
    pub(crate) extract: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct CopyStep {
    pub(crate) from: String,
    pub(crate) to: String,
    pub(crate) from_stage: Option<String>,
    pub(crate) chown: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) enum PipelineStep {
    Run(RunStep),
    Fetch(FetchStep),
    Copy(CopyStep),
    Uses(BuiltinPipeline),
}

// ----- raw (serde) shapes, validated and lowered into the above -----

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    package: RawPackage,
    #[serde(default)]
    vars: BTreeMap<String, String>,
    stages: Vec<RawStage>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawStage {
    name: String,
    environment: RawEnvironment,
    #[serde(default)]
    pipeline: Vec<RawPipelineStep>,
}

#[derive(Debug, Deserialize)]
struct RawEnvironment {
    #[serde(rename = "base-image")]
    base_image: Option<String>,
    #[serde(rename = "external-image")]
    external_image: Option<String>,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(rename = "rootfs-packages", default)]
    rootfs_packages: Vec<String>,
    #[serde(default)]
    args: BTreeMap<String, String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    workdir: Option<String>,
    user: Option<String>,
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    #[serde(default)]
    expose: Vec<String>,
    volume: Option<Vec<String>>,
    stopsignal: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRun {
    Shell(String),
    Detailed {
        shell: String,
        #[serde(rename = "build-deps", default)]
        build_deps: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawFetch {
    url: String,
    destination: Option<String>,
    #[serde(default)]
    extract: bool,
}

#[derive(Debug, Deserialize)]
struct RawCopy {
    from: String,
    to: String,
    #[serde(rename = "from-stage")]
    from_stage: Option<String>,
    chown: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawPipelineStep {
    run: Option<RawRun>,
    fetch: Option<RawFetch>,
    copy: Option<RawCopy>,
    uses: Option<String>,
    #[serde(default)]
    with: serde_json::Map<String, serde_json::Value>,
}

const DEFAULT_FETCH_DESTINATION: &str = "/tmp/download";

/// Reads and validates a descriptor file via the given filesystem, producing the typed model.
/// Fails fast on the first structural problem found (§4.1); variable-reference validation is a
/// separate pass run by the generator just before emission (§4.2), not here.
pub(crate) fn load(fs: &dyn Filesystem, path: &Path) -> Result<Descriptor> {
    let bytes = fs
        .read_file(path)
        .context(error::ReadSnafu { path: path.to_path_buf() })?;
    let raw: RawDescriptor =
        serde_yaml::from_slice(&bytes).context(error::ParseSnafu { path: path.to_path_buf() })?;
    lower(raw, path)
}

fn lower(raw: RawDescriptor, path: &Path) -> Result<Descriptor> {
    ensure!(
        !raw.package.name.trim().is_empty(),
        error::InvalidSnafu {
            path: path.to_path_buf(),
            message: "package.name must be a non-empty string".to_string(),
        }
    );

    let last_index = raw.stages.len().saturating_sub(1);
    let stages = raw
        .stages
        .into_iter()
        .enumerate()
        .map(|(i, stage)| lower_stage(stage, i == last_index, path))
        .collect::<Result<Vec<_>>>()?;

    Ok(Descriptor {
        package: Package {
            name: raw.package.name,
            labels: raw.package.labels,
        },
        vars: raw.vars,
        stages,
    })
}

fn lower_stage(raw: RawStage, is_final: bool, path: &Path) -> Result<Stage> {
    let environment = lower_environment(raw.environment, path)?;
    let pipeline = raw
        .pipeline
        .into_iter()
        .map(|step| lower_pipeline_step(step, path))
        .collect::<Result<Vec<_>>>()?;

    Ok(Stage {
        name: raw.name,
        environment,
        pipeline,
        is_final,
    })
}

fn lower_environment(raw: RawEnvironment, path: &Path) -> Result<Environment> {
    let base = match (raw.base_image, raw.external_image) {
        (Some(b), None) => ImageBase::BaseImage(b),
        (None, Some(e)) => ImageBase::ExternalImage(e),
        (Some(_), Some(_)) => {
            return error::InvalidSnafu {
                path: path.to_path_buf(),
                message: "stage environment must declare exactly one of base-image or external-image, found both".to_string(),
            }
            .fail()
        }
        (None, None) => {
            return error::InvalidSnafu {
                path: path.to_path_buf(),
                message: "stage environment must declare exactly one of base-image or external-image, found neither".to_string(),
            }
            .fail()
        }
    };

    Ok(Environment {
        base,
        packages: raw.packages,
        rootfs_packages: raw.rootfs_packages,
        args: raw.args,
        environment: raw.environment,
        workdir: raw.workdir,
        user: raw.user,
        entrypoint: raw.entrypoint,
        cmd: raw.cmd,
        expose: raw.expose,
        volume: raw.volume,
        stopsignal: raw.stopsignal,
    })
}

fn lower_pipeline_step(raw: RawPipelineStep, path: &Path) -> Result<PipelineStep> {
    let set_count = [
        raw.run.is_some(),
        raw.fetch.is_some(),
        raw.copy.is_some(),
        raw.uses.is_some(),
    ]
    .into_iter()
    .filter(|x| *x)
    .count();

    ensure!(
        set_count == 1,
        error::InvalidSnafu {
            path: path.to_path_buf(),
            message: format!(
                "pipeline step must set exactly one of run/fetch/copy/uses, found {}",
                set_count
            ),
        }
    );

    if let Some(run) = raw.run {
        let (shell, build_deps) = match run {
            RawRun::Shell(s) => (s, Vec::new()),
            RawRun::Detailed { shell, build_deps } => (shell, build_deps),
        };
        return Ok(PipelineStep::Run(RunStep {
            shell: normalize_shell(&shell),
            build_deps,
        }));
    }

    if let Some(fetch) = raw.fetch {
        return Ok(PipelineStep::Fetch(FetchStep {
            url: fetch.url,
            destination: fetch
                .destination
                .unwrap_or_else(|| DEFAULT_FETCH_DESTINATION.to_string()),
            extract: fetch.extract,
        }));
    }

    if let Some(copy) = raw.copy {
        return Ok(PipelineStep::Copy(CopyStep {
            from: copy.from,
            to: copy.to,
            from_stage: copy.from_stage,
            chown: copy.chown,
        }));
    }

    let name = raw.uses.expect("checked above");
    let builtin = pipeline::parse(&name, &raw.with, path)?;
    Ok(PipelineStep::Uses(builtin))
}

/// Normalise a multi-line `run:` block: strip empty lines, respect an author's explicit
/// trailing `\` continuations, and otherwise join remaining lines with `; \`.
fn normalize_shell(shell: &str) -> String {
    let lines: Vec<&str> = shell
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();

    if lines.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        let is_last = i == lines.len() - 1;
        let continues = line.trim_end().ends_with('\\');
        out.push_str(line.trim());
        if !is_last {
            if continues {
                out.push('\n');
            } else {
                out.push_str("; \\\n");
            }
        }
    }
    out
}
