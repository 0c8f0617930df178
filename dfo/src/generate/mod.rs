//! Expands a descriptor into a deterministic Containerfile plus a bill-of-materials header.

pub(crate) mod bom;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use snafu::ensure;

use crate::descriptor::pipeline::PrimitiveOp;
use crate::descriptor::vars;
use crate::descriptor::{CopyStep, Descriptor, Environment, FetchStep, ImageBase, PipelineStep, RunStep};
use crate::fs::Filesystem;
use crate::resolve::image::ImageResolver;
use crate::resolve::package::PackageResolver;

pub(crate) use error::Result;
use bom::Bom;

pub(crate) struct GeneratorInputs<'a> {
    pub(crate) descriptor_path: &'a Path,
    pub(crate) output_dir: &'a Path,
    pub(crate) image_resolver: &'a ImageResolver,
    pub(crate) package_resolver: &'a PackageResolver<'a>,
    pub(crate) distro_version: &'a str,
    /// Short container name -> digest of an already-built sibling, consulted before the
    /// image resolver so downstream stages reference the image just produced this run.
    pub(crate) built_siblings: &'a BTreeMap<String, String>,
}

pub(crate) struct Generated {
    pub(crate) containerfile_path: PathBuf,
    pub(crate) bom: Bom,
}

/// Generate the Containerfile for `descriptor` under `inputs.output_dir`, writing it through
/// `fs`. Variable-reference validation runs first and writes nothing on failure.
pub(crate) fn generate(
    fs: &dyn Filesystem,
    descriptor: &Descriptor,
    inputs: &GeneratorInputs,
) -> Result<Generated> {
    validate_vars(descriptor, inputs.descriptor_path)?;

    let mut bom = Bom::new();
    bom.insert_version("alpine", inputs.distro_version);
    let mut out = String::new();

    let last_index = descriptor.stages.len().saturating_sub(1);
    for (i, stage) in descriptor.stages.iter().enumerate() {
        emit_stage(&mut out, &mut bom, descriptor, stage, i == last_index, inputs)?;
    }

    let containerfile = format!("{}\n{out}", bom.header_line());
    let containerfile_path = inputs.output_dir.join("Containerfile");
    fs.write_file(&containerfile_path, containerfile.as_bytes())
        .map_err(|source| error::Error::Write { source })?;

    Ok(Generated {
        containerfile_path,
        bom,
    })
}

fn emit_stage(
    out: &mut String,
    bom: &mut Bom,
    descriptor: &Descriptor,
    stage: &crate::descriptor::Stage,
    is_final: bool,
    inputs: &GeneratorInputs,
) -> Result<()> {
    let env = &stage.environment;
    let from_ref = resolve_from(env, bom, inputs)?;
    if is_final {
        out.push_str(&format!("FROM {from_ref}\n"));
    } else {
        out.push_str(&format!("FROM {from_ref} AS {}\n", stage.name));
    }

    if is_final {
        for (k, v) in &descriptor.package.labels {
            out.push_str(&format!("LABEL {k}=\"{}\"\n", vars::expand(v, &descriptor.vars)));
        }
    }

    for (k, v) in &env.args {
        out.push_str(&format!("ARG {k}={}\n", vars::expand(v, &descriptor.vars)));
    }
    for (k, v) in &env.environment {
        out.push_str(&format!("ENV {k}={}\n", vars::expand(v, &descriptor.vars)));
    }

    if !env.packages.is_empty() {
        emit_package_install_block(out, bom, &env.packages, inputs)?;
    }
    if !env.rootfs_packages.is_empty() {
        emit_rootfs_block(out, bom, &env.rootfs_packages, inputs)?;
    }

    for step in &stage.pipeline {
        emit_pipeline_step(out, bom, step, &descriptor.vars, inputs)?;
    }

    if let Some(workdir) = &env.workdir {
        out.push_str(&format!("WORKDIR {}\n", vars::expand(workdir, &descriptor.vars)));
    }
    if let Some(user) = &env.user {
        out.push_str(&format!("USER {}\n", vars::expand(user, &descriptor.vars)));
    }
    if let Some(stopsignal) = &env.stopsignal {
        out.push_str(&format!(
            "STOPSIGNAL {}\n",
            vars::expand(stopsignal, &descriptor.vars)
        ));
    }
    for port in &env.expose {
        out.push_str(&format!("EXPOSE {}\n", vars::expand(port, &descriptor.vars)));
    }
    if let Some(volumes) = &env.volume {
        let expanded: Vec<String> = volumes.iter().map(|v| vars::expand(v, &descriptor.vars)).collect();
        out.push_str(&format!("VOLUME {}\n", json_array(&expanded)));
    }
    if let Some(entrypoint) = &env.entrypoint {
        let expanded: Vec<String> = entrypoint.iter().map(|v| vars::expand(v, &descriptor.vars)).collect();
        out.push_str(&format!("ENTRYPOINT {}\n", json_array(&expanded)));
    }
    if let Some(cmd) = &env.cmd {
        let expanded: Vec<String> = cmd.iter().map(|v| vars::expand(v, &descriptor.vars)).collect();
        out.push_str(&format!("CMD {}\n", json_array(&expanded)));
    }

    Ok(())
}

fn resolve_from(env: &Environment, bom: &mut Bom, inputs: &GeneratorInputs) -> Result<String> {
    match &env.base {
        ImageBase::ExternalImage(reference) => Ok(reference.clone()),
        ImageBase::BaseImage(name) => {
            if let Some(digest) = inputs.built_siblings.get(name) {
                bom.insert_image(name, digest);
                return Ok(format!("{name}@{digest}"));
            }
            let resolved = inputs
                .image_resolver
                .resolve(name)
                .map_err(|source| error::Error::ImageResolve { source })?;
            bom.insert_image(name, &resolved.digest);
            Ok(resolved.full_ref())
        }
    }
}

fn emit_package_install_block(
    out: &mut String,
    bom: &mut Bom,
    packages: &[String],
    inputs: &GeneratorInputs,
) -> Result<()> {
    let resolved = inputs
        .package_resolver
        .resolve(packages, inputs.distro_version)
        .map_err(|source| error::Error::PackageResolve { source })?;
    for pkg in &resolved {
        bom.insert_apk(&pkg.name, &pkg.version);
    }
    let specs = pinned_specs(&resolved);
    out.push_str(&format!("RUN set -eux; apk add --no-cache {specs}\n"));
    Ok(())
}

fn emit_rootfs_block(
    out: &mut String,
    bom: &mut Bom,
    rootfs_packages: &[String],
    inputs: &GeneratorInputs,
) -> Result<()> {
    for pkg in rootfs_packages {
        let resolved = inputs
            .package_resolver
            .resolve(std::slice::from_ref(pkg), inputs.distro_version)
            .map_err(|source| error::Error::PackageResolve { source })?;
        let entry = resolved
            .iter()
            .find(|p| &p.name == pkg)
            .ok_or_else(|| error::Error::PackageResolve {
                source: crate::resolve::package::error::Error::NotFound { name: pkg.clone() },
            })?;
        bom.insert_apk(&entry.name, &entry.version);
        out.push_str(&format!(
            "RUN apk add --no-cache {}={}\n",
            entry.name, entry.version
        ));
        out.push_str(&format!(
            "RUN apk info -qL {} | rsync -aq --files-from=- / /rootfs/\n",
            entry.name
        ));
    }
    Ok(())
}

fn pinned_specs(resolved: &BTreeSet<crate::resolve::package::ResolvedPackage>) -> String {
    resolved
        .iter()
        .map(|p| format!("{}={}", p.name, p.version))
        .collect::<Vec<_>>()
        .join(" ")
}

fn emit_pipeline_step(
    out: &mut String,
    bom: &mut Bom,
    step: &PipelineStep,
    descriptor_vars: &BTreeMap<String, String>,
    inputs: &GeneratorInputs,
) -> Result<()> {
    match step {
        PipelineStep::Run(run) => emit_run(out, bom, run, descriptor_vars, inputs),
        PipelineStep::Fetch(fetch) => {
            emit_fetch(out, fetch, descriptor_vars);
            Ok(())
        }
        PipelineStep::Copy(copy) => {
            emit_copy(out, copy, descriptor_vars);
            Ok(())
        }
        PipelineStep::Uses(builtin) => {
            for op in builtin.expand() {
                match op {
                    PrimitiveOp::Run(run) => emit_run(out, bom, &run, descriptor_vars, inputs)?,
                    PrimitiveOp::Fetch(fetch) => emit_fetch(out, &fetch, descriptor_vars),
                    PrimitiveOp::Copy(copy) => emit_copy(out, &copy, descriptor_vars),
                }
            }
            Ok(())
        }
    }
}

fn emit_run(
    out: &mut String,
    bom: &mut Bom,
    run: &RunStep,
    descriptor_vars: &BTreeMap<String, String>,
    inputs: &GeneratorInputs,
) -> Result<()> {
    let shell = vars::expand(&run.shell, descriptor_vars);
    if run.build_deps.is_empty() {
        out.push_str(&format!("RUN {shell}\n"));
        return Ok(());
    }

    let resolved = inputs
        .package_resolver
        .resolve(&run.build_deps, inputs.distro_version)
        .map_err(|source| error::Error::PackageResolve { source })?;
    for pkg in &resolved {
        bom.insert_apk(&pkg.name, &pkg.version);
    }
    let specs = pinned_specs(&resolved);
    out.push_str(&format!(
        "RUN apk add --no-cache --virtual .build-deps {specs}; {shell}; apk del --no-network .build-deps\n"
    ));
    Ok(())
}

fn emit_fetch(out: &mut String, fetch: &FetchStep, descriptor_vars: &BTreeMap<String, String>) {
    let url = vars::expand(&fetch.url, descriptor_vars);
    let destination = vars::expand(&fetch.destination, descriptor_vars);
    if fetch.extract {
        out.push_str(&format!("RUN curl -fsSL \"{url}\" | tar -xz -C \"{destination}\"\n"));
    } else {
        out.push_str(&format!("RUN curl -fsSL -o {destination} \"{url}\"\n"));
    }
}

fn emit_copy(out: &mut String, copy: &CopyStep, descriptor_vars: &BTreeMap<String, String>) {
    let from = vars::expand(&copy.from, descriptor_vars);
    let to = vars::expand(&copy.to, descriptor_vars);
    let mut flags = String::new();
    if let Some(stage) = &copy.from_stage {
        flags.push_str(&format!("--from={stage} "));
    }
    if let Some(chown) = &copy.chown {
        flags.push_str(&format!("--chown={} ", vars::expand(chown, descriptor_vars)));
    }
    out.push_str(&format!("COPY {flags}{from} {to}\n"));
}

fn json_array(items: &[String]) -> String {
    serde_json::to_string(items).expect("vec of strings always serializes")
}

/// Every `%{NAME}` reference across the descriptor's string fields (including built-in
/// pipeline expansions) must resolve against `descriptor.vars`, checked up front so a bad
/// reference never results in a partially written Containerfile.
fn validate_vars(descriptor: &Descriptor, path: &Path) -> Result<()> {
    let mut offenders: Vec<String> = Vec::new();
    for s in collect_strings(descriptor) {
        for name in vars::references(&s) {
            if !descriptor.vars.contains_key(&name) {
                offenders.push(name);
            }
        }
    }
    offenders.sort();
    offenders.dedup();
    ensure!(
        offenders.is_empty(),
        error::UndefinedVariableSnafu {
            path: path.to_path_buf(),
            offenders,
        }
    );
    Ok(())
}

fn collect_strings(descriptor: &Descriptor) -> Vec<String> {
    let mut out = Vec::new();
    out.extend(descriptor.package.labels.values().cloned());
    for stage in &descriptor.stages {
        let env = &stage.environment;
        out.extend(env.args.values().cloned());
        out.extend(env.environment.values().cloned());
        out.extend(env.workdir.clone());
        out.extend(env.user.clone());
        out.extend(env.entrypoint.iter().flatten().cloned());
        out.extend(env.cmd.iter().flatten().cloned());
        out.extend(env.expose.iter().cloned());
        out.extend(env.volume.iter().flatten().cloned());
        out.extend(env.stopsignal.clone());

        for step in &stage.pipeline {
            match step {
                PipelineStep::Run(run) => out.push(run.shell.clone()),
                PipelineStep::Fetch(fetch) => {
                    out.push(fetch.url.clone());
                    out.push(fetch.destination.clone());
                }
                PipelineStep::Copy(copy) => {
                    out.push(copy.from.clone());
                    out.push(copy.to.clone());
                    out.extend(copy.chown.clone());
                }
                PipelineStep::Uses(builtin) => {
                    for op in builtin.expand() {
                        match op {
                            PrimitiveOp::Run(run) => out.push(run.shell),
                            PrimitiveOp::Fetch(fetch) => {
                                out.push(fetch.url);
                                out.push(fetch.destination);
                            }
                            PrimitiveOp::Copy(copy) => {
                                out.push(copy.from);
                                out.push(copy.to);
                                out.extend(copy.chown);
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

pub(crate) mod error {
    use std::path::PathBuf;

    use snafu::Snafu;

    pub(crate) type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display(
            "Undefined variable reference(s) in '{}': {}",
            path.display(),
            offenders.join(", ")
        ))]
        UndefinedVariable {
            path: PathBuf,
            offenders: Vec<String>,
        },

        #[snafu(display("{source}"))]
        ImageResolve {
            source: crate::resolve::image::error::Error,
        },

        #[snafu(display("{source}"))]
        PackageResolve {
            source: crate::resolve::package::error::Error,
        },

        #[snafu(display("Failed to write Containerfile: {source}"))]
        Write { source: crate::fs::error::Error },
    }
}
