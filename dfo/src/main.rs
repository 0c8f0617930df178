//! Entrypoint for the `dfo` command line program.

mod builder;
mod cache;
mod cli;
mod config;
mod descriptor;
mod error;
mod fs;
mod generate;
mod graph;
mod orchestrate;
mod resolve;
mod workflow;

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use snafu::ResultExt;

use builder::ExternalBuilder;
use cli::{Cli, Command};
use config::RunConfig;
use fs::{Filesystem, RealFilesystem};
use resolve::image::ImageResolver;
use resolve::package::{PackageIndexClient, PackageResolver};

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Warn;

fn main() {
    let cli = Cli::parse();
    init_logger(cli.log_level);

    if let Err(e) = run(cli) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

/// Use `level` if present, or else use `RUST_LOG` if present, or else use a default.
fn init_logger(level: Option<LevelFilter>) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            Builder::from_default_env().init();
        }
        _ => {
            Builder::new()
                .filter(
                    Some(env!("CARGO_CRATE_NAME")),
                    level.unwrap_or(DEFAULT_LEVEL_FILTER),
                )
                .init();
        }
    }
}

fn run(cli: Cli) -> error::Result<()> {
    let config = RunConfig::load(&cli).context(error::ConfigSnafu)?;

    match cli.command {
        Command::Single(args) => run_single(&args.descriptor, &config),
        Command::All(_) => run_all(&config),
        Command::Orchestrate(_) => run_orchestrate(&config),
    }
}

fn run_single(descriptor_path: &std::path::Path, config: &RunConfig) -> error::Result<()> {
    let fs = RealFilesystem;
    let descriptor =
        descriptor::load(&fs, descriptor_path).map_err(|source| error::Error::Descriptor { source })?;

    let package_client = package_index_client();
    let distro_version = distro_version(config, &package_client)?;
    let package_resolver = PackageResolver::new(&package_client, dfo_config::DEFAULT_REPOS.iter().map(|r| r.to_string()).collect());
    let image_tool = oci_cli_wrapper::ImageTool::from_environment()
        .map_err(|source| error::Error::ImageTool { source })?;
    let image_resolver = ImageResolver::new(image_tool, config.registry.clone(), true);

    let output_dir = descriptor_path.parent().unwrap_or(std::path::Path::new("."));
    let built_siblings: BTreeMap<String, String> = BTreeMap::new();
    let inputs = generate::GeneratorInputs {
        descriptor_path,
        output_dir,
        image_resolver: &image_resolver,
        package_resolver: &package_resolver,
        distro_version: &distro_version,
        built_siblings: &built_siblings,
    };

    generate::generate(&fs, &descriptor, &inputs).map_err(|source| error::Error::Generate { source })?;
    println!("Generated Containerfile for 1 container");
    Ok(())
}

fn run_all(config: &RunConfig) -> error::Result<()> {
    let fs = RealFilesystem;
    let graph = graph::Graph::discover(&fs, &config.directory, &config.descriptor_filename)
        .map_err(|source| error::Error::Graph { source })?;

    let package_client = package_index_client();
    let distro_version = distro_version(config, &package_client)?;
    let package_resolver = PackageResolver::new(&package_client, dfo_config::DEFAULT_REPOS.iter().map(|r| r.to_string()).collect());
    let image_tool = oci_cli_wrapper::ImageTool::from_environment()
        .map_err(|source| error::Error::ImageTool { source })?;
    let image_resolver = ImageResolver::new(image_tool, config.registry.clone(), true);
    let built_siblings: BTreeMap<String, String> = BTreeMap::new();

    for container in graph.containers.values() {
        let output_dir = container
            .descriptor_path
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let inputs = generate::GeneratorInputs {
            descriptor_path: &container.descriptor_path,
            output_dir,
            image_resolver: &image_resolver,
            package_resolver: &package_resolver,
            distro_version: &distro_version,
            built_siblings: &built_siblings,
        };
        generate::generate(&fs, &container.descriptor, &inputs)
            .map_err(|source| error::Error::Generate { source })?;
    }

    println!("Generated Containerfiles for {} containers", graph.containers.len());
    Ok(())
}

fn run_orchestrate(config: &RunConfig) -> error::Result<()> {
    let fs = RealFilesystem;
    let graph = graph::Graph::discover(&fs, &config.directory, &config.descriptor_filename)
        .map_err(|source| error::Error::Graph { source })?;

    let package_client = package_index_client();
    let distro_version = distro_version(config, &package_client)?;
    let package_resolver = PackageResolver::new(&package_client, dfo_config::DEFAULT_REPOS.iter().map(|r| r.to_string()).collect());
    let image_tool = oci_cli_wrapper::ImageTool::from_environment()
        .map_err(|source| error::Error::ImageTool { source })?;
    let image_resolver = ImageResolver::new(image_tool, config.registry.clone(), true);

    let mut extra_build_args = Vec::new();
    if let Some(path) = &config.storage_path {
        extra_build_args.push("--root".to_string());
        extra_build_args.push(path.display().to_string());
    }
    if let Some(driver) = &config.storage_driver {
        extra_build_args.push("--storage-driver".to_string());
        extra_build_args.push(driver.clone());
    }
    if let Some(isolation) = &config.isolation {
        extra_build_args.push("--isolation".to_string());
        extra_build_args.push(isolation.clone());
    }
    if let Some(user) = &config.git_user {
        extra_build_args.push("--build-arg".to_string());
        extra_build_args.push(format!("GIT_USER={user}"));
    }
    if let Some(pass) = &config.git_pass {
        extra_build_args.push("--build-arg".to_string());
        extra_build_args.push(format!("GIT_PASS={pass}"));
    }

    let tool_name = std::env::var("DFO_IMAGE_TOOL").unwrap_or_else(|_| "docker".to_string());
    let build_tool_path = which::which(&tool_name).unwrap_or_else(|_| PathBuf::from(&tool_name));
    let build_image_tool = oci_cli_wrapper::ImageTool::from_environment()
        .map_err(|source| error::Error::ImageTool { source })?;
    let mut builder = builder::ProcessBuilder::new(build_tool_path, config.registry.clone(), build_image_tool)
        .with_extra_build_args(extra_build_args);
    builder
        .initialize()
        .map_err(|source| error::Error::Builder { source })?;

    let options = orchestrate::OrchestratorOptions {
        output_root: config.directory.clone(),
        distro_version,
        registry: config.registry.clone(),
        concurrency: config.concurrency,
        force_rebuild: config.force_rebuild,
        push: config.push,
    };

    let results = orchestrate::run(
        &fs,
        &graph,
        &image_resolver,
        &package_resolver,
        &builder,
        &options,
    )
    .map_err(|source| error::Error::Orchestrate { source })?;

    builder.close().map_err(|source| error::Error::Builder { source })?;

    if let Some(workflow_path) = &config.workflow {
        let upstream_workflow = "build-upstream";
        let document =
            workflow::emit(&graph, upstream_workflow).map_err(|source| error::Error::Workflow { source })?;
        fs.write_file(workflow_path, document.as_bytes())
            .map_err(|source| error::Error::Fs { source })?;
    }

    let built = results
        .iter()
        .filter(|r| matches!(r.outcome, orchestrate::JobOutcome::Built | orchestrate::JobOutcome::FromCache))
        .count();
    println!(
        "Processed {} containers ({} built or cached, {} total)",
        results.len(),
        built,
        graph.containers.len()
    );
    Ok(())
}

fn package_index_client() -> PackageIndexClient {
    PackageIndexClient::new(
        dfo_config::DEFAULT_PACKAGE_INDEX_URL_TEMPLATE.to_string(),
        dfo_config::DEFAULT_RELEASE_INDEX_URL.to_string(),
    )
}

fn distro_version(config: &RunConfig, client: &PackageIndexClient) -> error::Result<String> {
    match &config.alpine_version {
        Some(version) => Ok(version.clone()),
        None => client
            .latest_stable_version()
            .map_err(|source| error::Error::Package { source }),
    }
}
