//! Per-layer bounded-concurrency build scheduling on real OS threads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use snafu::ResultExt;

use crate::builder::{BuildResult as ExternalBuildResult, ExternalBuilder};
use crate::cache::BuildCache;
use crate::fs::Filesystem;
use crate::generate::{self, GeneratorInputs};
use crate::graph::{Container, Graph};
use crate::resolve::image::ImageResolver;
use crate::resolve::package::PackageResolver;

pub(crate) use error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Ignored,
    FromCache,
    Built,
    Failed(String),
}

#[derive(Debug, Clone)]
pub(crate) struct LayerJobResult {
    pub(crate) container_name: String,
    pub(crate) outcome: JobOutcome,
    pub(crate) digest: Option<String>,
    pub(crate) full_ref: Option<String>,
}

pub(crate) struct OrchestratorOptions {
    pub(crate) output_root: PathBuf,
    pub(crate) distro_version: String,
    pub(crate) registry: Option<String>,
    pub(crate) concurrency: usize,
    pub(crate) force_rebuild: bool,
    pub(crate) push: bool,
}

/// Runs a full orchestration over `graph`'s layered plan. Containers in layer L+1 are never
/// started until every container in layer L has terminated; cross-layer digest propagation
/// happens through `built_registry`, read by the next layer's Containerfile generation.
pub(crate) fn run(
    fs: &(dyn Filesystem + Sync),
    graph: &Graph,
    image_resolver: &ImageResolver,
    package_resolver: &PackageResolver,
    builder: &(dyn ExternalBuilder + Sync),
    options: &OrchestratorOptions,
) -> Result<Vec<LayerJobResult>> {
    let layers = graph.layers().context(error::GraphSnafu)?;

    let mut cache = BuildCache::load(fs, &options.output_root);
    if options.force_rebuild {
        cache.invalidate_all();
    }
    let cache = Arc::new(Mutex::new(cache));
    let built_registry: Arc<RwLock<BTreeMap<String, String>>> = Arc::new(RwLock::new(BTreeMap::new()));

    let mut all_results = Vec::new();

    for layer in &layers {
        let built_siblings = built_registry.read().unwrap().clone();

        let mut containers = Vec::new();
        for name in layer {
            let container = &graph.containers[name];
            let generated_dir = options.output_root.join(name);
            fs.mkdir_all(&generated_dir).context(error::FsSnafu)?;

            let inputs = GeneratorInputs {
                descriptor_path: &container.descriptor_path,
                output_dir: &generated_dir,
                image_resolver,
                package_resolver,
                distro_version: &options.distro_version,
                built_siblings: &built_siblings,
            };
            generate::generate(fs, &container.descriptor, &inputs).context(error::GenerateSnafu)?;
            containers.push((container.clone(), generated_dir));
        }

        let pool_size = options.concurrency.max(1).min(containers.len().max(1));
        let results = run_layer(fs, containers, builder, &cache, options, pool_size)?;

        let mut failures = Vec::new();
        for result in &results {
            if let JobOutcome::Failed(reason) = &result.outcome {
                failures.push(format!("✗ {}: {reason}", result.container_name));
            }
            if let (JobOutcome::FromCache | JobOutcome::Built, Some(digest)) =
                (&result.outcome, &result.digest)
            {
                built_registry
                    .write()
                    .unwrap()
                    .insert(result.container_name.clone(), digest.clone());
            }
        }

        all_results.extend(results);

        if !failures.is_empty() {
            cache.lock().unwrap().save(fs);
            return error::BuildFailedSnafu {
                message: failures.join("\n"),
            }
            .fail();
        }
    }

    cache.lock().unwrap().save(fs);
    Ok(all_results)
}

fn run_layer(
    fs: &(dyn Filesystem + Sync),
    containers: Vec<(Container, PathBuf)>,
    builder: &(dyn ExternalBuilder + Sync),
    cache: &Arc<Mutex<BuildCache>>,
    options: &OrchestratorOptions,
    pool_size: usize,
) -> Result<Vec<LayerJobResult>> {
    let jobs: Arc<Mutex<Vec<(Container, PathBuf)>>> = Arc::new(Mutex::new(containers));
    let results: Arc<Mutex<Vec<LayerJobResult>>> = Arc::new(Mutex::new(Vec::new()));

    std::thread::scope(|scope| {
        for _ in 0..pool_size {
            let jobs = Arc::clone(&jobs);
            let results = Arc::clone(&results);
            let cache = Arc::clone(cache);
            scope.spawn(|| {
                loop {
                    let next = jobs.lock().unwrap().pop();
                    let Some((container, context_dir)) = next else {
                        break;
                    };
                    let result = process_container(fs, &container, &context_dir, builder, &cache, options);
                    results.lock().unwrap().push(result);
                }
            });
        }
    });

    Ok(Arc::try_unwrap(results).unwrap().into_inner().unwrap())
}

fn process_container(
    fs: &(dyn Filesystem + Sync),
    container: &Container,
    context_dir: &Path,
    builder: &(dyn ExternalBuilder + Sync),
    cache: &Arc<Mutex<BuildCache>>,
    options: &OrchestratorOptions,
) -> LayerJobResult {
    let name = &container.name;
    log::info!("Starting container '{name}'");

    let ignore_sentinel = container
        .descriptor_path
        .parent()
        .map(|d| d.join(dfo_config::IGNORE_SENTINEL))
        .unwrap_or_default();
    if fs.exists(&ignore_sentinel) {
        log::info!("Container '{name}' has an IGNORE sentinel, skipping");
        return LayerJobResult {
            container_name: name.clone(),
            outcome: JobOutcome::Ignored,
            digest: None,
            full_ref: None,
        };
    }

    let needs_rebuild = cache
        .lock()
        .unwrap()
        .needs_rebuild(fs, name, &container.descriptor_path);

    if !needs_rebuild {
        if let Some(digest) = cache.lock().unwrap().cached_digest(name) {
            let image_name = qualified_name(options.registry.as_deref(), name);
            if options.push {
                if let Err(e) = builder.push_image(&image_name) {
                    return LayerJobResult {
                        container_name: name.clone(),
                        outcome: JobOutcome::Failed(e.to_string()),
                        digest: None,
                        full_ref: None,
                    };
                }
            }
            log::info!("Container '{name}' satisfied from cache");
            return LayerJobResult {
                container_name: name.clone(),
                outcome: JobOutcome::FromCache,
                digest: Some(digest.clone()),
                full_ref: Some(format!("{image_name}@{digest}")),
            };
        }
    }

    let containerfile_path = context_dir.join("Containerfile");
    let build_result: ExternalBuildResult =
        match builder.build_container(name, &containerfile_path, context_dir) {
            Ok(result) => result,
            Err(e) => {
                return LayerJobResult {
                    container_name: name.clone(),
                    outcome: JobOutcome::Failed(e.to_string()),
                    digest: None,
                    full_ref: None,
                };
            }
        };

    if let Err(e) = cache
        .lock()
        .unwrap()
        .record(fs, name, &container.descriptor_path, &build_result.digest)
    {
        log::warn!("Failed to record cache entry for '{name}': {e}");
    }

    if options.push {
        if let Err(e) = builder.push_image(&build_result.image_name) {
            return LayerJobResult {
                container_name: name.clone(),
                outcome: JobOutcome::Failed(e.to_string()),
                digest: Some(build_result.digest),
                full_ref: Some(build_result.full_ref),
            };
        }
    }

    log::info!("Container '{name}' built successfully");
    LayerJobResult {
        container_name: name.clone(),
        outcome: JobOutcome::Built,
        digest: Some(build_result.digest),
        full_ref: Some(build_result.full_ref),
    }
}

fn qualified_name(registry: Option<&str>, name: &str) -> String {
    match registry {
        Some(registry) => format!("{registry}/{name}:latest"),
        None => format!("{name}:latest"),
    }
}

pub(crate) mod error {
    use snafu::Snafu;

    pub(crate) type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("{source}"))]
        Graph { source: crate::graph::error::Error },

        #[snafu(display("{source}"))]
        Generate { source: crate::generate::error::Error },

        #[snafu(display("{source}"))]
        Fs { source: crate::fs::error::Error },

        #[snafu(display("one or more containers failed to build:\n{message}"))]
        BuildFailed { message: String },
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::descriptor::{Descriptor, Environment, ImageBase, Package, Stage};
    use crate::fs::MemFilesystem;
    use crate::resolve::package::PackageIndexClient;

    #[test]
    fn qualified_name_includes_registry_when_present() {
        assert_eq!(
            qualified_name(Some("registry.example.com"), "app"),
            "registry.example.com/app:latest"
        );
        assert_eq!(qualified_name(None, "app"), "app:latest");
    }

    #[derive(Default)]
    struct FakeBuilder {
        build_calls: AtomicUsize,
        push_calls: AtomicUsize,
    }

    impl ExternalBuilder for FakeBuilder {
        fn initialize(&mut self) -> crate::builder::Result<()> {
            Ok(())
        }

        fn build_container(
            &self,
            container_name: &str,
            _containerfile_path: &Path,
            _context_dir: &Path,
        ) -> crate::builder::Result<ExternalBuildResult> {
            self.build_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExternalBuildResult {
                container_name: container_name.to_string(),
                image_name: format!("{container_name}:latest"),
                digest: "sha256:fresh".to_string(),
                full_ref: format!("{container_name}:latest@sha256:fresh"),
            })
        }

        fn push_image(&self, _image_name: &str) -> crate::builder::Result<()> {
            self.push_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) -> crate::builder::Result<()> {
            Ok(())
        }
    }

    fn leaf_container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            descriptor_path: PathBuf::from(format!("/containers/{name}/dfo.yaml")),
            descriptor: Descriptor {
                package: Package {
                    name: name.to_string(),
                    labels: BTreeMap::new(),
                },
                vars: BTreeMap::new(),
                stages: vec![Stage {
                    name: "final".to_string(),
                    environment: Environment {
                        base: ImageBase::ExternalImage("scratch".to_string()),
                        packages: Vec::new(),
                        rootfs_packages: Vec::new(),
                        args: BTreeMap::new(),
                        environment: BTreeMap::new(),
                        workdir: None,
                        user: None,
                        entrypoint: None,
                        cmd: None,
                        expose: Vec::new(),
                        volume: None,
                        stopsignal: None,
                    },
                    pipeline: Vec::new(),
                    is_final: true,
                }],
            },
            dependencies: Vec::new(),
        }
    }

    fn graph_of(names: &[&str]) -> Graph {
        let mut containers = BTreeMap::new();
        for name in names {
            containers.insert(name.to_string(), leaf_container(name));
        }
        Graph { containers }
    }

    fn resolvers() -> (PackageIndexClient, ImageResolver) {
        let package_client = PackageIndexClient::new(
            "http://example.invalid/{repo}/{version}".to_string(),
            "http://example.invalid/releases".to_string(),
        );
        let image_tool = oci_cli_wrapper::ImageTool::new(Box::new(UnusedImageTool));
        let image_resolver = ImageResolver::new(image_tool, None, false);
        (package_client, image_resolver)
    }

    #[derive(Debug)]
    struct UnusedImageTool;

    impl oci_cli_wrapper::ImageToolImpl for UnusedImageTool {
        fn pull_oci_image(&self, _path: &Path, _uri: &str) -> oci_cli_wrapper::Result<()> {
            unreachable!("test descriptors never reference a base-image needing resolution")
        }
        fn get_config(&self, _uri: &str) -> oci_cli_wrapper::Result<oci_cli_wrapper::ConfigView> {
            unreachable!()
        }
        fn get_manifest(&self, _uri: &str) -> oci_cli_wrapper::Result<Vec<u8>> {
            unreachable!()
        }
        fn get_digest(&self, _uri: &str) -> oci_cli_wrapper::Result<String> {
            unreachable!()
        }
        fn push_oci_archive(&self, _path: &Path, _uri: &str) -> oci_cli_wrapper::Result<()> {
            unreachable!()
        }
        fn push_multi_platform_manifest(
            &self,
            _platform_images: Vec<(oci_cli_wrapper::DockerArchitecture, String)>,
            _uri: &str,
        ) -> oci_cli_wrapper::Result<()> {
            unreachable!()
        }
    }

    fn write_descriptor_file(fs: &MemFilesystem, container: &Container, contents: &[u8]) {
        fs.write_file(&container.descriptor_path, contents).unwrap();
    }

    #[test]
    fn first_run_builds_every_container_and_second_run_is_served_from_cache() {
        let fs = MemFilesystem::new();
        let graph = graph_of(&["a", "b"]);
        for container in graph.containers.values() {
            write_descriptor_file(&fs, container, b"descriptor bytes");
        }

        let (package_client, image_resolver) = resolvers();
        let package_resolver = PackageResolver::new(&package_client, vec!["main".to_string()]);
        let mut builder = FakeBuilder::default();
        let options = OrchestratorOptions {
            output_root: PathBuf::from("/out"),
            distro_version: "3.19".to_string(),
            registry: None,
            concurrency: 2,
            force_rebuild: false,
            push: false,
        };

        let first = run(&fs, &graph, &image_resolver, &package_resolver, &builder, &options).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|r| r.outcome == JobOutcome::Built));
        assert_eq!(builder.build_calls.load(Ordering::SeqCst), 2);

        builder = FakeBuilder::default();
        let second = run(&fs, &graph, &image_resolver, &package_resolver, &builder, &options).unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|r| r.outcome == JobOutcome::FromCache));
        assert_eq!(
            builder.build_calls.load(Ordering::SeqCst),
            0,
            "an unchanged re-run must not invoke the external builder at all"
        );
    }

    #[test]
    fn cache_hit_still_pushes_when_push_is_requested() {
        let fs = MemFilesystem::new();
        let graph = graph_of(&["a"]);
        for container in graph.containers.values() {
            write_descriptor_file(&fs, container, b"descriptor bytes");
        }

        let (package_client, image_resolver) = resolvers();
        let package_resolver = PackageResolver::new(&package_client, vec!["main".to_string()]);

        let warm = FakeBuilder::default();
        let base_options = OrchestratorOptions {
            output_root: PathBuf::from("/out"),
            distro_version: "3.19".to_string(),
            registry: None,
            concurrency: 1,
            force_rebuild: false,
            push: false,
        };
        run(&fs, &graph, &image_resolver, &package_resolver, &warm, &base_options).unwrap();

        let pushing = FakeBuilder::default();
        let push_options = OrchestratorOptions {
            push: true,
            ..base_options
        };
        let results = run(&fs, &graph, &image_resolver, &package_resolver, &pushing, &push_options).unwrap();

        assert!(results.iter().all(|r| r.outcome == JobOutcome::FromCache));
        assert_eq!(pushing.build_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            pushing.push_calls.load(Ordering::SeqCst),
            1,
            "a cache hit with --push must still push the previously built image"
        );
    }
}
