//! Emits a CI workflow document describing the same layered build plan the orchestrator runs.

use serde::Serialize;

use crate::graph::Graph;

pub(crate) use error::Result;

#[derive(Debug, Serialize)]
struct WorkflowDocument {
    on: TriggerSection,
    jobs: serde_yaml::Mapping,
}

#[derive(Debug, Serialize)]
struct TriggerSection {
    workflow_dispatch: serde_yaml::Mapping,
    workflow_run: WorkflowRunTrigger,
}

#[derive(Debug, Serialize)]
struct WorkflowRunTrigger {
    workflows: Vec<String>,
    types: Vec<String>,
}

const SETUP_CACHE_JOB: &str = "setup-cache";

/// Serializes `graph`'s layered plan into a CI workflow YAML document: a global trigger
/// section, a fixed `setup-cache` job, one job per container (depending on `setup-cache`, its
/// in-set dependencies, and the previous layer's update job), a per-layer update job, and a
/// final commit job.
pub(crate) fn emit(graph: &Graph, upstream_workflow: &str) -> Result<String> {
    let layers = graph.layers().map_err(|source| error::Error::Graph { source })?;

    let mut jobs = serde_yaml::Mapping::new();
    jobs.insert(
        yaml_str(SETUP_CACHE_JOB),
        job_value(&["actions/checkout@v4".to_string()], &[]),
    );

    let mut previous_update_job: Option<String> = None;
    for (layer_index, layer) in layers.iter().enumerate() {
        for name in layer {
            let container = &graph.containers[name];
            let mut needs: Vec<String> = vec![SETUP_CACHE_JOB.to_string()];
            needs.extend(
                container
                    .dependencies
                    .iter()
                    .filter(|d| graph.containers.contains_key(*d))
                    .cloned(),
            );
            if let Some(update_job) = &previous_update_job {
                needs.push(update_job.clone());
            }
            jobs.insert(yaml_str(name), job_value(&["build".to_string()], &needs));
        }

        let update_job_name = format!("update-layer-{layer_index}");
        let mut needs = layer.clone();
        needs.push(SETUP_CACHE_JOB.to_string());
        jobs.insert(
            yaml_str(&update_job_name),
            job_value(&["regenerate".to_string()], &needs),
        );
        previous_update_job = Some(update_job_name);
    }

    if let Some(last_update_job) = &previous_update_job {
        jobs.insert(
            yaml_str("commit"),
            job_value(&["commit-and-push".to_string()], std::slice::from_ref(last_update_job)),
        );
    }

    let doc = WorkflowDocument {
        on: TriggerSection {
            workflow_dispatch: serde_yaml::Mapping::new(),
            workflow_run: WorkflowRunTrigger {
                workflows: vec![upstream_workflow.to_string()],
                types: vec!["completed".to_string()],
            },
        },
        jobs,
    };

    serde_yaml::to_string(&doc).map_err(|source| error::Error::Serialize { source })
}

fn yaml_str(s: &str) -> serde_yaml::Value {
    serde_yaml::Value::String(s.to_string())
}

fn job_value(steps: &[String], needs: &[String]) -> serde_yaml::Value {
    let mut map = serde_yaml::Mapping::new();
    if !needs.is_empty() {
        map.insert(
            yaml_str("needs"),
            serde_yaml::Value::Sequence(needs.iter().map(|n| yaml_str(n)).collect()),
        );
    }
    map.insert(
        yaml_str("steps"),
        serde_yaml::Value::Sequence(steps.iter().map(|s| yaml_str(s)).collect()),
    );
    serde_yaml::Value::Mapping(map)
}

pub(crate) mod error {
    use snafu::Snafu;

    pub(crate) type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("{source}"))]
        Graph { source: crate::graph::error::Error },

        #[snafu(display("Failed to serialize workflow document: {source}"))]
        Serialize { source: serde_yaml::Error },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor::{Descriptor, Environment, ImageBase, Package, Stage};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn container(name: &str, deps: &[&str]) -> (String, crate::graph::Container) {
        let descriptor = Descriptor {
            package: Package {
                name: name.to_string(),
                labels: BTreeMap::new(),
            },
            vars: BTreeMap::new(),
            stages: vec![Stage {
                name: "build".to_string(),
                environment: Environment {
                    base: ImageBase::ExternalImage("scratch".to_string()),
                    packages: vec![],
                    rootfs_packages: vec![],
                    args: BTreeMap::new(),
                    environment: BTreeMap::new(),
                    workdir: None,
                    user: None,
                    entrypoint: None,
                    cmd: None,
                    expose: vec![],
                    volume: None,
                    stopsignal: None,
                },
                pipeline: vec![],
                is_final: true,
            }],
        };
        (
            name.to_string(),
            crate::graph::Container {
                name: name.to_string(),
                descriptor_path: PathBuf::from(format!("{name}/dfo.yaml")),
                descriptor,
                dependencies: deps.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    #[test]
    fn emits_setup_cache_and_one_job_per_container() {
        let graph = Graph {
            containers: [container("a", &[]), container("b", &["a"])]
                .into_iter()
                .collect(),
        };
        let yaml = emit(&graph, "upstream").unwrap();
        assert!(yaml.contains("setup-cache"));
        assert!(yaml.contains("\"a\":") || yaml.contains("a:"));
        assert!(yaml.contains("commit"));
    }
}
