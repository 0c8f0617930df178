//! Dependency graph construction and layered topological sort.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use snafu::ensure;

use crate::descriptor::{Descriptor, ImageBase};
use crate::fs::{Filesystem, WalkAction};

pub(crate) use error::Result;

#[derive(Debug, Clone)]
pub(crate) struct Container {
    pub(crate) name: String,
    pub(crate) descriptor_path: PathBuf,
    pub(crate) descriptor: Descriptor,
    pub(crate) dependencies: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct Graph {
    pub(crate) containers: BTreeMap<String, Container>,
}

impl Graph {
    /// Walks `root` for descriptor files named `dfo.yaml`, loads each, and builds the
    /// dependency graph. Two descriptors whose directory basenames collide are rejected
    /// rather than one silently overwriting the other.
    pub(crate) fn discover(
        fs: &dyn Filesystem,
        root: &Path,
        descriptor_filename: &str,
    ) -> Result<Graph> {
        let mut paths: Vec<PathBuf> = Vec::new();
        fs.walk(root, &mut |path, is_dir| {
            if !is_dir && path.file_name().map(|n| n == descriptor_filename).unwrap_or(false) {
                paths.push(path.to_path_buf());
            }
            WalkAction::Continue
        })
        .map_err(|source| error::Error::Walk { source })?;
        paths.sort();

        let mut seen_names: HashMap<String, PathBuf> = HashMap::new();
        let mut containers = BTreeMap::new();
        for path in paths {
            let name = container_name(&path)?;
            if let Some(existing) = seen_names.get(&name) {
                return error::DuplicateNameSnafu {
                    name,
                    first: existing.clone(),
                    second: path,
                }
                .fail();
            }
            seen_names.insert(name.clone(), path.clone());

            let descriptor = crate::descriptor::load(fs, &path)
                .map_err(|source| error::Error::Descriptor { source })?;
            let dependencies = stage_dependencies(&descriptor);
            containers.insert(
                name.clone(),
                Container {
                    name,
                    descriptor_path: path,
                    descriptor,
                    dependencies,
                },
            );
        }

        Ok(Graph { containers })
    }

    /// Produce the layered topological order. Each layer is alphabetically sorted; every
    /// in-set dependency edge points from a later layer back to an earlier one.
    pub(crate) fn layers(&self) -> Result<Vec<Vec<String>>> {
        let names: BTreeSet<&str> = self.containers.keys().map(String::as_str).collect();

        // in-set dependency edges only; external base images never participate.
        let mut remaining_in_edges: HashMap<&str, HashSet<&str>> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, container) in &self.containers {
            let in_set: HashSet<&str> = container
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|d| names.contains(d))
                .collect();
            for dep in &in_set {
                dependents.entry(dep).or_default().push(name.as_str());
            }
            remaining_in_edges.insert(name.as_str(), in_set);
        }

        let mut unprocessed: BTreeSet<&str> = names.clone();
        let mut layers = Vec::new();

        while !unprocessed.is_empty() {
            let mut ready: Vec<&str> = unprocessed
                .iter()
                .copied()
                .filter(|n| remaining_in_edges[n].is_empty())
                .collect();

            if ready.is_empty() {
                return Err(error::Error::CircularDependency {
                    chain: find_cycle(&unprocessed, &self.containers),
                });
            }

            ready.sort_unstable();
            for n in &ready {
                unprocessed.remove(n);
                if let Some(deps) = dependents.get(n) {
                    for dependent in deps {
                        remaining_in_edges.get_mut(dependent).unwrap().remove(n);
                    }
                }
            }
            layers.push(ready.into_iter().map(str::to_string).collect());
        }

        Ok(layers)
    }
}

/// Recovers a cycle among `unprocessed` nodes via DFS with parent pointers: the cycle is the
/// path from the first revisited node back to itself.
fn find_cycle(unprocessed: &BTreeSet<&str>, containers: &BTreeMap<String, Container>) -> Vec<String> {
    let start = *unprocessed.iter().next().expect("non-empty by caller");
    let mut visiting: Vec<&str> = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut node = start;

    loop {
        if let Some(pos) = visiting.iter().position(|n| *n == node) {
            let mut chain: Vec<String> = visiting[pos..].iter().map(|s| s.to_string()).collect();
            chain.push(node.to_string());
            return chain;
        }
        visiting.push(node);
        visited.insert(node);

        let next = containers[node]
            .dependencies
            .iter()
            .map(String::as_str)
            .find(|d| unprocessed.contains(d));

        match next {
            Some(n) => node = n,
            None => {
                // Dead end without revisiting — fall back to any other unprocessed node so the
                // walk can find a cycle elsewhere in a graph with multiple disjoint cycles.
                node = *unprocessed
                    .iter()
                    .find(|n| !visited.contains(*n))
                    .unwrap_or(&start);
            }
        }
    }
}

fn stage_dependencies(descriptor: &Descriptor) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut deps = Vec::new();
    for stage in &descriptor.stages {
        if let ImageBase::BaseImage(name) = &stage.environment.base {
            if seen.insert(name.clone()) {
                deps.push(name.clone());
            }
        }
    }
    deps
}

fn container_name(path: &Path) -> Result<String> {
    path.parent()
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| error::Error::Invalid {
            path: path.to_path_buf(),
            message: "descriptor path has no parent directory name".to_string(),
        })
}

pub(crate) mod error {
    use std::path::PathBuf;

    use snafu::Snafu;

    pub(crate) type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to walk descriptor tree: {source}"))]
        Walk { source: crate::fs::error::Error },

        #[snafu(display("{source}"))]
        Descriptor {
            source: crate::descriptor::error::Error,
        },

        #[snafu(display("Invalid container at '{}': {message}", path.display()))]
        Invalid { path: PathBuf, message: String },

        #[snafu(display(
            "Container name '{name}' is ambiguous: defined at both '{}' and '{}'",
            first.display(),
            second.display()
        ))]
        DuplicateName {
            name: String,
            first: PathBuf,
            second: PathBuf,
        },

        #[snafu(display("Circular dependency: {}", chain.join(" -> ")))]
        CircularDependency { chain: Vec<String> },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor::{Environment, Package, Stage};
    use crate::fs::MemFilesystem;

    fn container(name: &str, deps: &[&str]) -> Container {
        let stages = deps
            .iter()
            .enumerate()
            .map(|(i, dep)| Stage {
                name: format!("stage{i}"),
                environment: Environment {
                    base: ImageBase::BaseImage(dep.to_string()),
                    packages: vec![],
                    rootfs_packages: vec![],
                    args: Default::default(),
                    environment: Default::default(),
                    workdir: None,
                    user: None,
                    entrypoint: None,
                    cmd: None,
                    expose: vec![],
                    volume: None,
                    stopsignal: None,
                },
                pipeline: vec![],
                is_final: i == deps.len().saturating_sub(1),
            })
            .collect::<Vec<_>>();

        let descriptor = Descriptor {
            package: Package {
                name: name.to_string(),
                labels: Default::default(),
            },
            vars: Default::default(),
            stages: if stages.is_empty() {
                vec![Stage {
                    name: "build".to_string(),
                    environment: Environment {
                        base: ImageBase::ExternalImage("scratch".to_string()),
                        packages: vec![],
                        rootfs_packages: vec![],
                        args: Default::default(),
                        environment: Default::default(),
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
                }]
            } else {
                stages
            },
        };

        Container {
            name: name.to_string(),
            descriptor_path: PathBuf::from(format!("{name}/dfo.yaml")),
            descriptor,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn graph_of(containers: Vec<Container>) -> Graph {
        Graph {
            containers: containers.into_iter().map(|c| (c.name.clone(), c)).collect(),
        }
    }

    #[test]
    fn linear_chain_produces_three_layers() {
        let g = graph_of(vec![
            container("a", &[]),
            container("b", &["a"]),
            container("c", &["b"]),
        ]);
        let layers = g.layers().unwrap();
        assert_eq!(
            layers,
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
    }

    #[test]
    fn diamond_dependency_layers_correctly() {
        let g = graph_of(vec![
            container("base", &[]),
            container("a", &["base"]),
            container("b", &["base"]),
            container("top", &["a", "b"]),
        ]);
        let layers = g.layers().unwrap();
        assert_eq!(
            layers,
            vec![
                vec!["base".to_string()],
                vec!["a".to_string(), "b".to_string()],
                vec!["top".to_string()],
            ]
        );
    }

    #[test]
    fn self_cycle_is_reported_with_chain_including_node_twice() {
        let g = graph_of(vec![container("x", &["x"])]);
        let err = g.layers().unwrap_err();
        match err {
            error::Error::CircularDependency { chain } => {
                assert_eq!(chain.iter().filter(|n| *n == "x").count(), 2);
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn external_base_image_contributes_no_dependency() {
        let g = graph_of(vec![container("y", &[])]);
        assert!(g.containers["y"].dependencies.is_empty());
    }

    #[test]
    fn random_acyclic_tree_covers_every_node_exactly_once() {
        // chain-of-fan-outs: each node depends on the previous layer's single "trunk" node.
        let mut containers = vec![container("root", &[])];
        for i in 0..8 {
            containers.push(container(&format!("n{i}"), &["root"]));
        }
        let g = graph_of(containers);
        let layers = g.layers().unwrap();
        let total: usize = layers.iter().map(Vec::len).sum();
        assert_eq!(total, 9);
        let mut all_names: Vec<&String> = layers.iter().flatten().collect();
        all_names.sort();
        all_names.dedup();
        assert_eq!(all_names.len(), 9);
    }

    #[test]
    fn discover_rejects_duplicate_basenames() {
        let fs = MemFilesystem::new();
        fs.write_file(
            Path::new("/root/a/dfo.yaml"),
            b"package:\n  name: a\nstages:\n  - name: build\n    environment:\n      external-image: scratch\n",
        )
        .unwrap();
        fs.write_file(
            Path::new("/root/nested/a/dfo.yaml"),
            b"package:\n  name: a\nstages:\n  - name: build\n    environment:\n      external-image: scratch\n",
        )
        .unwrap();

        let err = Graph::discover(&fs, Path::new("/root"), "dfo.yaml").unwrap_err();
        assert!(matches!(err, error::Error::DuplicateName { .. }));
    }
}
