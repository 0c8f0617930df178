//! The closed catalogue of built-in pipelines invocable via a `uses:` step.
//!
//! Each entry is a schema-validated, tagged variant: the raw `with: {string: any}` map is
//! discharged into one of these variants at parse time (here), so nothing downstream of
//! [`parse`] ever looks at an untyped parameter map again. This is deliberately not a plugin
//! host — new pipelines are added by extending this enum and its parser, not by registering
//! handlers at runtime.

use serde::Deserialize;
use serde_json::{Map, Value};
use snafu::ensure;
use std::path::Path;

use super::error::{self, Result};
use super::{CopyStep, FetchStep, RunStep};

#[derive(Debug, Clone)]
pub(crate) enum BuiltinPipeline {
    CreateUser {
        username: String,
        uid: i64,
        gid: i64,
    },
    SetOwnership {
        user: String,
        group: String,
        path: String,
    },
    DownloadVerifyExtract {
        url: String,
        destination: String,
        checksum: Option<String>,
        checksum_url: Option<String>,
        checksum_pattern: Option<String>,
        extract_dir: Option<String>,
        strip_components: Option<i64>,
    },
    MakeExecutable {
        path: String,
    },
    Clone {
        repo: String,
        workdir: Option<String>,
        tag: Option<String>,
        commit: Option<String>,
    },
    CloneAndBuildGo {
        repo: String,
        package: Option<String>,
        output: Option<String>,
        tag: Option<String>,
        go_tags: Option<String>,
        cgo: bool,
        ignore: Vec<String>,
        patches: Vec<String>,
    },
    Build {
        kind: BuildKind,
        repo: Option<String>,
        workdir: Option<String>,
        output: Option<String>,
        tag: Option<String>,
        patches: Vec<String>,
    },
    SetupUsersGroups {
        rootfs: Option<String>,
        groups: Vec<GroupSpec>,
        users: Vec<UserSpec>,
    },
    CreateDirectories {
        directories: Vec<DirectorySpec>,
    },
    CopyFiles {
        files: Vec<FileSpec>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuildKind {
    GoStatic,
    GoOnly,
    Rust,
    Make,
    Autoconf,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GroupSpec {
    pub(crate) name: String,
    pub(crate) gid: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UserSpec {
    pub(crate) name: String,
    pub(crate) uid: i64,
    pub(crate) gid: i64,
    #[serde(default)]
    pub(crate) home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DirectorySpec {
    pub(crate) path: String,
    #[serde(default)]
    pub(crate) owner: Option<String>,
    #[serde(default)]
    pub(crate) mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FileSpec {
    pub(crate) from: String,
    pub(crate) to: String,
    #[serde(default)]
    pub(crate) chown: Option<String>,
}

fn require_str(with: &Map<String, Value>, key: &str, name: &str, path: &Path) -> Result<String> {
    with.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid(name, path, format!("missing required string parameter '{key}'")))
}

fn require_int(with: &Map<String, Value>, key: &str, name: &str, path: &Path) -> Result<i64> {
    with.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid(name, path, format!("missing required integer parameter '{key}'")))
}

fn opt_str(with: &Map<String, Value>, key: &str) -> Option<String> {
    with.get(key).and_then(Value::as_str).map(str::to_string)
}

fn opt_int(with: &Map<String, Value>, key: &str) -> Option<i64> {
    with.get(key).and_then(Value::as_i64)
}

fn opt_bool(with: &Map<String, Value>, key: &str) -> bool {
    with.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn opt_str_array(with: &Map<String, Value>, key: &str) -> Vec<String> {
    with.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn opt_object_array<T: for<'de> Deserialize<'de>>(
    with: &Map<String, Value>,
    key: &str,
    name: &str,
    path: &Path,
) -> Result<Vec<T>> {
    match with.get(key) {
        None => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            error::PipelineParamsInvalidSnafu {
                path: path.to_path_buf(),
                name: name.to_string(),
                message: format!("parameter '{key}' does not match expected shape: {e}"),
            }
            .build()
        }),
    }
}

fn invalid(name: &str, path: &Path, message: impl Into<String>) -> error::Error {
    error::PipelineParamsInvalidSnafu {
        path: path.to_path_buf(),
        name: name.to_string(),
        message: message.into(),
    }
    .build()
}

pub(crate) fn parse(name: &str, with: &Map<String, Value>, path: &Path) -> Result<BuiltinPipeline> {
    match name {
        "create-user" => Ok(BuiltinPipeline::CreateUser {
            username: require_str(with, "username", name, path)?,
            uid: require_int(with, "uid", name, path)?,
            gid: require_int(with, "gid", name, path)?,
        }),

        "set-ownership" => Ok(BuiltinPipeline::SetOwnership {
            user: require_str(with, "user", name, path)?,
            group: require_str(with, "group", name, path)?,
            path: require_str(with, "path", name, path)?,
        }),

        "download-verify-extract" => {
            let checksum = opt_str(with, "checksum");
            let checksum_url = opt_str(with, "checksum-url");
            ensure!(
                checksum.is_some() ^ checksum_url.is_some(),
                error::PipelineParamsInvalidSnafu {
                    path: path.to_path_buf(),
                    name: name.to_string(),
                    message: "exactly one of 'checksum' or 'checksum-url' is required".to_string(),
                }
            );
            Ok(BuiltinPipeline::DownloadVerifyExtract {
                url: require_str(with, "url", name, path)?,
                destination: require_str(with, "destination", name, path)?,
                checksum,
                checksum_url,
                checksum_pattern: opt_str(with, "checksum-pattern"),
                extract_dir: opt_str(with, "extract-dir"),
                strip_components: opt_int(with, "strip-components"),
            })
        }

        "make-executable" => Ok(BuiltinPipeline::MakeExecutable {
            path: require_str(with, "path", name, path)?,
        }),

        "clone" => {
            let tag = opt_str(with, "tag");
            let commit = opt_str(with, "commit");
            ensure!(
                !(tag.is_some() && commit.is_some()),
                error::PipelineParamsInvalidSnafu {
                    path: path.to_path_buf(),
                    name: name.to_string(),
                    message: "at most one of 'tag' or 'commit' may be set".to_string(),
                }
            );
            Ok(BuiltinPipeline::Clone {
                repo: require_str(with, "repo", name, path)?,
                workdir: opt_str(with, "workdir"),
                tag,
                commit,
            })
        }

        "clone-and-build-go" => Ok(BuiltinPipeline::CloneAndBuildGo {
            repo: require_str(with, "repo", name, path)?,
            package: opt_str(with, "package"),
            output: opt_str(with, "output"),
            tag: opt_str(with, "tag"),
            go_tags: opt_str(with, "go-tags"),
            cgo: opt_bool(with, "cgo"),
            ignore: opt_str_array(with, "ignore"),
            patches: opt_str_array(with, "patches"),
        }),

        "build-go-static" | "build-go-only" | "clone-and-build-rust" | "clone-and-build-make"
        | "clone-and-build-autoconf" => {
            let repo = opt_str(with, "repo");
            let workdir = opt_str(with, "workdir");
            ensure!(
                repo.is_some() ^ workdir.is_some(),
                error::PipelineParamsInvalidSnafu {
                    path: path.to_path_buf(),
                    name: name.to_string(),
                    message: "exactly one of 'repo' or 'workdir' is required".to_string(),
                }
            );
            let kind = match name {
                "build-go-static" => BuildKind::GoStatic,
                "build-go-only" => BuildKind::GoOnly,
                "clone-and-build-rust" => BuildKind::Rust,
                "clone-and-build-make" => BuildKind::Make,
                "clone-and-build-autoconf" => BuildKind::Autoconf,
                _ => unreachable!(),
            };
            Ok(BuiltinPipeline::Build {
                kind,
                repo,
                workdir,
                output: opt_str(with, "output"),
                tag: opt_str(with, "tag"),
                patches: opt_str_array(with, "patches"),
            })
        }

        "setup-users-groups" => {
            let groups = opt_object_array::<GroupSpec>(with, "groups", name, path)?;
            let users = opt_object_array::<UserSpec>(with, "users", name, path)?;
            ensure!(
                !(groups.is_empty() && users.is_empty()),
                error::PipelineParamsInvalidSnafu {
                    path: path.to_path_buf(),
                    name: name.to_string(),
                    message: "at least one of 'groups' or 'users' is required".to_string(),
                }
            );
            Ok(BuiltinPipeline::SetupUsersGroups {
                rootfs: opt_str(with, "rootfs"),
                groups,
                users,
            })
        }

        "create-directories" => {
            let directories = opt_object_array::<DirectorySpec>(with, "directories", name, path)?;
            ensure!(
                !directories.is_empty(),
                error::PipelineParamsInvalidSnafu {
                    path: path.to_path_buf(),
                    name: name.to_string(),
                    message: "'directories' must be non-empty".to_string(),
                }
            );
            Ok(BuiltinPipeline::CreateDirectories { directories })
        }

        "copy-files" => {
            let files = opt_object_array::<FileSpec>(with, "files", name, path)?;
            ensure!(
                !files.is_empty(),
                error::PipelineParamsInvalidSnafu {
                    path: path.to_path_buf(),
                    name: name.to_string(),
                    message: "'files' must be non-empty".to_string(),
                }
            );
            Ok(BuiltinPipeline::CopyFiles { files })
        }

        _ => error::UnknownPipelineSnafu {
            path: path.to_path_buf(),
            name: name.to_string(),
        }
        .fail(),
    }
}

/// The primitive operations a pipeline step can lower into; built-ins expand into a sequence
/// of these using the same primitives the `run`/`fetch`/`copy` steps expose directly.
pub(crate) enum PrimitiveOp {
    Run(RunStep),
    Fetch(FetchStep),
    Copy(CopyStep),
}

impl BuiltinPipeline {
    pub(crate) fn expand(&self) -> Vec<PrimitiveOp> {
        match self {
            BuiltinPipeline::CreateUser { username, uid, gid } => vec![PrimitiveOp::Run(RunStep {
                shell: format!(
                    "addgroup -g {gid} {username}; adduser -D -H -u {uid} -G {username} {username}"
                ),
                build_deps: Vec::new(),
            })],

            BuiltinPipeline::SetOwnership { user, group, path } => {
                vec![PrimitiveOp::Run(RunStep {
                    shell: format!("chown -R {user}:{group} {path}"),
                    build_deps: Vec::new(),
                })]
            }

            BuiltinPipeline::MakeExecutable { path } => vec![PrimitiveOp::Run(RunStep {
                shell: format!("chmod +x {path}"),
                build_deps: Vec::new(),
            })],

            BuiltinPipeline::DownloadVerifyExtract {
                url,
                destination,
                checksum,
                checksum_url,
                checksum_pattern,
                extract_dir,
                strip_components,
            } => {
                let mut lines = vec![format!("curl -fsSL -o {destination} \"{url}\"")];
                if let Some(checksum) = checksum {
                    lines.push(format!(
                        "echo \"{checksum}  {destination}\" | sha256sum -c -"
                    ));
                } else if let Some(checksum_url) = checksum_url {
                    let pattern = checksum_pattern
                        .clone()
                        .unwrap_or_else(|| "^[0-9a-f]{64}".to_string());
                    lines.push(format!(
                        "curl -fsSL \"{checksum_url}\" | grep -Eo '{pattern}' | head -n1 > /tmp/dfo-checksum"
                    ));
                    lines.push(format!(
                        "echo \"$(cat /tmp/dfo-checksum)  {destination}\" | sha256sum -c -"
                    ));
                }
                let dir = extract_dir.clone().unwrap_or_else(|| "/".to_string());
                let strip = strip_components.unwrap_or(0);
                lines.push(format!(
                    "mkdir -p {dir}; tar -xf {destination} -C {dir} --strip-components={strip}"
                ));
                vec![PrimitiveOp::Run(RunStep {
                    shell: lines.join("; \\\n"),
                    build_deps: Vec::new(),
                })]
            }

            BuiltinPipeline::Clone {
                repo,
                workdir,
                tag,
                commit,
            } => {
                let dir = workdir.clone().unwrap_or_else(|| ".".to_string());
                let mut shell = format!("git clone {repo} {dir}");
                if let Some(tag) = tag {
                    shell = format!("{shell}; cd {dir} && git checkout {tag}");
                } else if let Some(commit) = commit {
                    shell = format!("{shell}; cd {dir} && git checkout {commit}");
                }
                vec![PrimitiveOp::Run(RunStep {
                    shell,
                    build_deps: Vec::new(),
                })]
            }

            BuiltinPipeline::CloneAndBuildGo {
                repo,
                package,
                output,
                tag,
                go_tags,
                cgo,
                ignore,
                patches,
            } => {
                let dir = "/tmp/src";
                let mut lines = vec![format!("git clone {repo} {dir}")];
                if let Some(tag) = tag {
                    lines.push(format!("cd {dir} && git checkout {tag}"));
                }
                for path in ignore {
                    lines.push(format!("rm -rf {dir}/{path}"));
                }
                for patch in patches {
                    lines.push(format!("cd {dir} && git apply {patch}"));
                }
                let pkg = package.clone().unwrap_or_else(|| ".".to_string());
                let out = output.clone().unwrap_or_else(|| "/usr/local/bin/app".to_string());
                let cgo_flag = if *cgo { "1" } else { "0" };
                let tags = go_tags
                    .clone()
                    .map(|t| format!(" -tags {t}"))
                    .unwrap_or_default();
                lines.push(format!(
                    "cd {dir} && CGO_ENABLED={cgo_flag} go build{tags} -o {out} {pkg}"
                ));
                vec![PrimitiveOp::Run(RunStep {
                    shell: lines.join("; \\\n"),
                    build_deps: Vec::new(),
                })]
            }

            BuiltinPipeline::Build {
                kind,
                repo,
                workdir,
                output,
                tag,
                patches,
            } => {
                let dir = workdir.clone().unwrap_or_else(|| "/tmp/src".to_string());
                let mut lines = Vec::new();
                if let Some(repo) = repo {
                    lines.push(format!("git clone {repo} {dir}"));
                    if let Some(tag) = tag {
                        lines.push(format!("cd {dir} && git checkout {tag}"));
                    }
                }
                for patch in patches {
                    lines.push(format!("cd {dir} && git apply {patch}"));
                }
                let out = output.clone().unwrap_or_else(|| "/usr/local/bin/app".to_string());
                let build_line = match kind {
                    BuildKind::GoStatic => format!(
                        "cd {dir} && CGO_ENABLED=0 go build -ldflags '-s -w' -o {out} ."
                    ),
                    BuildKind::GoOnly => format!("cd {dir} && go build -o {out} ."),
                    BuildKind::Rust => {
                        format!("cd {dir} && cargo build --release && cp target/release/* {out}")
                    }
                    BuildKind::Make => format!("cd {dir} && make && make install"),
                    BuildKind::Autoconf => format!(
                        "cd {dir} && ./configure && make && make install"
                    ),
                };
                lines.push(build_line);
                vec![PrimitiveOp::Run(RunStep {
                    shell: lines.join("; \\\n"),
                    build_deps: Vec::new(),
                })]
            }

            BuiltinPipeline::SetupUsersGroups {
                rootfs,
                groups,
                users,
            } => {
                let prefix = rootfs
                    .clone()
                    .map(|r| format!("--prefix {r} "))
                    .unwrap_or_default();
                let mut lines = Vec::new();
                for g in groups {
                    lines.push(format!("addgroup {prefix}-g {} {}", g.gid, g.name));
                }
                for u in users {
                    let home = u.home.clone().unwrap_or_else(|| format!("/home/{}", u.name));
                    lines.push(format!(
                        "adduser {prefix}-D -H -u {} -g {} -h {} {}",
                        u.uid, u.gid, home, u.name
                    ));
                }
                vec![PrimitiveOp::Run(RunStep {
                    shell: lines.join("; \\\n"),
                    build_deps: Vec::new(),
                })]
            }

            BuiltinPipeline::CreateDirectories { directories } => {
                let mut lines = Vec::new();
                for d in directories {
                    lines.push(format!("mkdir -p {}", d.path));
                    if let Some(owner) = &d.owner {
                        lines.push(format!("chown {} {}", owner, d.path));
                    }
                    if let Some(mode) = &d.mode {
                        lines.push(format!("chmod {} {}", mode, d.path));
                    }
                }
                vec![PrimitiveOp::Run(RunStep {
                    shell: lines.join("; \\\n"),
                    build_deps: Vec::new(),
                })]
            }

            BuiltinPipeline::CopyFiles { files } => files
                .iter()
                .map(|f| {
                    PrimitiveOp::Copy(CopyStep {
                        from: f.from.clone(),
                        to: f.to.clone(),
                        from_stage: None,
                        chown: f.chown.clone(),
                    })
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn with(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn create_user_requires_all_three_fields() {
        let path = Path::new("dfo.yaml");
        let err = parse("create-user", &with(json!({"username": "app"})), path).unwrap_err();
        assert!(matches!(err, error::Error::PipelineParamsInvalid { .. }));
    }

    #[test]
    fn download_verify_extract_rejects_both_checksum_forms() {
        let path = Path::new("dfo.yaml");
        let err = parse(
            "download-verify-extract",
            &with(json!({
                "url": "https://example.com/x.tar.gz",
                "destination": "/tmp/x.tar.gz",
                "checksum": "abc",
                "checksum-url": "https://example.com/x.sha256",
            })),
            path,
        )
        .unwrap_err();
        assert!(matches!(err, error::Error::PipelineParamsInvalid { .. }));
    }

    #[test]
    fn clone_rejects_tag_and_commit_together() {
        let path = Path::new("dfo.yaml");
        let err = parse(
            "clone",
            &with(json!({"repo": "https://example.com/r.git", "tag": "v1", "commit": "deadbeef"})),
            path,
        )
        .unwrap_err();
        assert!(matches!(err, error::Error::PipelineParamsInvalid { .. }));
    }

    #[test]
    fn unknown_pipeline_name_is_rejected() {
        let path = Path::new("dfo.yaml");
        let err = parse("does-not-exist", &with(json!({})), path).unwrap_err();
        assert!(matches!(err, error::Error::UnknownPipeline { .. }));
    }

    #[test]
    fn setup_users_groups_requires_at_least_one() {
        let path = Path::new("dfo.yaml");
        let err = parse("setup-users-groups", &with(json!({})), path).unwrap_err();
        assert!(matches!(err, error::Error::PipelineParamsInvalid { .. }));
    }

    #[test]
    fn clone_and_build_go_removes_ignored_paths_before_building() {
        let path = Path::new("dfo.yaml");
        let pipeline = parse(
            "clone-and-build-go",
            &with(json!({
                "repo": "https://example.com/r.git",
                "ignore": ["vendor", "testdata"],
            })),
            path,
        )
        .unwrap();

        let ops = pipeline.expand();
        let PrimitiveOp::Run(run) = ops.into_iter().next().unwrap() else {
            panic!("expected a single run step");
        };
        assert!(run.shell.contains("rm -rf /tmp/src/vendor"));
        assert!(run.shell.contains("rm -rf /tmp/src/testdata"));
        let rm_index = run.shell.find("rm -rf /tmp/src/vendor").unwrap();
        let build_index = run.shell.find("go build").unwrap();
        assert!(rm_index < build_index, "ignored paths must be removed before the build runs");
    }
}
