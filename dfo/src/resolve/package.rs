//! Package index client and resolver: pins package names to versions drawn from an upstream
//! distribution index, and flattens transitive dependencies.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use serde::Deserialize;
use snafu::{ensure, ResultExt};

pub(crate) use error::Result;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PackageMetadata {
    pub(crate) version: String,
    #[serde(default)]
    pub(crate) depends: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct IndexDocument {
    packages: BTreeMap<String, PackageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReleaseIndexDocument {
    releases: Vec<ReleaseEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReleaseEntry {
    version: String,
}

/// Fetches and memoises, per (distribution version, repository), the package → metadata
/// mapping published at `url_template` (with `{version}` and `{repo}` placeholders).
pub(crate) struct PackageIndexClient {
    http: reqwest::blocking::Client,
    url_template: String,
    release_index_url: String,
    cache: RwLock<HashMap<(String, String), BTreeMap<String, PackageMetadata>>>,
    latest_version: RwLock<Option<String>>,
}

impl PackageIndexClient {
    pub(crate) fn new(url_template: String, release_index_url: String) -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
            url_template,
            release_index_url,
            cache: RwLock::new(HashMap::new()),
            latest_version: RwLock::new(None),
        }
    }

    pub(crate) fn fetch(
        &self,
        version: &str,
        repo: &str,
    ) -> Result<BTreeMap<String, PackageMetadata>> {
        let key = (version.to_string(), repo.to_string());
        if let Some(hit) = self.cache.read().unwrap().get(&key).cloned() {
            return Ok(hit);
        }

        let url = self
            .url_template
            .replace("{version}", version)
            .replace("{repo}", repo);
        let body = self
            .http
            .get(&url)
            .header(reqwest::header::USER_AGENT, user_agent())
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.text())
            .context(error::FetchSnafu { url: url.clone() })?;
        let doc: IndexDocument =
            serde_json::from_str(&body).context(error::ParseSnafu { url })?;

        self.cache.write().unwrap().insert(key, doc.packages.clone());
        Ok(doc.packages)
    }

    /// The major.minor form of the first entry in the release index, cached for the process
    /// lifetime.
    pub(crate) fn latest_stable_version(&self) -> Result<String> {
        if let Some(v) = self.latest_version.read().unwrap().clone() {
            return Ok(v);
        }

        let body = self
            .http
            .get(&self.release_index_url)
            .header(reqwest::header::USER_AGENT, user_agent())
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.text())
            .context(error::FetchSnafu {
                url: self.release_index_url.clone(),
            })?;
        let doc: ReleaseIndexDocument = serde_json::from_str(&body).context(error::ParseSnafu {
            url: self.release_index_url.clone(),
        })?;
        let first = doc
            .releases
            .first()
            .context(error::NoReleasesSnafu)?;
        let version = major_minor(&first.version);

        *self.latest_version.write().unwrap() = Some(version.clone());
        Ok(version)
    }
}

fn user_agent() -> String {
    format!("dfo/{}", env!("CARGO_PKG_VERSION"))
}

fn major_minor(version: &str) -> String {
    let mut parts = version.splitn(3, '.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => format!("{major}.{minor}"),
        _ => version.to_string(),
    }
}

/// Combines one or more repository tiers (later overriding earlier) and flattens transitive
/// dependencies for a requested package set.
pub(crate) struct PackageResolver<'a> {
    client: &'a PackageIndexClient,
    repos: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ResolvedPackage {
    pub(crate) name: String,
    pub(crate) version: String,
}

impl<'a> PackageResolver<'a> {
    pub(crate) fn new(client: &'a PackageIndexClient, repos: Vec<String>) -> Self {
        Self { client, repos }
    }

    fn combined_index(&self, version: &str) -> Result<BTreeMap<String, PackageMetadata>> {
        let mut combined = BTreeMap::new();
        for repo in &self.repos {
            let tier = self.client.fetch(version, repo)?;
            combined.extend(tier);
        }
        Ok(combined)
    }

    /// Resolve `specs` (bare package names — a `=` pin is rejected) against the combined
    /// index for `version`, returning the transitive closure sorted by name.
    pub(crate) fn resolve(
        &self,
        specs: &[String],
        version: &str,
    ) -> Result<BTreeSet<ResolvedPackage>> {
        for spec in specs {
            ensure!(!spec.contains('='), error::VersionPinForbiddenSnafu { spec: spec.clone() });
        }

        let index = self.combined_index(version)?;
        flatten(specs, &index)
    }
}

/// Walks `specs` through `index`, following `depends` edges, returning the transitive
/// closure sorted by name. Split out from [`PackageResolver::resolve`] so the flattening
/// logic can be exercised against a hand-built index without a live fetch.
fn flatten(
    specs: &[String],
    index: &BTreeMap<String, PackageMetadata>,
) -> Result<BTreeSet<ResolvedPackage>> {
    let mut resolved = BTreeSet::new();
    let mut frontier: Vec<String> = specs.to_vec();
    let mut visited = BTreeSet::new();

    while let Some(name) = frontier.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }
        let meta = index
            .get(&name)
            .context(error::NotFoundSnafu { name: name.clone() })?;
        resolved.insert(ResolvedPackage {
            name: name.clone(),
            version: meta.version.clone(),
        });
        for dep in &meta.depends {
            frontier.push(dep.clone());
        }
    }

    Ok(resolved)
}

pub(crate) mod error {
    use snafu::Snafu;

    pub(crate) type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to fetch index at '{url}': {source}"))]
        Fetch { url: String, source: reqwest::Error },

        #[snafu(display("Failed to parse index at '{url}': {source}"))]
        Parse {
            url: String,
            source: serde_json::Error,
        },

        #[snafu(display("Release index contained no releases"))]
        NoReleases,

        #[snafu(display("Package spec '{spec}' carries a version pin, which is forbidden"))]
        VersionPinForbidden { spec: String },

        #[snafu(display("Package '{name}' not found in index"))]
        NotFound { name: String },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn client_with(url: &str, release_url: &str) -> PackageIndexClient {
        PackageIndexClient::new(url.to_string(), release_url.to_string())
    }

    #[test]
    fn major_minor_truncates_patch_version() {
        assert_eq!(major_minor("3.19.1"), "3.19");
        assert_eq!(major_minor("3.19"), "3.19");
    }

    #[test]
    fn resolve_rejects_version_pinned_spec() {
        let client = client_with("http://example.invalid/{repo}/{version}", "http://example.invalid/releases");
        let resolver = PackageResolver::new(&client, vec!["main".to_string()]);
        let err = resolver
            .resolve(&["git=2.43.0-r0".to_string()], "3.19")
            .unwrap_err();
        assert!(matches!(err, error::Error::VersionPinForbidden { .. }));
    }

    fn meta(version: &str, depends: &[&str]) -> PackageMetadata {
        PackageMetadata {
            version: version.to_string(),
            depends: depends.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn flatten_pins_transitive_dependencies_from_a_seeded_index() {
        let mut index = BTreeMap::new();
        index.insert("git".to_string(), meta("2.43.0-r0", &["pcre2", "zlib"]));
        index.insert("pcre2".to_string(), meta("10.42-r1", &[]));
        index.insert("zlib".to_string(), meta("1.3-r2", &[]));

        let resolved = flatten(&["git".to_string()], &index).unwrap();
        let names: Vec<&str> = resolved.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["git", "pcre2", "zlib"]);
        assert_eq!(
            resolved.iter().find(|p| p.name == "git").unwrap().version,
            "2.43.0-r0"
        );
    }

    #[test]
    fn flatten_deduplicates_a_diamond_dependency() {
        let mut index = BTreeMap::new();
        index.insert("app".to_string(), meta("1.0", &["libfoo", "libbar"]));
        index.insert("libfoo".to_string(), meta("2.0", &["libshared"]));
        index.insert("libbar".to_string(), meta("3.0", &["libshared"]));
        index.insert("libshared".to_string(), meta("4.0", &[]));

        let resolved = flatten(&["app".to_string()], &index).unwrap();
        assert_eq!(resolved.iter().filter(|p| p.name == "libshared").count(), 1);
    }

    #[test]
    fn flatten_reports_missing_dependency_by_name() {
        let mut index = BTreeMap::new();
        index.insert("app".to_string(), meta("1.0", &["missing"]));

        let err = flatten(&["app".to_string()], &index).unwrap_err();
        assert!(matches!(err, error::Error::NotFound { name } if name == "missing"));
    }
}
