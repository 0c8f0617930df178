//! Small constants and helpers shared between the `dfo` core crate and the
//! `oci-cli-wrapper` tool, so the two don't drift on file names or reference
//! parsing.

use anyhow::{anyhow, Result};

/// Name of the persisted build-cache manifest, written at the orchestrator's
/// output-directory root.
pub const BUILD_CACHE_FILENAME: &str = ".dfo-build-cache.json";

/// Name of a per-container sentinel file that causes the orchestrator to skip
/// building that container.
pub const IGNORE_SENTINEL: &str = "IGNORE";

/// Prefix emitted at the top of every generated Containerfile, followed by a
/// single JSON object.
pub const BOM_HEADER_PREFIX: &str = "# BOM: ";

/// Default bound on per-layer build concurrency.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default package-index URL template, with `{version}` and `{repo}` placeholders.
pub const DEFAULT_PACKAGE_INDEX_URL_TEMPLATE: &str =
    "https://dl-cdn.alpinelinux.org/alpine/v{version}/{repo}/index.json";

/// Default release-index URL, used to discover the latest stable distribution version.
pub const DEFAULT_RELEASE_INDEX_URL: &str = "https://dl-cdn.alpinelinux.org/alpine/releases.json";

/// Default repository tiers consulted in order (later tiers override earlier ones).
pub const DEFAULT_REPOS: &[&str] = &["main", "community"];

/// A parsed `registry/repository:tag` (or `@digest`) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference string. A leading `host[:port]/` component (one
    /// containing a `.`, `:`, or equal to `localhost`) is treated as the
    /// registry; everything else is the repository path.
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(anyhow!("empty image reference"));
        }

        let (without_digest, digest) = match reference.split_once('@') {
            Some((left, digest)) => (left, Some(digest.to_string())),
            None => (reference, None),
        };

        let mut parts: Vec<&str> = without_digest.splitn(2, '/').collect();
        let (registry, rest) = if parts.len() == 2 && looks_like_registry(parts[0]) {
            (Some(parts.remove(0).to_string()), parts.remove(0))
        } else {
            (None, without_digest)
        };

        let (repository, tag) = match rest.rsplit_once(':') {
            // Guard against mistaking a port-bearing registry-less path for a tag
            // separator, e.g. `localhost:5000/foo` was already split above.
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), Some(tag.to_string())),
            _ => (rest.to_string(), None),
        };

        if repository.is_empty() {
            return Err(anyhow!("image reference '{reference}' has no repository"));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The canonical string form, used as a cache key.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        if let Some(registry) = &self.registry {
            out.push_str(registry);
            out.push('/');
        }
        out.push_str(&self.repository);
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        } else if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        out
    }
}

fn looks_like_registry(candidate: &str) -> bool {
    candidate == "localhost" || candidate.contains('.') || candidate.contains(':')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_bare_name_with_tag() {
        let r = ImageReference::parse("alpine:3.19").unwrap();
        assert_eq!(r.registry, None);
        assert_eq!(r.repository, "alpine");
        assert_eq!(r.tag.as_deref(), Some("3.19"));
    }

    #[test]
    fn parses_registry_qualified_name() {
        let r = ImageReference::parse("registry.example.com/team/app:v1").unwrap();
        assert_eq!(r.registry.as_deref(), Some("registry.example.com"));
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn parses_localhost_with_port() {
        let r = ImageReference::parse("localhost:5000/app:v1").unwrap();
        assert_eq!(r.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn parses_digest_reference() {
        let r = ImageReference::parse("app@sha256:abc123").unwrap();
        assert_eq!(r.repository, "app");
        assert_eq!(r.digest.as_deref(), Some("sha256:abc123"));
        assert_eq!(r.tag, None);
    }

    #[test]
    fn rejects_empty() {
        assert!(ImageReference::parse("").is_err());
    }
}
