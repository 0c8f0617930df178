//! Resolves a mutable image reference (registry/name:tag) to an immutable `name@sha256:...`
//! reference, optionally checking a local daemon first.

use std::collections::HashMap;
use std::sync::RwLock;

use dfo_config::ImageReference;
use oci_cli_wrapper::ImageTool;

pub(crate) use error::Result;

#[derive(Debug, Clone)]
pub(crate) struct ResolvedImage {
    pub(crate) registry: Option<String>,
    pub(crate) repository: String,
    pub(crate) digest: String,
}

impl ResolvedImage {
    pub(crate) fn full_ref(&self) -> String {
        let name = match &self.registry {
            Some(registry) => format!("{registry}/{}", self.repository),
            None => self.repository.clone(),
        };
        format!("{name}@{}", self.digest)
    }
}

pub(crate) struct ImageResolver {
    tool: ImageTool,
    default_registry: Option<String>,
    check_local_daemon_first: bool,
    cache: RwLock<HashMap<String, ResolvedImage>>,
}

impl ImageResolver {
    pub(crate) fn new(
        tool: ImageTool,
        default_registry: Option<String>,
        check_local_daemon_first: bool,
    ) -> Self {
        Self {
            tool,
            default_registry,
            check_local_daemon_first,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve `name` to a pinned digest reference, consulting the in-process cache first.
    pub(crate) fn resolve(&self, name: &str) -> Result<ResolvedImage> {
        let qualified = self.qualify(name);

        if let Some(hit) = self.cache.read().unwrap().get(&qualified).cloned() {
            return Ok(hit);
        }

        let resolved = self.resolve_uncached(&qualified)?;
        self.cache
            .write()
            .unwrap()
            .insert(qualified, resolved.clone());
        Ok(resolved)
    }

    fn qualify(&self, name: &str) -> String {
        if name.contains('/') {
            return name.to_string();
        }
        match &self.default_registry {
            Some(registry) => format!("{registry}/{name}"),
            None => name.to_string(),
        }
    }

    fn resolve_uncached(&self, qualified: &str) -> Result<ResolvedImage> {
        let parsed = ImageReference::parse(qualified).map_err(|_| error::Error::ParseFailure {
            reference: qualified.to_string(),
        })?;

        // The daemon path is best-effort: failures there are swallowed and we fall back to
        // the registry path without surfacing anything to the caller (spec'd behaviour).
        if self.check_local_daemon_first {
            if let Ok(digest) = self.tool.get_digest(qualified) {
                return Ok(ResolvedImage {
                    registry: parsed.registry.clone(),
                    repository: parsed.repository.clone(),
                    digest,
                });
            }
        }

        let digest = self
            .tool
            .get_digest(qualified)
            .map_err(|source| error::Error::RegistryUnavailable {
                reference: qualified.to_string(),
                source,
            })?;

        Ok(ResolvedImage {
            registry: parsed.registry,
            repository: parsed.repository,
            digest,
        })
    }
}

pub(crate) mod error {
    use snafu::Snafu;

    pub(crate) type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to parse image reference '{reference}'"))]
        ParseFailure { reference: String },

        #[snafu(display("Registry unavailable for '{reference}': {source}"))]
        RegistryUnavailable {
            reference: String,
            source: oci_cli_wrapper::error::Error,
        },

        #[snafu(display("Image '{reference}' not found"))]
        NotFound { reference: String },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_ref_includes_registry_when_present() {
        let img = ResolvedImage {
            registry: Some("registry.example.com".to_string()),
            repository: "library/alpine".to_string(),
            digest: "sha256:aaa".to_string(),
        };
        assert_eq!(
            img.full_ref(),
            "registry.example.com/library/alpine@sha256:aaa"
        );
    }

    #[test]
    fn full_ref_omits_registry_when_absent() {
        let img = ResolvedImage {
            registry: None,
            repository: "alpine".to_string(),
            digest: "sha256:aaa".to_string(),
        };
        assert_eq!(img.full_ref(), "alpine@sha256:aaa");
    }
}
