//! On-disk build cache keyed by the SHA-256 of a container's descriptor bytes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::ResultExt;

use crate::fs::Filesystem;

pub(crate) use error::Result;

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    pub(crate) container_name: String,
    pub(crate) input_hash: String,
    pub(crate) build_digest: String,
    pub(crate) timestamp: String,
    pub(crate) config_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Manifest {
            version: CACHE_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

pub(crate) struct BuildCache {
    path: PathBuf,
    manifest: Manifest,
}

impl BuildCache {
    /// Load `<root>/.dfo-build-cache.json`. A missing file is treated as an empty cache; a present but
    /// unreadable/malformed file also degrades to empty, logged as a warning rather than
    /// failing the run.
    pub(crate) fn load(fs: &dyn Filesystem, root: &Path) -> Self {
        let path = root.join(dfo_config::BUILD_CACHE_FILENAME);
        let manifest = if fs.exists(&path) {
            match fs.read_file(&path).map(|bytes| serde_json::from_slice::<Manifest>(&bytes)) {
                Ok(Ok(manifest)) => manifest,
                Ok(Err(e)) => {
                    log::warn!("Build cache at '{}' is malformed, starting empty: {e}", path.display());
                    Manifest::default()
                }
                Err(e) => {
                    log::warn!("Failed to read build cache at '{}', starting empty: {e}", path.display());
                    Manifest::default()
                }
            }
        } else {
            Manifest::default()
        };

        BuildCache { path, manifest }
    }

    /// Persist the manifest. Failures are logged, not returned as fatal — the run already
    /// succeeded or failed independently of whether the cache could be written back.
    pub(crate) fn save(&self, fs: &dyn Filesystem) {
        let bytes = match serde_json::to_vec_pretty(&self.manifest) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to serialize build cache: {e}");
                return;
            }
        };
        if let Err(e) = fs.write_file(&self.path, &bytes) {
            log::warn!("Failed to write build cache at '{}': {e}", self.path.display());
        }
    }

    /// Whether `container_name` needs a rebuild: true if there is no cache entry, the stored
    /// hash doesn't match the descriptor's current bytes, or the bytes can't be hashed (in
    /// which case this degrades to "rebuild" rather than trusting a stale entry).
    pub(crate) fn needs_rebuild(
        &self,
        fs: &dyn Filesystem,
        container_name: &str,
        descriptor_path: &Path,
    ) -> bool {
        let current_hash = match fs.read_file(descriptor_path) {
            Ok(bytes) => hash_bytes(&bytes),
            Err(e) => {
                log::warn!(
                    "Failed to hash descriptor at '{}' for cache lookup, forcing rebuild: {e}",
                    descriptor_path.display()
                );
                return true;
            }
        };

        match self.manifest.entries.get(container_name) {
            Some(entry) => entry.input_hash != current_hash,
            None => true,
        }
    }

    pub(crate) fn cached_digest(&self, container_name: &str) -> Option<String> {
        self.manifest
            .entries
            .get(container_name)
            .map(|e| e.build_digest.clone())
    }

    pub(crate) fn record(
        &mut self,
        fs: &dyn Filesystem,
        container_name: &str,
        descriptor_path: &Path,
        build_digest: &str,
    ) -> Result<()> {
        let bytes = fs
            .read_file(descriptor_path)
            .context(error::ReadDescriptorSnafu {
                path: descriptor_path.to_path_buf(),
            })?;
        self.manifest.entries.insert(
            container_name.to_string(),
            CacheEntry {
                container_name: container_name.to_string(),
                input_hash: hash_bytes(&bytes),
                build_digest: build_digest.to_string(),
                timestamp: Utc::now().to_rfc3339(),
                config_path: descriptor_path.display().to_string(),
            },
        );
        Ok(())
    }

    pub(crate) fn invalidate_all(&mut self) {
        self.manifest.entries.clear();
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) mod error {
    use std::path::PathBuf;

    use snafu::Snafu;

    pub(crate) type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to read descriptor at '{}' for cache record: {source}", path.display()))]
        ReadDescriptor {
            path: PathBuf,
            source: crate::fs::error::Error,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::MemFilesystem;

    #[test]
    fn missing_container_needs_rebuild() {
        let fs = MemFilesystem::new();
        fs.write_file(Path::new("/root/a/dfo.yaml"), b"contents").unwrap();
        let cache = BuildCache::load(&fs, Path::new("/root"));
        assert!(cache.needs_rebuild(&fs, "a", Path::new("/root/a/dfo.yaml")));
    }

    #[test]
    fn unchanged_descriptor_does_not_need_rebuild_after_record() {
        let fs = MemFilesystem::new();
        fs.write_file(Path::new("/root/a/dfo.yaml"), b"contents").unwrap();
        let mut cache = BuildCache::load(&fs, Path::new("/root"));
        cache
            .record(&fs, "a", Path::new("/root/a/dfo.yaml"), "sha256:aaa")
            .unwrap();
        assert!(!cache.needs_rebuild(&fs, "a", Path::new("/root/a/dfo.yaml")));
        assert_eq!(cache.cached_digest("a"), Some("sha256:aaa".to_string()));
    }

    #[test]
    fn changed_descriptor_needs_rebuild() {
        let fs = MemFilesystem::new();
        fs.write_file(Path::new("/root/a/dfo.yaml"), b"contents").unwrap();
        let mut cache = BuildCache::load(&fs, Path::new("/root"));
        cache
            .record(&fs, "a", Path::new("/root/a/dfo.yaml"), "sha256:aaa")
            .unwrap();
        fs.write_file(Path::new("/root/a/dfo.yaml"), b"changed").unwrap();
        assert!(cache.needs_rebuild(&fs, "a", Path::new("/root/a/dfo.yaml")));
    }

    #[test]
    fn save_then_load_round_trips_entries() {
        let fs = MemFilesystem::new();
        fs.write_file(Path::new("/root/a/dfo.yaml"), b"contents").unwrap();
        let mut cache = BuildCache::load(&fs, Path::new("/root"));
        cache
            .record(&fs, "a", Path::new("/root/a/dfo.yaml"), "sha256:aaa")
            .unwrap();
        cache.save(&fs);

        let reloaded = BuildCache::load(&fs, Path::new("/root"));
        assert_eq!(reloaded.cached_digest("a"), Some("sha256:aaa".to_string()));
    }

    #[test]
    fn force_rebuild_clears_all_entries() {
        let fs = MemFilesystem::new();
        fs.write_file(Path::new("/root/a/dfo.yaml"), b"contents").unwrap();
        let mut cache = BuildCache::load(&fs, Path::new("/root"));
        cache
            .record(&fs, "a", Path::new("/root/a/dfo.yaml"), "sha256:aaa")
            .unwrap();
        cache.invalidate_all();
        assert!(cache.needs_rebuild(&fs, "a", Path::new("/root/a/dfo.yaml")));
    }
}
