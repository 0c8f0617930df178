//! Unified filesystem capability used by every component that touches disk.
//!
//! Generation, caching, and orchestration never call `std::fs` directly; they go through this
//! trait so tests can swap in [`MemFilesystem`] instead of touching the real disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use snafu::ResultExt;

pub(crate) type Result<T> = std::result::Result<T, error::Error>;

/// What to do with a directory encountered while walking.
pub(crate) enum WalkAction {
    /// Descend into the directory.
    Continue,
    /// Don't descend into this directory, but keep walking siblings.
    SkipDir,
}

pub(crate) trait Filesystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;
    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn mkdir_all(&self, path: &Path) -> Result<()>;
    /// Walk the tree rooted at `path`, calling `visit` for every file and directory
    /// encountered (pre-order). `visit` returns a [`WalkAction`] for directories; the
    /// return value is ignored for files.
    fn walk(&self, path: &Path, visit: &mut dyn FnMut(&Path, bool) -> WalkAction) -> Result<()>;
}

/// Backs production: every operation is a thin pass-through to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RealFilesystem;

impl Filesystem for RealFilesystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).context(error::ReadSnafu { path })
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(error::MkdirSnafu { path: parent })?;
        }
        std::fs::write(path, contents).context(error::WriteSnafu { path })
    }

    fn mkdir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).context(error::MkdirSnafu { path })
    }

    fn walk(&self, path: &Path, visit: &mut dyn FnMut(&Path, bool) -> WalkAction) -> Result<()> {
        use walkdir::WalkDir;

        let mut it = WalkDir::new(path).into_iter();
        loop {
            let entry = match it.next() {
                None => break,
                Some(entry) => entry.context(error::WalkSnafu { path })?,
            };
            let is_dir = entry.file_type().is_dir();
            match visit(entry.path(), is_dir) {
                WalkAction::SkipDir if is_dir => it.skip_current_dir(),
                _ => {}
            }
        }
        Ok(())
    }
}

/// An in-memory filesystem for tests. Files are keyed by their full path; directories are
/// implicit (derived from file paths plus anything registered with [`MemFilesystem::mkdir_all`]).
#[derive(Debug, Default)]
pub(crate) struct MemFilesystem {
    files: std::sync::Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    dirs: std::sync::Mutex<std::collections::BTreeSet<PathBuf>>,
}

impl MemFilesystem {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn seed(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        let path = path.into();
        for ancestor in path.ancestors().skip(1) {
            self.dirs.lock().unwrap().insert(ancestor.to_path_buf());
        }
        self.files.lock().unwrap().insert(path, contents.into());
    }
}

impl Filesystem for MemFilesystem {
    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path) || self.dirs.lock().unwrap().contains(path)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .context(error::NotFoundSnafu { path })
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.mkdir_all(parent)?;
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn mkdir_all(&self, path: &Path) -> Result<()> {
        let mut dirs = self.dirs.lock().unwrap();
        for ancestor in path.ancestors() {
            dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    fn walk(&self, root: &Path, visit: &mut dyn FnMut(&Path, bool) -> WalkAction) -> Result<()> {
        let files = self.files.lock().unwrap();
        let dirs = self.dirs.lock().unwrap();

        let mut entries: BTreeMap<PathBuf, bool> = BTreeMap::new();
        for path in files.keys().chain(dirs.iter()) {
            if path.starts_with(root) {
                let is_dir = dirs.contains(path);
                entries.insert(path.clone(), is_dir);
            }
        }
        drop(files);
        drop(dirs);

        if entries.is_empty() {
            return Ok(());
        }

        let mut skipped: Vec<PathBuf> = Vec::new();
        for (path, is_dir) in entries {
            if skipped.iter().any(|s| path.starts_with(s) && path != *s) {
                continue;
            }
            match visit(&path, is_dir) {
                WalkAction::SkipDir if is_dir => skipped.push(path),
                _ => {}
            }
        }
        Ok(())
    }
}

pub(crate) mod error {
    use std::path::PathBuf;

    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to read '{}': {source}", path.display()))]
        Read {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to write '{}': {source}", path.display()))]
        Write {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to create directory '{}': {source}", path.display()))]
        Mkdir {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to walk directory tree at '{}': {source}", path.display()))]
        Walk {
            path: PathBuf,
            source: walkdir::Error,
        },

        #[snafu(display("No such path in memory filesystem: '{}'", path.display()))]
        NotFound { path: PathBuf },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mem_filesystem_round_trips_a_file() {
        let fs = MemFilesystem::new();
        fs.write_file(Path::new("/a/b/c.txt"), b"hello").unwrap();
        assert_eq!(fs.read_file(Path::new("/a/b/c.txt")).unwrap(), b"hello");
        assert!(fs.exists(Path::new("/a/b")));
    }

    #[test]
    fn mem_filesystem_walk_visits_every_entry_once() {
        let fs = MemFilesystem::new();
        fs.write_file(Path::new("/root/a/one.yaml"), b"1").unwrap();
        fs.write_file(Path::new("/root/b/two.yaml"), b"2").unwrap();

        let mut seen = Vec::new();
        fs.walk(Path::new("/root"), &mut |path, is_dir| {
            seen.push((path.to_path_buf(), is_dir));
            WalkAction::Continue
        })
        .unwrap();

        assert!(seen.iter().any(|(p, d)| p == Path::new("/root/a") && *d));
        assert!(seen
            .iter()
            .any(|(p, d)| p == Path::new("/root/a/one.yaml") && !*d));
        assert!(seen
            .iter()
            .any(|(p, d)| p == Path::new("/root/b/two.yaml") && !*d));
    }

    #[test]
    fn mem_filesystem_walk_honors_skip_dir_on_nested_directory() {
        let fs = MemFilesystem::new();
        fs.write_file(Path::new("/root/keep/file.yaml"), b"1")
            .unwrap();
        fs.write_file(Path::new("/root/skip/file.yaml"), b"2")
            .unwrap();
        fs.write_file(Path::new("/root/skip/nested/deeper.yaml"), b"3")
            .unwrap();

        let mut seen = Vec::new();
        fs.walk(Path::new("/root"), &mut |path, is_dir| {
            seen.push(path.to_path_buf());
            if is_dir && path == Path::new("/root/skip") {
                WalkAction::SkipDir
            } else {
                WalkAction::Continue
            }
        })
        .unwrap();

        assert!(seen.contains(&PathBuf::from("/root/keep/file.yaml")));
        assert!(seen.contains(&PathBuf::from("/root/skip")));
        assert!(!seen.contains(&PathBuf::from("/root/skip/file.yaml")));
        assert!(!seen.contains(&PathBuf::from("/root/skip/nested/deeper.yaml")));
    }

    #[test]
    fn mem_filesystem_walk_honors_skip_dir_on_root() {
        let fs = MemFilesystem::new();
        fs.write_file(Path::new("/root/file.yaml"), b"1").unwrap();

        let mut seen = Vec::new();
        fs.walk(Path::new("/root"), &mut |path, _is_dir| {
            seen.push(path.to_path_buf());
            WalkAction::SkipDir
        })
        .unwrap();

        assert_eq!(seen, vec![PathBuf::from("/root")]);
    }
}
