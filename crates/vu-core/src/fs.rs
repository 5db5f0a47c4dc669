//! Virtual filesystems consulted by the module loader.
//!
//! `Bundle::compile` resolves every `import` statement through a
//! `scheme -> Box<dyn VirtualFilesystem>` map (`spec.md` §3/§4.1). This
//! module provides the trait and the two concrete implementations the core
//! needs: an in-memory map (used to rebuild a `Bundle` from an `Archive`,
//! and in tests) and a root-jailed directory on local disk.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use vu_types::RunnerError;

/// A source of module bytes keyed by path. Implementations must reject any
/// path that resolves outside their declared root with
/// [`RunnerError::DirectoryTraversal`] rather than opening it.
pub trait VirtualFilesystem: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>, RunnerError>;
    fn exists(&self, path: &str) -> bool;
}

/// An in-memory filesystem backed by a flat `path -> bytes` map. Used to
/// reconstruct a `Bundle` from an `Archive` (`spec.md` §4.1's round-trip
/// invariant) and as the filesystem of choice in tests, where no real
/// directory on disk should be required.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilesystem {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.files.insert(normalize(&path.into()), bytes.into());
        self
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }
}

impl VirtualFilesystem for MemoryFilesystem {
    fn read(&self, path: &str) -> Result<Vec<u8>, RunnerError> {
        self.files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| RunnerError::compile(path, "module not found"))
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(&normalize(path))
    }
}

/// A filesystem jailed to a root directory on local disk. Any resolved path
/// that escapes `root` after `..`/symlink-free normalization is rejected.
pub struct DirectoryFilesystem {
    root: PathBuf,
}

impl DirectoryFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn jailed_path(&self, path: &str) -> Result<PathBuf, RunnerError> {
        let candidate = self.root.join(path.trim_start_matches('/'));
        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(RunnerError::DirectoryTraversal {
                            requested: path.to_string(),
                            root: self.root.display().to_string(),
                        });
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }
        if !normalized.starts_with(&self.root) {
            return Err(RunnerError::DirectoryTraversal {
                requested: path.to_string(),
                root: self.root.display().to_string(),
            });
        }
        Ok(normalized)
    }
}

impl VirtualFilesystem for DirectoryFilesystem {
    fn read(&self, path: &str) -> Result<Vec<u8>, RunnerError> {
        let jailed = self.jailed_path(path)?;
        std::fs::read(&jailed)
            .map_err(|e| RunnerError::compile(path, format!("read failed: {e}")))
    }

    fn exists(&self, path: &str) -> bool {
        self.jailed_path(path)
            .map(|p| p.exists())
            .unwrap_or(false)
    }
}

fn normalize(path: &str) -> String {
    let mut out = PathBuf::new();
    for component in Path::new(path.trim_start_matches("./")).components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_fs_rejects_missing_module() {
        let fs = MemoryFilesystem::new().with_file("main.rhai", b"fn default(){}".to_vec());
        assert!(fs.read("missing.rhai").is_err());
        assert!(fs.exists("main.rhai"));
    }

    #[test]
    fn directory_fs_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.rhai"), b"fn default(){}").unwrap();
        let fs = DirectoryFilesystem::new(dir.path());
        assert!(fs.read("main.rhai").is_ok());
        let err = fs.read("../../etc/passwd").unwrap_err();
        assert!(matches!(err, RunnerError::DirectoryTraversal { .. }));
    }
}
