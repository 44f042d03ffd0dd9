use std::path::{Path, PathBuf};

use dimse::CacheRoot;

use crate::storage::{StorageError, StorageResult};

/// Filesystem cache that retrieved studies are written into
///
/// Objects end up under `<root>/<study>/<series>/<instance>`; the layout
/// itself is decided by the retrieve engine.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root_path: PathBuf,
}

impl FilesystemStorage {
    /// Create a new filesystem storage backend with the given root path
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to create cache root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        } else if !root_path.is_dir() {
            return Err(StorageError::Config(format!(
                "Cache root '{}' is not a directory",
                root_path.display()
            )));
        }

        // Not canonicalized: on macOS /var resolves to /private/var and the
        // paths handed to listeners would no longer match the configured root.
        Ok(Self { root_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.root_path
    }
}

impl CacheRoot for FilesystemStorage {
    fn cache_root(&self) -> &Path {
        &self.root_path
    }
}
