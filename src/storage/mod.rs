use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

pub mod filesystem;

pub use filesystem::FilesystemStorage;

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Configuration for the local image cache
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./tmp/cache")
}

/// Create the cache backend described by the configuration
pub fn create_storage_backend(config: &StorageConfig) -> StorageResult<FilesystemStorage> {
    FilesystemStorage::new(&config.cache_dir)
}
