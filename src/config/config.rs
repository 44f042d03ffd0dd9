use std::path::{Path, PathBuf};

use dimse::{DimseConfig, RemoteNode};
use serde::Deserialize;
use thiserror::Error;

use crate::config::{LoggingConfig, RetrieverConfig};
use crate::storage::StorageConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("retriever id cannot be empty")]
    InvalidRetrieverId,

    #[error("invalid log level '{0}'")]
    InvalidLogLevel(String),

    #[error("log_file_path is required when log_to_file is enabled")]
    MissingLogFilePath,

    #[error("storage cache_dir cannot be empty")]
    EmptyCacheDir,

    #[error(transparent)]
    Dimse(#[from] dimse::DimseError),
}

/// Complete retriever configuration, as read from the TOML file
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub retriever: RetrieverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dimse: DimseConfig,
    pub archive: RemoteNode,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Read, parse and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retriever.validate()?;
        self.logging.validate()?;
        self.dimse.validate()?;
        self.archive.validate()?;

        if self.storage.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyCacheDir);
        }

        Ok(())
    }
}
