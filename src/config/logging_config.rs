use serde::Deserialize;

use crate::config::ConfigError;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default)]
    pub log_file_path: String,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_to_file && self.log_file_path.trim().is_empty() {
            return Err(ConfigError::MissingLogFilePath);
        }
        Ok(())
    }
}
