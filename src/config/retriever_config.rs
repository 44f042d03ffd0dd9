use serde::Deserialize;

use crate::config::ConfigError;

/// Identity and verbosity of this retriever instance
#[derive(Debug, Deserialize, Clone)]
pub struct RetrieverConfig {
    pub id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl RetrieverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidRetrieverId);
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        Ok(())
    }
}

/// Default log level for the retriever configuration
fn default_log_level() -> String {
    "info".to_string()
}
