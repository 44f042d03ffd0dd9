//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::DEFAULT_DIMSE_PORT;

/// Configuration for the local side of a retrieve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title, also used as the C-MOVE destination
    #[serde(default = "default_local_aet")]
    pub local_aet: String,

    /// Bind address for the sub-association listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port the archive pushes sub-associations to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Transfer syntaxes accepted on sub-associations, in order of preference
    #[serde(default = "default_transfer_syntaxes")]
    pub preferred_transfer_syntaxes: Vec<String>,
}

/// Configuration for a remote DICOM node (the archive a retrieve is sent to)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Port of the query/retrieve service, when it differs from `port`
    #[serde(default)]
    pub retrieve_port: Option<u16>,

    /// Connection timeout in milliseconds (overrides global setting)
    pub connect_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides global setting)
    pub max_pdu: Option<u32>,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: default_local_aet(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            preferred_transfer_syntaxes: default_transfer_syntaxes(),
        }
    }
}

impl DimseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title("Local", &self.local_aet)?;

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Port must be greater than 0"
            ));
        }

        if self.max_pdu < 16384 || self.max_pdu > 131072 {
            return Err(crate::error::DimseError::config(
                "Max PDU size must be between 16384 and 131072 bytes"
            ));
        }

        if self.preferred_transfer_syntaxes.is_empty() {
            return Err(crate::error::DimseError::config(
                "At least one transfer syntax must be accepted"
            ));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            retrieve_port: None,
            connect_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Use a dedicated query/retrieve port
    pub fn with_retrieve_port(mut self, port: u16) -> Self {
        self.retrieve_port = Some(port);
        self
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Port used to open the retrieve session
    pub fn retrieve_service_port(&self) -> u16 {
        self.retrieve_port.unwrap_or(self.port)
    }

    /// `host:port` of the retrieve service
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.retrieve_service_port())
    }

    /// Connection timeout for this node, falling back to the global setting
    pub fn connect_timeout(&self, config: &DimseConfig) -> Duration {
        self.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.connect_timeout())
    }

    /// Maximum PDU size for this node, falling back to the global setting
    pub fn max_pdu(&self, config: &DimseConfig) -> u32 {
        self.max_pdu.unwrap_or(config.max_pdu)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title("Remote", &self.ae_title)?;

        if self.host.is_empty() {
            return Err(crate::error::DimseError::config(
                "Remote host cannot be empty"
            ));
        }

        if self.port == 0 || self.retrieve_port == Some(0) {
            return Err(crate::error::DimseError::config(
                "Remote port must be greater than 0"
            ));
        }

        Ok(())
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.ae_title, self.address())
    }
}

fn validate_ae_title(side: &str, ae_title: &str) -> crate::error::Result<()> {
    if ae_title.trim().is_empty() || ae_title.len() > 16 {
        return Err(crate::error::DimseError::config(format!(
            "{} AE title must be 1-16 characters",
            side
        )));
    }
    Ok(())
}

// Default value functions
fn default_local_aet() -> String {
    "RETRIEVE_SCU".to_string()
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    65536
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        "1.2.840.10008.1.2.4.70".to_string(), // JPEG Lossless, First-Order Prediction
        "1.2.840.10008.1.2.1".to_string(),    // Explicit VR Little Endian
        "1.2.840.10008.1.2.2".to_string(),    // Explicit VR Big Endian
        "1.2.840.10008.1.2".to_string(),      // Implicit VR Little Endian
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DimseConfig::default();
        assert_eq!(config.local_aet, "RETRIEVE_SCU");
        assert_eq!(config.port, DEFAULT_DIMSE_PORT);
        assert_eq!(config.preferred_transfer_syntaxes[0], "1.2.840.10008.1.2.4.70");
        assert_eq!(
            config.preferred_transfer_syntaxes.last().map(String::as_str),
            Some("1.2.840.10008.1.2")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remote_node_builder() {
        let node = RemoteNode::new("PACS", "pacs.local", 104)
            .with_retrieve_port(11112)
            .with_timeout(10_000);

        assert_eq!(node.ae_title, "PACS");
        assert_eq!(node.retrieve_service_port(), 11112);
        assert_eq!(node.address(), "pacs.local:11112");
        assert_eq!(node.connect_timeout_ms, Some(10_000));
        assert_eq!(node.to_string(), "PACS@pacs.local:11112");
    }

    #[test]
    fn test_retrieve_port_falls_back_to_port() {
        let node = RemoteNode::new("PACS", "pacs.local", 104);
        assert_eq!(node.retrieve_service_port(), 104);
    }

    #[test]
    fn test_node_overrides_global_settings() {
        let config = DimseConfig {
            connect_timeout_ms: 5000,
            ..Default::default()
        };

        let node = RemoteNode::new("TEST1", "localhost", 11112);
        assert_eq!(node.connect_timeout(&config), Duration::from_millis(5000));
        assert_eq!(node.max_pdu(&config), 65536);

        let node = RemoteNode::new("TEST2", "localhost", 11113).with_timeout(2000);
        assert_eq!(node.connect_timeout(&config), Duration::from_millis(2000));
    }

    #[test]
    fn test_config_validation() {
        let mut config = DimseConfig::default();
        assert!(config.validate().is_ok());

        config.local_aet = "".to_string();
        assert!(config.validate().is_err());

        config.local_aet = "A".repeat(17);
        assert!(config.validate().is_err());

        let mut config = DimseConfig::default();
        config.preferred_transfer_syntaxes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_node_validation() {
        assert!(RemoteNode::new("PACS", "localhost", 104).validate().is_ok());
        assert!(RemoteNode::new("", "localhost", 104).validate().is_err());
        assert!(RemoteNode::new("PACS", "", 104).validate().is_err());
        assert!(RemoteNode::new("PACS", "localhost", 0).validate().is_err());
        assert!(RemoteNode::new("PACS", "localhost", 104)
            .with_retrieve_port(0)
            .validate()
            .is_err());
    }
}
