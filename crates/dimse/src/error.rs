//! Error types for DIMSE operations

use thiserror::Error;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("DICOM object error: {0}")]
    DicomObject(String),

    #[error("DICOM UL error: {0}")]
    DicomUl(String),

    #[error("Association rejected: {0}")]
    AssociationRejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error comes from the network or the association layer
    /// rather than from local processing.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_)
                | DimseError::DicomUl(_)
                | DimseError::AssociationRejected(_)
                | DimseError::Timeout(_)
        )
    }
}

impl From<dicom_ul::association::Error> for DimseError {
    fn from(err: dicom_ul::association::Error) -> Self {
        DimseError::DicomUl(err.to_string())
    }
}
