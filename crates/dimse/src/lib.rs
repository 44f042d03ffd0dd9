//! DIMSE (DICOM Message Service Element) retrieve engine
//!
//! This crate retrieves studies from a remote archive with C-MOVE. While the
//! move is in flight it acts as the Service Class Provider for the C-STORE and
//! C-ECHO sub-operations the archive pushes back, writing every received object
//! into a local cache.
//!
//! # Features
//! - Outbound C-MOVE at the Study Root information model (SCU)
//! - Inbound C-STORE / C-ECHO on the sub-associations (SCP)
//! - Translation of final move statuses into a [`RetrieveOutcome`]
//! - Cache layout `<root>/<study>/<series>/<instance>`
//! - Transport seam ([`transport`]) with a `dicom-ul` implementation ([`ul`])

pub mod command;
pub mod config;
pub mod error;
pub mod negotiation;
pub mod scp;
pub mod scu;
pub mod status;
pub mod storage;
pub mod transport;
pub mod types;
pub mod ul;

// Re-export commonly used types
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use scp::{RetrieveListener, StoreResponder, SubAssociationAcceptor};
pub use scu::DimseScu;
pub use storage::CacheRoot;
pub use types::{
    MoveFailure, MovePriority, MoveQuery, QueryLevel, RetrieveOutcome, StoredObject,
    SubOperationCounters,
};
pub use ul::UlConnector;

/// Default DICOM port
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
