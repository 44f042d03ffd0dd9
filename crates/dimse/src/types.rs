//! Common types for retrieve operations

use std::collections::BTreeMap;
use std::path::PathBuf;

use dicom_core::{DataDictionary, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};

use crate::error::{DimseError, Result};

/// Selection criteria of a C-MOVE (the "mask" sent as identifier)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveQuery {
    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    /// Query parameters keyed by DICOM keyword or `GGGGEEEE` tag
    pub parameters: BTreeMap<String, String>,

    /// Priority of the move operation
    pub priority: MovePriority,
}

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLevel {
    /// Patient level
    Patient,
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

/// Priority levels for C-MOVE operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePriority {
    /// Low priority
    Low,
    /// Medium priority (default)
    Medium,
    /// High priority
    High,
}

impl MovePriority {
    /// Value of the Priority (0000,0700) command element
    pub fn code(self) -> u16 {
        match self {
            MovePriority::Medium => 0x0000,
            MovePriority::High => 0x0001,
            MovePriority::Low => 0x0002,
        }
    }
}

/// Sub-operation counters reported by the archive in C-MOVE responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOperationCounters {
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

impl SubOperationCounters {
    /// Read the four counters from a C-MOVE response command
    pub fn from_command(command: &InMemDicomObject) -> Self {
        let read = |tag: Tag| {
            command
                .element(tag)
                .ok()
                .and_then(|e| e.to_int::<u16>().ok())
        };
        Self {
            remaining: read(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed: read(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed: read(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning: read(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
        }
    }
}

impl std::fmt::Display for SubOperationCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: Option<u16>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
        write!(
            f,
            "remaining={} completed={} failed={} warning={}",
            show(self.remaining),
            show(self.completed),
            show(self.failed),
            show(self.warning)
        )
    }
}

/// Why a retrieve failed, as reported by the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveFailure {
    /// Out of resources or identifier/processing failure
    MoveRefused { status: u16 },
    /// The archive does not know our AE title
    DestinationUnknown { status: u16 },
    /// A status code outside the recognized table
    Unknown { status: u16 },
}

impl MoveFailure {
    pub fn status(&self) -> u16 {
        match self {
            MoveFailure::MoveRefused { status }
            | MoveFailure::DestinationUnknown { status }
            | MoveFailure::Unknown { status } => *status,
        }
    }
}

/// Caller-visible result of one retrieve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrieveOutcome {
    /// Every sub-operation completed
    Success,
    /// Sub-operations complete with one or more failures
    PartialSuccess(SubOperationCounters),
    /// The archive refused or failed the move
    Failure(MoveFailure),
    /// The archive could not be reached, or the network failed mid-move
    ConnectionError(String),
    /// No usable presentation context or a malformed exchange
    ProtocolError(String),
}

impl RetrieveOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RetrieveOutcome::Success)
    }
}

impl std::fmt::Display for RetrieveOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrieveOutcome::Success => write!(f, "success"),
            RetrieveOutcome::PartialSuccess(counters) => {
                write!(f, "partial success ({})", counters)
            }
            RetrieveOutcome::Failure(MoveFailure::MoveRefused { status }) => {
                write!(f, "move refused (status 0x{:04X})", status)
            }
            RetrieveOutcome::Failure(MoveFailure::DestinationUnknown { status }) => {
                write!(f, "move destination unknown (status 0x{:04X})", status)
            }
            RetrieveOutcome::Failure(MoveFailure::Unknown { status }) => {
                write!(f, "unknown move error (status 0x{:04X})", status)
            }
            RetrieveOutcome::ConnectionError(msg) => write!(f, "connection error: {}", msg),
            RetrieveOutcome::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

/// Where a retrieve currently is in its dual-role exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievePhase {
    Connecting,
    MoveSent,
    AcceptingSubAssociation,
    Dispatching,
    Terminating,
}

/// A received composite object that has been written to the cache
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Absolute path of the stored dataset
    pub path: PathBuf,
    /// Decoded dataset as it was written
    pub dataset: InMemDicomObject,
    /// Transfer syntax the dataset is encoded in on disk
    pub transfer_syntax: String,
    /// Affected SOP Class UID from the C-STORE request
    pub sop_class_uid: String,
    /// Affected SOP Instance UID from the C-STORE request
    pub sop_instance_uid: String,
    /// Status sent back to the archive for this object
    pub status: u16,
    /// Timestamp when the object was received
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl StoredObject {
    /// Read a string attribute of the stored dataset
    pub fn attribute(&self, tag: Tag) -> Option<String> {
        self.dataset
            .element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|v| trim_uid(&v).to_string())
    }
}

impl MoveQuery {
    /// Create a new move query
    pub fn new(query_level: QueryLevel) -> Self {
        Self {
            query_level,
            parameters: BTreeMap::new(),
            priority: MovePriority::Medium,
        }
    }

    /// Study-level query for one study
    pub fn study(study_instance_uid: impl Into<String>) -> Self {
        Self::new(QueryLevel::Study).with_parameter("StudyInstanceUID", study_instance_uid)
    }

    /// Series-level query for one series of a study
    pub fn series(
        study_instance_uid: impl Into<String>,
        series_instance_uid: impl Into<String>,
    ) -> Self {
        Self::new(QueryLevel::Series)
            .with_parameter("StudyInstanceUID", study_instance_uid)
            .with_parameter("SeriesInstanceUID", series_instance_uid)
    }

    /// Add a query parameter
    pub fn with_parameter(mut self, tag: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(tag.into(), value.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: MovePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Build the identifier dataset sent with the C-MOVE request
    pub fn to_identifier(&self) -> Result<InMemDicomObject> {
        let mut identifier = InMemDicomObject::new_empty();
        identifier.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(self.query_level.to_string()),
        ));

        for (key, value) in &self.parameters {
            let tag = parse_tag(key)?;
            let vr = StandardDataDictionary
                .by_tag(tag)
                .map(|entry| entry.vr.relaxed())
                .unwrap_or(VR::LO);
            let value = if value.is_empty() {
                PrimitiveValue::Empty
            } else {
                PrimitiveValue::from(value.as_str())
            };
            identifier.put(DataElement::new(tag, vr, value));
        }

        Ok(identifier)
    }
}

/// Parse a tag given as keyword, `(GGGG,EEEE)` or `GGGGEEEE`
pub fn parse_tag(tag_str: &str) -> Result<Tag> {
    if let Some(tag) = StandardDataDictionary.parse_tag(tag_str) {
        return Ok(tag);
    }

    if tag_str.len() == 8 {
        if let (Ok(group), Ok(element)) = (
            u16::from_str_radix(&tag_str[0..4], 16),
            u16::from_str_radix(&tag_str[4..8], 16),
        ) {
            return Ok(Tag(group, element));
        }
    }

    Err(DimseError::config(format!("Invalid tag format: {}", tag_str)))
}

/// Strip DICOM value padding from a UID
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = crate::error::DimseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            _ => Err(crate::error::DimseError::config(format!("Invalid query level: {}", s))),
        }
    }
}
