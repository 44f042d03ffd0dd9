//! DIMSE command sets sent and received during a retrieve
//!
//! Command sets are always encoded in Implicit VR Little Endian, independently
//! of the transfer syntax negotiated for the data sets that follow them.

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;

use crate::error::{DimseError, Result};
use crate::types::{trim_uid, MovePriority, SubOperationCounters};

/// Study Root Query/Retrieve Information Model - MOVE
pub const STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";

/// Verification SOP Class
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

// Command Field values (PS3.7 E.1)
pub const C_STORE_RQ: u16 = 0x0001;
pub const C_STORE_RSP: u16 = 0x8001;
pub const C_MOVE_RQ: u16 = 0x0021;
pub const C_MOVE_RSP: u16 = 0x8021;
pub const C_ECHO_RQ: u16 = 0x0030;
pub const C_ECHO_RSP: u16 = 0x8030;

/// Command Data Set Type meaning "no data set follows"
pub const NO_DATA_SET: u16 = 0x0101;
/// Command Data Set Type used when a data set follows
pub const DATA_SET_PRESENT: u16 = 0x0000;

pub mod status {
    //! DIMSE status codes used by the retrieve engine (PS3.4 C.4.2, B.2.3)

    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const PENDING_WITH_WARNINGS: u16 = 0xFF01;

    pub const MOVE_REFUSED_OUT_OF_RESOURCES_MATCHES: u16 = 0xA701;
    pub const MOVE_REFUSED_OUT_OF_RESOURCES_SUB_OPERATIONS: u16 = 0xA702;
    pub const MOVE_FAILED_DESTINATION_UNKNOWN: u16 = 0xA801;
    pub const MOVE_FAILED_IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;
    pub const MOVE_FAILED_UNABLE_TO_PROCESS: u16 = 0xC000;
    pub const MOVE_WARNING_SUB_OPERATIONS_FAILED: u16 = 0xB000;

    pub const STORE_REFUSED_OUT_OF_RESOURCES: u16 = 0xA700;
    pub const STORE_ERROR_DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;
    pub const STORE_ERROR_CANNOT_UNDERSTAND: u16 = 0xC000;

    /// Whether a C-MOVE response is an intermediate one
    pub fn is_pending(code: u16) -> bool {
        matches!(code, PENDING | PENDING_WITH_WARNINGS)
    }
}

/// A C-MOVE request ready to be sent on the archive session
#[derive(Debug, Clone)]
pub struct MoveRequest {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: MovePriority,
    pub move_destination: String,
    pub identifier: InMemDicomObject,
}

/// The final C-MOVE response of a retrieve
#[derive(Debug, Clone)]
pub struct MoveResponse {
    pub message_id_being_responded_to: u16,
    pub status: u16,
    pub counters: SubOperationCounters,
    /// Error Comment, Offending Element and friends, when the archive sent any
    pub status_detail: Option<InMemDicomObject>,
}

/// An inbound C-STORE request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub move_originator_ae_title: Option<String>,
}

/// An inbound DIMSE message on a sub-association
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubOperationRequest {
    Store(StoreRequest),
    Echo { message_id: u16 },
    /// Any other command field
    Unsupported { command_field: u16 },
}

impl MoveRequest {
    /// Command set of the C-MOVE-RQ
    pub fn command(&self) -> InMemDicomObject<StandardDataDictionary> {
        InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_class_uid.as_str()),
            ),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_MOVE_RQ])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
            DataElement::new(
                tags::MOVE_DESTINATION,
                VR::AE,
                dicom_value!(Str, self.move_destination.as_str()),
            ),
            DataElement::new(
                tags::PRIORITY,
                VR::US,
                dicom_value!(U16, [self.priority.code()]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_PRESENT]),
            ),
        ])
    }
}

impl MoveResponse {
    /// Interpret a C-MOVE-RSP command set
    pub fn from_command(command: InMemDicomObject) -> Result<Self> {
        let field = command_field(&command)?;
        if field != C_MOVE_RSP {
            return Err(DimseError::protocol(format!(
                "expected C-MOVE-RSP, got command field 0x{:04X}",
                field
            )));
        }
        let status = read_u16(&command, tags::STATUS, "Status")?;
        let message_id_being_responded_to = read_u16(
            &command,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "Message ID Being Responded To",
        )?;
        let counters = SubOperationCounters::from_command(&command);
        let has_detail = [tags::ERROR_COMMENT, tags::OFFENDING_ELEMENT]
            .iter()
            .any(|tag| command.element(*tag).is_ok());

        Ok(Self {
            message_id_being_responded_to,
            status,
            counters,
            // the related fields of a failure live in the command set itself
            status_detail: if status != status::SUCCESS || has_detail {
                Some(command)
            } else {
                None
            },
        })
    }

    /// Whether more responses follow this one
    pub fn is_pending(&self) -> bool {
        status::is_pending(self.status)
    }
}

impl SubOperationRequest {
    /// Interpret a command set received on a sub-association
    pub fn from_command(command: &InMemDicomObject) -> Result<Self> {
        let field = command_field(command)?;
        match field {
            C_STORE_RQ => Ok(SubOperationRequest::Store(StoreRequest {
                message_id: read_u16(command, tags::MESSAGE_ID, "Message ID")?,
                affected_sop_class_uid: read_uid(
                    command,
                    tags::AFFECTED_SOP_CLASS_UID,
                    "Affected SOP Class UID",
                )?,
                affected_sop_instance_uid: read_uid(
                    command,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    "Affected SOP Instance UID",
                )?,
                move_originator_ae_title: command
                    .element(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)
                    .ok()
                    .and_then(|e| e.to_str().ok())
                    .map(|v| v.trim().to_string()),
            })),
            C_ECHO_RQ => Ok(SubOperationRequest::Echo {
                message_id: read_u16(command, tags::MESSAGE_ID, "Message ID")?,
            }),
            other => Ok(SubOperationRequest::Unsupported { command_field: other }),
        }
    }
}

/// Command set of a C-STORE-RSP
pub fn store_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status_code: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status_code])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

/// Command set of a successful C-ECHO-RSP
pub fn echo_response(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status::SUCCESS])),
    ])
}

/// Whether a command announces a data set after it
pub fn has_data_set(command: &InMemDicomObject) -> bool {
    command
        .element(tags::COMMAND_DATA_SET_TYPE)
        .ok()
        .and_then(|e| e.to_int::<u16>().ok())
        .map(|v| v != NO_DATA_SET)
        .unwrap_or(false)
}

/// Serialize a command set for the wire
pub fn encode(command: &InMemDicomObject) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::DicomObject(format!("could not write command: {}", e)))?;
    Ok(data)
}

/// Parse a command set received from the wire
pub fn decode(data: &[u8]) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::protocol(format!("failed to read incoming DICOM command: {}", e)))
}

fn command_field(command: &InMemDicomObject) -> Result<u16> {
    read_u16(command, tags::COMMAND_FIELD, "Command Field")
}

fn read_u16(command: &InMemDicomObject, tag: dicom_core::Tag, name: &str) -> Result<u16> {
    command
        .element(tag)
        .map_err(|_| DimseError::protocol(format!("missing {}", name)))?
        .to_int::<u16>()
        .map_err(|_| DimseError::protocol(format!("{} is not an integer", name)))
}

fn read_uid(command: &InMemDicomObject, tag: dicom_core::Tag, name: &str) -> Result<String> {
    let value = command
        .element(tag)
        .map_err(|_| DimseError::protocol(format!("missing {}", name)))?
        .to_str()
        .map_err(|_| DimseError::protocol(format!("could not retrieve {}", name)))?;
    Ok(trim_uid(&value).to_string())
}
