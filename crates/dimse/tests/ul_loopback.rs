//! End-to-end retrieve over real sockets: a `dicom-ul` archive answers the
//! C-MOVE and pushes its object back through a sub-association.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use dicom_ul::pdu::{PDataValue, PDataValueType, PresentationContextResultReason};
use dicom_ul::{ClientAssociationOptions, Pdu, ServerAssociationOptions};
use tempfile::TempDir;
use tokio::net::TcpListener;

use dimse::command::{self, status};
use dimse::{
    DimseConfig, DimseScu, MoveQuery, RemoteNode, RetrieveListener, RetrieveOutcome,
    StoredObject, UlConnector,
};

const STUDY: &str = "1.2.3";
const SERIES: &str = "1.2.3.4";
const INSTANCE: &str = "1.2.3.4.5.6";
const IMPLICIT_LE: &str = "1.2.840.10008.1.2";
const EXPLICIT_LE: &str = "1.2.840.10008.1.2.1";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Default)]
struct Recorder {
    stored: Mutex<Vec<StoredObject>>,
}

impl RetrieveListener for Recorder {
    fn on_object_stored(&self, object: StoredObject) {
        self.stored.lock().unwrap().push(object);
    }
}

/// What the archive saw while serving the retrieve
#[derive(Debug)]
struct ArchiveLog {
    move_destination: String,
    sub_association_transfer_syntax: String,
    store_status: u16,
}

fn free_port() -> u16 {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn move_response(message_id: u16, status_code: u16, remaining: u16, completed: u16) -> Vec<u8> {
    let rsp = InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, command::STUDY_ROOT_MOVE),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command::C_MOVE_RSP]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [command::NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status_code])),
        DataElement::new(
            tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [remaining]),
        ),
        DataElement::new(
            tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [completed]),
        ),
        DataElement::new(
            tags::NUMBER_OF_FAILED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [0]),
        ),
        DataElement::new(
            tags::NUMBER_OF_WARNING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [0]),
        ),
    ]);
    command::encode(&rsp).unwrap()
}

fn store_rq(message_id: u16) -> Vec<u8> {
    let rq = InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::CT_IMAGE_STORAGE),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command::C_STORE_RQ]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [command::DATA_SET_PRESENT]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, INSTANCE),
        ),
    ]);
    command::encode(&rq).unwrap()
}

fn ct_dataset() -> Vec<u8> {
    let object = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::CT_IMAGE_STORAGE),
        ),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, INSTANCE)),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, STUDY)),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, SERIES)),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^John")),
    ]);
    let mut data = Vec::new();
    object
        .write_dataset_with_ts(&mut data, &EXPLICIT_VR_LITTLE_ENDIAN.erased())
        .unwrap();
    data
}

fn single_pdv(pdu: Pdu, value_type: PDataValueType) -> Result<(u8, Vec<u8>), BoxError> {
    match pdu {
        Pdu::PData { data } => {
            let pdv = data
                .into_iter()
                .find(|pdv| pdv.value_type == value_type && pdv.is_last)
                .ok_or("missing P-DATA value")?;
            Ok((pdv.presentation_context_id, pdv.data))
        }
        other => Err(format!("unexpected PDU: {}", other.short_description()).into()),
    }
}

/// Serve one C-MOVE: report progress, push one CT object to the move
/// destination, then send the final response.
async fn run_archive(listener: TcpListener, destination_port: u16) -> Result<ArchiveLog, BoxError> {
    let (socket, _) = listener.accept().await?;
    let mut association = ServerAssociationOptions::new()
        .accept_any()
        .ae_title("ARCHIVE")
        .with_abstract_syntax(command::STUDY_ROOT_MOVE)
        .with_transfer_syntax(EXPLICIT_LE)
        .with_transfer_syntax(IMPLICIT_LE)
        .establish_async(socket)
        .await?;

    // the request and its identifier travel in a single P-DATA-TF
    let (move_pc, move_rq) = single_pdv(association.receive().await?, PDataValueType::Command)?;
    let move_rq = command::decode(&move_rq)?;
    let message_id = move_rq.element(tags::MESSAGE_ID)?.to_int::<u16>()?;
    let move_destination = move_rq
        .element(tags::MOVE_DESTINATION)?
        .to_str()?
        .trim()
        .to_string();

    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: move_pc,
                value_type: PDataValueType::Command,
                is_last: true,
                data: move_response(message_id, status::PENDING, 1, 0),
            }],
        })
        .await?;

    // implicit first: the destination must still pick explicit
    let mut push = ClientAssociationOptions::new()
        .calling_ae_title("ARCHIVE")
        .called_ae_title(move_destination.clone())
        .with_presentation_context(uids::CT_IMAGE_STORAGE, vec![IMPLICIT_LE, EXPLICIT_LE])
        .establish_async(("127.0.0.1", destination_port))
        .await?;
    let store_pc = push
        .presentation_contexts()
        .iter()
        .find(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        .ok_or("CT storage was not accepted")?;
    let (store_pc_id, sub_association_transfer_syntax) =
        (store_pc.id, store_pc.transfer_syntax.trim_end_matches('\0').to_string());

    push.send(&Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: store_pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: store_rq(7),
            },
            PDataValue {
                presentation_context_id: store_pc_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: ct_dataset(),
            },
        ],
    })
    .await?;
    let (_, store_rsp) = single_pdv(push.receive().await?, PDataValueType::Command)?;
    let store_status = command::decode(&store_rsp)?
        .element(tags::STATUS)?
        .to_int::<u16>()?;
    push.release().await?;

    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: move_pc,
                value_type: PDataValueType::Command,
                is_last: true,
                data: move_response(message_id, status::SUCCESS, 0, 1),
            }],
        })
        .await?;

    match association.receive().await? {
        Pdu::ReleaseRQ => association.send(&Pdu::ReleaseRP).await?,
        other => return Err(format!("expected A-RELEASE-RQ, got {}", other.short_description()).into()),
    }

    Ok(ArchiveLog {
        move_destination,
        sub_association_transfer_syntax,
        store_status,
    })
}

#[tokio::test]
async fn retrieve_receives_pushed_object_over_loopback() {
    let archive_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let archive_port = archive_listener.local_addr().unwrap().port();
    let destination_port = free_port();
    let archive = tokio::spawn(run_archive(archive_listener, destination_port));

    let cache = TempDir::new().unwrap();
    let config = DimseConfig {
        local_aet: "RETRIEVE_SCU".to_string(),
        bind_addr: "127.0.0.1".parse().unwrap(),
        port: destination_port,
        ..DimseConfig::default()
    };
    let recorder = Arc::new(Recorder::default());
    let scu = DimseScu::new(
        config.clone(),
        RemoteNode::new("ARCHIVE", "127.0.0.1", archive_port),
        Arc::new(UlConnector::new(config)),
        Arc::new(cache.path().to_path_buf()),
        recorder.clone(),
    );

    let outcome = tokio::time::timeout(Duration::from_secs(20), scu.retrieve(&MoveQuery::study(STUDY)))
        .await
        .expect("retrieve timed out");
    let log = tokio::time::timeout(Duration::from_secs(5), archive)
        .await
        .expect("archive timed out")
        .unwrap()
        .unwrap();

    assert_eq!(outcome, RetrieveOutcome::Success);
    assert_eq!(log.move_destination, "RETRIEVE_SCU");
    assert_eq!(log.sub_association_transfer_syntax, EXPLICIT_LE);
    assert_eq!(log.store_status, status::SUCCESS);

    let expected: PathBuf = cache.path().join(STUDY).join(SERIES).join(INSTANCE);
    assert!(expected.is_file());

    let stored = recorder.stored.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].path, expected);
    assert_eq!(stored[0].sop_instance_uid, INSTANCE);
    assert_eq!(stored[0].transfer_syntax, EXPLICIT_LE);
}
