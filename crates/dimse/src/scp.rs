//! Service Class Provider side of a retrieve
//!
//! While a C-MOVE is in flight the archive opens sub-associations back to us
//! and pushes the matching objects with C-STORE. The [`SubAssociationAcceptor`]
//! negotiates each of them and dispatches the commands it receives to the
//! [`StoreResponder`] or the [`EchoResponder`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use tracing::{debug, error, info, warn};

use crate::command::{self, status, StoreRequest, SubOperationRequest};
use crate::config::DimseConfig;
use crate::error::{DimseError, Result};
use crate::storage::{self, CacheRoot};
use crate::transport::{
    AcceptPolicy, IncomingAssociation, Received, ReceivedDataset, SubAssociation,
    SubAssociationHandle, SubOperationHandler, Termination,
};
use crate::types::{trim_uid, RetrievePhase, StoredObject, SubOperationCounters};

/// Storage SOP classes offered on pushed sub-associations
pub const STORAGE_SOP_CLASSES: &[&str] = &[
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::BREAST_TOMOSYNTHESIS_IMAGE_STORAGE,
    uids::BREAST_PROJECTION_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::BREAST_PROJECTION_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_IMAGE_STORAGE,
    uids::ULTRASOUND_IMAGE_STORAGE,
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_BYTE_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_WORD_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_TRUE_COLOR_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::ENHANCED_PET_IMAGE_STORAGE,
    uids::RT_IMAGE_STORAGE,
    uids::RT_DOSE_STORAGE,
    uids::RT_STRUCTURE_SET_STORAGE,
    uids::RT_PLAN_STORAGE,
    uids::GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
    uids::BASIC_TEXT_SR_STORAGE,
    uids::ENHANCED_SR_STORAGE,
    uids::COMPREHENSIVE_SR_STORAGE,
    uids::KEY_OBJECT_SELECTION_DOCUMENT_STORAGE,
    uids::ENCAPSULATED_PDF_STORAGE,
];

/// Receives the objects and progress of a retrieve
pub trait RetrieveListener: Send + Sync {
    /// A pushed object was written to the cache. Called once per stored object.
    fn on_object_stored(&self, object: StoredObject);

    /// The archive reported progress in a pending C-MOVE response
    fn on_progress(&self, _counters: &SubOperationCounters) {}
}

/// Negotiation policy for pushed sub-associations: verification plus every
/// storage class, with the transfer syntaxes in configured preference order.
pub fn accept_policy(config: &DimseConfig) -> AcceptPolicy {
    let mut abstract_syntaxes = vec![command::VERIFICATION.to_string()];
    abstract_syntaxes.extend(STORAGE_SOP_CLASSES.iter().map(|uid| uid.to_string()));

    AcceptPolicy {
        abstract_syntaxes,
        transfer_syntaxes: config.preferred_transfer_syntaxes.clone(),
    }
}

/// State of one inbound C-STORE, from the request header to the response
#[derive(Debug, Clone)]
pub struct SubOperationContext {
    pub request: StoreRequest,
    /// Name of the file in the series directory
    pub file_name: String,
    pub peer_ae_title: String,
}

impl SubOperationContext {
    pub fn new(request: StoreRequest, peer_ae_title: impl Into<String>) -> Self {
        let file_name = trim_uid(&request.affected_sop_instance_uid).to_string();
        Self {
            request,
            file_name,
            peer_ae_title: peer_ae_title.into(),
        }
    }
}

/// Persists pushed objects and decides their C-STORE status
pub struct StoreResponder {
    cache_root: Arc<dyn CacheRoot>,
    listener: Arc<dyn RetrieveListener>,
}

impl StoreResponder {
    pub fn new(cache_root: Arc<dyn CacheRoot>, listener: Arc<dyn RetrieveListener>) -> Self {
        Self {
            cache_root,
            listener,
        }
    }

    /// Handle the end of a store transfer and return the status to send back.
    ///
    /// Failures are absorbed here and only show up in the returned status.
    pub fn store(&self, context: &SubOperationContext, received: Option<ReceivedDataset>) -> u16 {
        let Some(received) = received else {
            debug!(
                "C-STORE {} carried no data set",
                context.request.affected_sop_instance_uid
            );
            return status::SUCCESS;
        };

        let path = match self.persist(context, &received) {
            Ok(path) => path,
            Err(e) => {
                error!(
                    "Could not save {} from {}: {}",
                    context.file_name, context.peer_ae_title, e
                );
                return status::STORE_REFUSED_OUT_OF_RESOURCES;
            }
        };

        let status_code = validate_sop_identity(&context.request, &received.dataset);

        debug!("Stored {} (status 0x{:04X})", path.display(), status_code);
        self.listener.on_object_stored(StoredObject {
            path,
            dataset: received.dataset,
            transfer_syntax: received.transfer_syntax,
            sop_class_uid: trim_uid(&context.request.affected_sop_class_uid).to_string(),
            sop_instance_uid: trim_uid(&context.request.affected_sop_instance_uid).to_string(),
            status: status_code,
            received_at: chrono::Utc::now(),
        });

        status_code
    }

    fn persist(&self, context: &SubOperationContext, received: &ReceivedDataset) -> Result<PathBuf> {
        let study = dataset_uid(&received.dataset, tags::STUDY_INSTANCE_UID).unwrap_or_default();
        let series = dataset_uid(&received.dataset, tags::SERIES_INSTANCE_UID).unwrap_or_default();
        let path = storage::resolve(
            &study,
            &series,
            &context.file_name,
            self.cache_root.cache_root(),
        )?;

        if let Err(e) = write_dataset(&path, received) {
            error!("Failed to write {}: {}", path.display(), e);
            remove_partial_file(&path);
            return Err(e);
        }

        Ok(path)
    }
}

/// Write the data set without file meta information, in the transfer syntax
/// it was received in.
///
/// Group length elements are written as received, not recalculated.
fn write_dataset(path: &Path, received: &ReceivedDataset) -> Result<()> {
    let ts = TransferSyntaxRegistry
        .get(trim_uid(&received.transfer_syntax))
        .ok_or_else(|| {
            DimseError::storage(format!(
                "unsupported transfer syntax {}",
                received.transfer_syntax
            ))
        })?;

    let file = File::create(path)
        .map_err(|e| DimseError::storage(format!("could not create file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    received
        .dataset
        .write_dataset_with_ts(&mut writer, ts)
        .map_err(|e| DimseError::storage(format!("could not encode data set: {}", e)))?;
    writer
        .flush()
        .map_err(|e| DimseError::storage(format!("could not flush file: {}", e)))?;
    Ok(())
}

fn remove_partial_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial file {}: {}", path.display(), e),
    }
}

/// Compare the SOP class and instance inside the data set with the request
fn validate_sop_identity(request: &StoreRequest, dataset: &InMemDicomObject) -> u16 {
    let class = dataset_uid(dataset, tags::SOP_CLASS_UID);
    let instance = dataset_uid(dataset, tags::SOP_INSTANCE_UID);

    match (class, instance) {
        (Some(class), Some(instance)) => {
            if class != trim_uid(&request.affected_sop_class_uid) {
                warn!(
                    "Data set SOP class {} does not match request {}",
                    class, request.affected_sop_class_uid
                );
                status::STORE_ERROR_DATA_SET_DOES_NOT_MATCH_SOP_CLASS
            } else if instance != trim_uid(&request.affected_sop_instance_uid) {
                warn!(
                    "Data set SOP instance {} does not match request {}",
                    instance, request.affected_sop_instance_uid
                );
                status::STORE_ERROR_DATA_SET_DOES_NOT_MATCH_SOP_CLASS
            } else {
                status::SUCCESS
            }
        }
        _ => {
            warn!(
                "No SOP class or instance in data set for {}",
                request.affected_sop_instance_uid
            );
            status::STORE_ERROR_CANNOT_UNDERSTAND
        }
    }
}

fn dataset_uid(dataset: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    let value = dataset.element(tag).ok()?.to_str().ok()?;
    let value = trim_uid(&value);
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Answers C-ECHO on a sub-association
pub struct EchoResponder;

impl EchoResponder {
    /// Reply with success. A send failure is only logged.
    pub async fn respond(
        association: &mut dyn SubAssociation,
        presentation_context_id: u8,
        message_id: u16,
    ) {
        debug!("C-ECHO from {}", association.peer_ae_title());
        if let Err(e) = association
            .send_command(presentation_context_id, command::echo_response(message_id))
            .await
        {
            warn!(
                "Could not send C-ECHO response to {}: {}",
                association.peer_ae_title(),
                e
            );
        }
    }
}

/// Drives sub-associations opened by the archive during a C-MOVE
pub struct SubAssociationAcceptor {
    policy: AcceptPolicy,
    store: StoreResponder,
    listener: Arc<dyn RetrieveListener>,
    phase: RetrievePhase,
}

impl SubAssociationAcceptor {
    pub fn new(
        config: &DimseConfig,
        cache_root: Arc<dyn CacheRoot>,
        listener: Arc<dyn RetrieveListener>,
    ) -> Self {
        Self {
            policy: accept_policy(config),
            store: StoreResponder::new(cache_root, Arc::clone(&listener)),
            listener,
            phase: RetrievePhase::MoveSent,
        }
    }

    pub fn phase(&self) -> RetrievePhase {
        self.phase
    }

    async fn accept(&mut self, incoming: Box<dyn IncomingAssociation>) -> SubAssociationHandle {
        self.phase = RetrievePhase::AcceptingSubAssociation;
        let peer = incoming.peer();
        match incoming.accept(&self.policy).await {
            Ok(association) => {
                info!(
                    "Accepted sub-association from {} ({})",
                    association.peer_ae_title(),
                    peer
                );
                SubAssociationHandle::Accepted(association)
            }
            Err(e) => {
                warn!("Could not negotiate sub-association from {}: {}", peer, e);
                SubAssociationHandle::Terminated(Termination::Rejected)
            }
        }
    }

    /// Receive and handle commands until the peer goes quiet or the
    /// sub-association ends.
    async fn dispatch(&mut self, mut association: Box<dyn SubAssociation>) -> SubAssociationHandle {
        self.phase = RetrievePhase::Dispatching;
        loop {
            match association.receive_command().await {
                Ok(Received::Idle) => return SubAssociationHandle::Accepted(association),
                Ok(Received::Command {
                    presentation_context_id,
                    command,
                }) => {
                    if let Err(e) = self
                        .handle_command(association.as_mut(), presentation_context_id, &command)
                        .await
                    {
                        error!(
                            "Aborting sub-association with {}: {}",
                            association.peer_ae_title(),
                            e
                        );
                        return abort(association).await;
                    }
                }
                Ok(Received::PeerReleased) => {
                    return match association.acknowledge_release().await {
                        Ok(()) => {
                            info!(
                                "Sub-association with {} released",
                                association.peer_ae_title()
                            );
                            SubAssociationHandle::Terminated(Termination::Released)
                        }
                        Err(e) => {
                            warn!("Could not confirm release: {}", e);
                            abort(association).await
                        }
                    };
                }
                Ok(Received::PeerAborted) => {
                    warn!(
                        "Sub-association aborted by {}",
                        association.peer_ae_title()
                    );
                    return SubAssociationHandle::Terminated(Termination::Aborted);
                }
                Err(e) => {
                    error!(
                        "Error on sub-association with {}: {}",
                        association.peer_ae_title(),
                        e
                    );
                    return abort(association).await;
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        association: &mut dyn SubAssociation,
        presentation_context_id: u8,
        command: &InMemDicomObject,
    ) -> Result<()> {
        match SubOperationRequest::from_command(command)? {
            SubOperationRequest::Store(request) => {
                let context = SubOperationContext::new(request, association.peer_ae_title());
                let received = if command::has_data_set(command) {
                    association.receive_dataset(presentation_context_id).await?
                } else {
                    None
                };

                let status_code = self.store.store(&context, received);
                let response = command::store_response(
                    context.request.message_id,
                    trim_uid(&context.request.affected_sop_class_uid),
                    trim_uid(&context.request.affected_sop_instance_uid),
                    status_code,
                );
                association
                    .send_command(presentation_context_id, response)
                    .await
            }
            SubOperationRequest::Echo { message_id } => {
                EchoResponder::respond(association, presentation_context_id, message_id).await;
                Ok(())
            }
            SubOperationRequest::Unsupported { command_field } => Err(DimseError::protocol(
                format!("bad command type 0x{:04X}", command_field),
            )),
        }
    }
}

async fn abort(mut association: Box<dyn SubAssociation>) -> SubAssociationHandle {
    if let Err(e) = association.abort().await {
        debug!("Abort failed: {}", e);
    }
    SubAssociationHandle::Terminated(Termination::Failed)
}

#[async_trait]
impl SubOperationHandler for SubAssociationAcceptor {
    async fn on_sub_association(&mut self, handle: &mut SubAssociationHandle) {
        *handle = match handle.take() {
            SubAssociationHandle::Unaccepted(incoming) => self.accept(incoming).await,
            SubAssociationHandle::Accepted(association) => self.dispatch(association).await,
            terminated => terminated,
        };
        if handle.is_terminated() {
            self.phase = RetrievePhase::MoveSent;
        }
    }

    fn on_move_progress(&mut self, counters: &SubOperationCounters) {
        debug!("C-MOVE pending: {}", counters);
        self.listener.on_progress(counters);
    }
}
