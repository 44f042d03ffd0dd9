//! Transport implementation over the DICOM upper layer (`dicom-ul`)
//!
//! The archive association is an [`AsyncClientAssociation`]. The
//! sub-associations it opens back to us arrive on a [`TcpListener`] bound to
//! the configured local port; their A-ASSOCIATE-RQ is answered by
//! [`negotiation`](crate::negotiation) so that our transfer syntax preference
//! decides, and the PDUs that follow are read and written with `dicom-ul`'s
//! PDU codec.

use std::collections::VecDeque;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::{
    EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN,
};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::{read_pdu_from_wire_async, AsyncClientAssociation};
use dicom_ul::pdu::{
    AbortRQSource, PDataValue, PDataValueType, PresentationContextNegotiated,
    PresentationContextResultReason, PDU_HEADER_SIZE,
};
use dicom_ul::{write_pdu, ClientAssociationOptions, Pdu};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::command::{self, MoveRequest, MoveResponse};
use crate::config::{DimseConfig, RemoteNode};
use crate::error::{DimseError, Result};
use crate::negotiation::{self, Negotiated};
use crate::transport::{
    drive_sub_association, AcceptPolicy, Connector, IncomingAssociation, Received,
    ReceivedDataset, ScuAssociation, SubAssociation, SubAssociationHandle, SubOperationHandler,
};
use crate::types::{trim_uid, SubOperationCounters};

/// Opens archive associations with `dicom-ul`
pub struct UlConnector {
    config: DimseConfig,
}

impl UlConnector {
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for UlConnector {
    async fn connect(
        &self,
        node: &RemoteNode,
        abstract_syntaxes: &[&str],
    ) -> Result<Box<dyn ScuAssociation>> {
        // listen before asking for anything so that pushed sub-associations
        // find us
        let bind_addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(bind_addr).await?;
        debug!("Listening for sub-associations on {}", bind_addr);

        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(self.config.local_aet.clone())
            .called_ae_title(node.ae_title.clone())
            .max_pdu_length(node.max_pdu(&self.config));
        for uid in abstract_syntaxes {
            options = options.with_presentation_context(
                *uid,
                vec![
                    EXPLICIT_VR_LITTLE_ENDIAN.uid(),
                    IMPLICIT_VR_LITTLE_ENDIAN.uid(),
                ],
            );
        }

        let address = node.address();
        let timeout = node.connect_timeout(&self.config);
        let association = tokio::time::timeout(timeout, options.establish_with_async(&address))
            .await
            .map_err(|_| {
                DimseError::Timeout(format!("no association with {} after {:?}", node, timeout))
            })??;

        info!("Association established with {}", node);

        Ok(Box::new(UlScuAssociation {
            association: Some(association),
            listener,
            calling_ae_title: self.config.local_aet.clone(),
            local_max_pdu: self.config.max_pdu,
        }))
    }
}

/// Archive association plus the listener for its sub-associations
struct UlScuAssociation {
    association: Option<AsyncClientAssociation<TcpStream>>,
    listener: TcpListener,
    calling_ae_title: String,
    local_max_pdu: u32,
}

#[async_trait]
impl ScuAssociation for UlScuAssociation {
    fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    fn accepted_presentation_context(&self, abstract_syntax: &str) -> Option<u8> {
        self.association.as_ref()?.presentation_contexts().iter().find_map(|pc| {
            (pc.reason == PresentationContextResultReason::Acceptance
                && trim_uid(&pc.abstract_syntax) == abstract_syntax)
                .then_some(pc.id)
        })
    }

    async fn move_user(
        &mut self,
        presentation_context_id: u8,
        request: MoveRequest,
        handler: &mut dyn SubOperationHandler,
    ) -> Result<MoveResponse> {
        let mut association = self
            .association
            .take()
            .ok_or_else(|| DimseError::internal("association already released"))?;

        if let Err(e) = send_move_request(&mut association, presentation_context_id, &request).await
        {
            self.association = Some(association);
            return Err(e);
        }

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let message_id = request.message_id;
        let mut responses = tokio::spawn(async move {
            let result = collect_move_responses(&mut association, message_id, &progress_tx).await;
            (association, result)
        });

        let joined = loop {
            tokio::select! {
                joined = &mut responses => break joined,
                Some(counters) = progress_rx.recv() => handler.on_move_progress(&counters),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Sub-association request from {}", peer);
                        let incoming = UlIncoming {
                            stream,
                            peer,
                            ae_title: self.calling_ae_title.clone(),
                            max_pdu: self.local_max_pdu,
                        };
                        let termination = drive_sub_association(
                            handler,
                            SubAssociationHandle::Unaccepted(Box::new(incoming)),
                        )
                        .instrument(debug_span!("sub_association", peer = %peer))
                        .await;
                        debug!("Sub-association with {} ended: {:?}", peer, termination);
                    }
                    Err(e) => warn!("Could not accept sub-association: {}", e),
                },
            }
        };

        while let Ok(counters) = progress_rx.try_recv() {
            handler.on_move_progress(&counters);
        }

        let (association, result) =
            joined.map_err(|e| DimseError::internal(format!("C-MOVE response task failed: {}", e)))?;
        self.association = Some(association);
        result
    }

    async fn disconnect(mut self: Box<Self>) -> Result<()> {
        if let Some(association) = self.association.take() {
            association.release().await?;
            debug!("Association released");
        }
        Ok(())
    }
}

async fn send_move_request(
    association: &mut AsyncClientAssociation<TcpStream>,
    presentation_context_id: u8,
    request: &MoveRequest,
) -> Result<()> {
    let transfer_syntax = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == presentation_context_id)
        .map(|pc| trim_uid(&pc.transfer_syntax).to_string())
        .ok_or_else(|| {
            DimseError::protocol(format!(
                "unknown presentation context {}",
                presentation_context_id
            ))
        })?;
    let ts = TransferSyntaxRegistry.get(&transfer_syntax).ok_or_else(|| {
        DimseError::protocol(format!("unsupported transfer syntax {}", transfer_syntax))
    })?;

    let command_data = command::encode(&request.command())?;
    let mut identifier_data = Vec::new();
    request
        .identifier
        .write_dataset_with_ts(&mut identifier_data, ts)
        .map_err(|e| DimseError::DicomObject(format!("could not write identifier: {}", e)))?;

    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command_data,
            },
            PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: identifier_data,
            },
        ],
    };
    association.send(&pdu).await?;
    Ok(())
}

/// Read C-MOVE responses until the final one, forwarding pending counters
async fn collect_move_responses(
    association: &mut AsyncClientAssociation<TcpStream>,
    message_id: u16,
    progress: &mpsc::UnboundedSender<SubOperationCounters>,
) -> Result<MoveResponse> {
    let mut assembler = PdvAssembler::default();
    let mut awaiting_dataset: Option<MoveResponse> = None;

    loop {
        match association.receive().await? {
            Pdu::PData { data } => {
                for pdv in data {
                    match assembler.push(pdv) {
                        Some(Assembled::Command(_, bytes)) => {
                            let command = command::decode(&bytes)?;
                            let has_data_set = command::has_data_set(&command);
                            let response = MoveResponse::from_command(command)?;
                            if response.message_id_being_responded_to != message_id {
                                warn!(
                                    "C-MOVE-RSP for message {} while waiting for {}",
                                    response.message_id_being_responded_to, message_id
                                );
                            }

                            if response.is_pending() {
                                debug!("C-MOVE-RSP pending: {}", response.counters);
                                // the receiver is gone only once move_user returned
                                let _ = progress.send(response.counters);
                            } else if has_data_set {
                                awaiting_dataset = Some(response);
                            } else {
                                return Ok(response);
                            }
                        }
                        Some(Assembled::Data(..)) => {
                            // identifiers trailing a response carry nothing we use
                            if let Some(response) = awaiting_dataset.take() {
                                return Ok(response);
                            }
                        }
                        None => {}
                    }
                }
            }
            Pdu::AbortRQ { source } => {
                return Err(DimseError::DicomUl(format!(
                    "association aborted by the archive: {:?}",
                    source
                )));
            }
            Pdu::ReleaseRQ => {
                association.send(&Pdu::ReleaseRP).await?;
                return Err(DimseError::DicomUl(
                    "archive released the association before the final C-MOVE response".into(),
                ));
            }
            other => {
                return Err(DimseError::protocol(format!(
                    "unexpected PDU while waiting for C-MOVE-RSP: {}",
                    other.short_description()
                )));
            }
        }
    }
}

/// A complete command or data set reassembled from P-DATA fragments
#[derive(Debug, PartialEq, Eq)]
enum Assembled {
    Command(u8, Vec<u8>),
    Data(u8, Vec<u8>),
}

#[derive(Default)]
struct PdvAssembler {
    command: Vec<u8>,
    data: Vec<u8>,
}

impl PdvAssembler {
    fn push(&mut self, pdv: PDataValue) -> Option<Assembled> {
        let PDataValue {
            presentation_context_id,
            value_type,
            is_last,
            data,
        } = pdv;
        match value_type {
            PDataValueType::Command => {
                self.command.extend_from_slice(&data);
                is_last.then(|| {
                    Assembled::Command(presentation_context_id, std::mem::take(&mut self.command))
                })
            }
            PDataValueType::Data => {
                self.data.extend_from_slice(&data);
                is_last.then(|| {
                    Assembled::Data(presentation_context_id, std::mem::take(&mut self.data))
                })
            }
        }
    }
}

/// A TCP connection from the archive waiting to be negotiated
struct UlIncoming {
    stream: TcpStream,
    peer: SocketAddr,
    ae_title: String,
    max_pdu: u32,
}

#[async_trait]
impl IncomingAssociation for UlIncoming {
    fn peer(&self) -> String {
        self.peer.to_string()
    }

    async fn accept(self: Box<Self>, policy: &AcceptPolicy) -> Result<Box<dyn SubAssociation>> {
        let UlIncoming {
            mut stream,
            ae_title,
            max_pdu,
            ..
        } = *self;

        let mut read_buffer = BytesMut::with_capacity(max_pdu as usize);
        let request = match read_pdu_from_wire_async(&mut stream, &mut read_buffer, max_pdu, false)
            .await?
        {
            Pdu::AssociationRQ(request) => request,
            other => {
                return Err(DimseError::protocol(format!(
                    "expected A-ASSOCIATE-RQ, got {}",
                    other.short_description()
                )));
            }
        };

        let Negotiated {
            response,
            presentation_contexts,
            peer_ae_title,
            peer_max_pdu,
        } = match negotiation::negotiate(request, policy, &ae_title, max_pdu) {
            Ok(negotiated) => negotiated,
            Err(rejection) => {
                let reason = format!("{:?}", rejection.source);
                write_to(&mut stream, &Pdu::AssociationRJ(rejection), u32::MAX).await?;
                return Err(DimseError::AssociationRejected(reason));
            }
        };
        write_to(&mut stream, &Pdu::AssociationAC(response), u32::MAX).await?;

        debug!(
            "Accepted {} presentation contexts from {}",
            presentation_contexts
                .iter()
                .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                .count(),
            peer_ae_title
        );

        Ok(Box::new(UlSubAssociation {
            stream: Some(stream),
            read_buffer,
            local_max_pdu: max_pdu,
            peer_max_pdu,
            presentation_contexts,
            peer_ae_title,
            assembler: PdvAssembler::default(),
            pending: VecDeque::new(),
        }))
    }
}

/// Encode one PDU and put it on the wire
async fn write_to(stream: &mut TcpStream, pdu: &Pdu, peer_max_pdu: u32) -> Result<()> {
    let mut buffer = Vec::new();
    write_pdu(&mut buffer, pdu)
        .map_err(|e| DimseError::DicomUl(format!("could not encode PDU: {}", e)))?;
    if buffer.len() as u64 > u64::from(peer_max_pdu) + u64::from(PDU_HEADER_SIZE) {
        return Err(DimseError::protocol(format!(
            "PDU of {} bytes exceeds the peer maximum of {}",
            buffer.len(),
            peer_max_pdu
        )));
    }
    stream.write_all(&buffer).await?;
    Ok(())
}

/// An accepted sub-association on which the archive pushes objects
struct UlSubAssociation {
    /// `None` once released or aborted
    stream: Option<TcpStream>,
    read_buffer: BytesMut,
    local_max_pdu: u32,
    peer_max_pdu: u32,
    presentation_contexts: Vec<PresentationContextNegotiated>,
    peer_ae_title: String,
    assembler: PdvAssembler,
    pending: VecDeque<Assembled>,
}

/// What the next PDU turned out to be, when it is not P-DATA
enum Interrupt {
    Released,
    Aborted,
}

impl UlSubAssociation {
    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| DimseError::internal("sub-association already closed"))
    }

    async fn send(&mut self, pdu: &Pdu) -> Result<()> {
        let peer_max_pdu = self.peer_max_pdu;
        write_to(self.stream()?, pdu, peer_max_pdu).await
    }

    async fn receive(&mut self) -> Result<Pdu> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DimseError::internal("sub-association already closed"))?;
        Ok(read_pdu_from_wire_async(stream, &mut self.read_buffer, self.local_max_pdu, false).await?)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Could not shut down sub-association socket: {}", e);
            }
        }
    }

    /// Read one PDU, queueing whatever P-DATA values it completes
    async fn fill(&mut self) -> Result<Option<Interrupt>> {
        match self.receive().await? {
            Pdu::PData { data } => {
                for pdv in data {
                    if let Some(assembled) = self.assembler.push(pdv) {
                        self.pending.push_back(assembled);
                    }
                }
                Ok(None)
            }
            Pdu::ReleaseRQ => Ok(Some(Interrupt::Released)),
            Pdu::AbortRQ { source } => {
                debug!("Abort source: {:?}", source);
                Ok(Some(Interrupt::Aborted))
            }
            other => Err(DimseError::protocol(format!(
                "unexpected PDU on sub-association: {}",
                other.short_description()
            ))),
        }
    }

    fn transfer_syntax_of(&self, presentation_context_id: u8) -> Result<String> {
        self.presentation_contexts
            .iter()
            .find(|pc| {
                pc.id == presentation_context_id
                    && pc.reason == PresentationContextResultReason::Acceptance
            })
            .map(|pc| trim_uid(&pc.transfer_syntax).to_string())
            .ok_or_else(|| {
                DimseError::protocol(format!(
                    "presentation context {} was not accepted",
                    presentation_context_id
                ))
            })
    }
}

#[async_trait]
impl SubAssociation for UlSubAssociation {
    fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    async fn receive_command(&mut self) -> Result<Received> {
        loop {
            match self.pending.pop_front() {
                Some(Assembled::Command(presentation_context_id, bytes)) => {
                    return Ok(Received::Command {
                        presentation_context_id,
                        command: command::decode(&bytes)?,
                    });
                }
                Some(Assembled::Data(presentation_context_id, _)) => {
                    warn!(
                        "Discarding data set on context {} without a command",
                        presentation_context_id
                    );
                }
                None => match self.fill().await? {
                    None => {}
                    Some(Interrupt::Released) => return Ok(Received::PeerReleased),
                    Some(Interrupt::Aborted) => {
                        self.close().await;
                        return Ok(Received::PeerAborted);
                    }
                },
            }
        }
    }

    async fn receive_dataset(
        &mut self,
        presentation_context_id: u8,
    ) -> Result<Option<ReceivedDataset>> {
        loop {
            match self.pending.front() {
                Some(Assembled::Data(..)) => break,
                // the command said a data set follows but another command came
                Some(Assembled::Command(..)) => return Ok(None),
                None => {
                    if self.fill().await?.is_some() {
                        return Err(DimseError::DicomUl(
                            "association ended during data set transfer".into(),
                        ));
                    }
                }
            }
        }

        let Some(Assembled::Data(data_pc_id, bytes)) = self.pending.pop_front() else {
            return Ok(None);
        };
        if data_pc_id != presentation_context_id {
            warn!(
                "Data set on context {} follows a command on context {}",
                data_pc_id, presentation_context_id
            );
        }

        let transfer_syntax = self.transfer_syntax_of(data_pc_id)?;
        let ts = TransferSyntaxRegistry.get(&transfer_syntax).ok_or_else(|| {
            DimseError::protocol(format!("unsupported transfer syntax {}", transfer_syntax))
        })?;
        let dataset = InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), ts)
            .map_err(|e| DimseError::DicomObject(format!("failed to read data set: {}", e)))?;

        Ok(Some(ReceivedDataset {
            transfer_syntax,
            dataset,
        }))
    }

    async fn send_command(
        &mut self,
        presentation_context_id: u8,
        command: InMemDicomObject,
    ) -> Result<()> {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command::encode(&command)?,
            }],
        };
        self.send(&pdu).await
    }

    async fn acknowledge_release(&mut self) -> Result<()> {
        self.send(&Pdu::ReleaseRP).await?;
        self.close().await;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        let result = self
            .send(&Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser,
            })
            .await;
        self.close().await;
        result
    }
}
