//! Service Class User side of a retrieve: the C-MOVE initiator

use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::command::{self, status, MoveRequest, MoveResponse};
use crate::config::{DimseConfig, RemoteNode};
use crate::error::Result;
use crate::scp::{RetrieveListener, SubAssociationAcceptor};
use crate::storage::CacheRoot;
use crate::transport::{Connector, ScuAssociation};
use crate::types::{MoveQuery, RetrieveOutcome, RetrievePhase};

/// DIMSE Service Class User that retrieves objects from one archive
pub struct DimseScu {
    config: DimseConfig,
    node: RemoteNode,
    connector: Arc<dyn Connector>,
    cache_root: Arc<dyn CacheRoot>,
    listener: Arc<dyn RetrieveListener>,
}

/// An open association to the archive, alive for one retrieve
struct Session {
    association: Box<dyn ScuAssociation>,
    last_message_id: u16,
    phase: RetrievePhase,
}

impl Session {
    fn new(association: Box<dyn ScuAssociation>) -> Self {
        Self {
            association,
            last_message_id: 0,
            phase: RetrievePhase::Connecting,
        }
    }

    fn next_message_id(&mut self) -> u16 {
        // 0 is never handed out
        self.last_message_id = self.last_message_id.checked_add(1).unwrap_or(1);
        self.last_message_id
    }

    fn enter(&mut self, phase: RetrievePhase) {
        debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    async fn close(mut self) {
        self.enter(RetrievePhase::Terminating);
        if let Err(e) = self.association.disconnect().await {
            warn!("Error while releasing the association: {}", e);
        }
    }
}

impl DimseScu {
    /// Create a new SCU for `node`
    pub fn new(
        config: DimseConfig,
        node: RemoteNode,
        connector: Arc<dyn Connector>,
        cache_root: Arc<dyn CacheRoot>,
        listener: Arc<dyn RetrieveListener>,
    ) -> Self {
        Self {
            config,
            node,
            connector,
            cache_root,
            listener,
        }
    }

    pub fn node(&self) -> &RemoteNode {
        &self.node
    }

    /// Ask the archive to push everything matching `query` to us and receive
    /// it into the cache.
    ///
    /// The association is always released before returning.
    pub async fn retrieve(&self, query: &MoveQuery) -> RetrieveOutcome {
        let span = info_span!(
            "retrieve",
            archive = %self.node.ae_title,
            host = %self.node.host,
            port = self.node.retrieve_service_port()
        );
        self.retrieve_inner(query).instrument(span).await
    }

    async fn retrieve_inner(&self, query: &MoveQuery) -> RetrieveOutcome {
        if let Err(e) = self.config.validate().and_then(|_| self.node.validate()) {
            error!("Not retrieving from {}: {}", self.node, e);
            return RetrieveOutcome::ConnectionError(e.to_string());
        }

        let identifier = match query.to_identifier() {
            Ok(identifier) => identifier,
            Err(e) => {
                error!("Invalid retrieve query: {}", e);
                return RetrieveOutcome::ProtocolError(e.to_string());
            }
        };

        info!(
            "Sending C-MOVE to {} (level: {})",
            self.node, query.query_level
        );
        debug!("C-MOVE query parameters: {:?}", query.parameters);

        let association = match self
            .connector
            .connect(&self.node, &[command::STUDY_ROOT_MOVE])
            .await
        {
            Ok(association) => association,
            Err(e) => {
                error!(
                    "Could not connect to PACS {} at {}: {}",
                    self.node.ae_title,
                    self.node.address(),
                    e
                );
                return RetrieveOutcome::ConnectionError(e.to_string());
            }
        };

        let mut session = Session::new(association);
        let outcome = self.run_move(&mut session, query, identifier).await;
        session.close().await;

        info!("Retrieve from {} finished: {}", self.node, outcome);
        outcome
    }

    async fn run_move(
        &self,
        session: &mut Session,
        query: &MoveQuery,
        identifier: dicom_object::InMemDicomObject,
    ) -> RetrieveOutcome {
        let Some(pc_id) = session
            .association
            .accepted_presentation_context(command::STUDY_ROOT_MOVE)
        else {
            error!(
                "{} accepted no presentation context for Study Root MOVE",
                self.node
            );
            return RetrieveOutcome::ProtocolError(
                "no valid presentation context for Study Root Query/Retrieve MOVE".into(),
            );
        };

        let request = MoveRequest {
            message_id: session.next_message_id(),
            affected_sop_class_uid: command::STUDY_ROOT_MOVE.to_string(),
            priority: query.priority,
            move_destination: session.association.calling_ae_title().to_string(),
            identifier,
        };
        debug!(
            "C-MOVE-RQ message id {} destination {}",
            request.message_id, request.move_destination
        );

        let mut acceptor = SubAssociationAcceptor::new(
            &self.config,
            Arc::clone(&self.cache_root),
            Arc::clone(&self.listener),
        );

        session.enter(RetrievePhase::MoveSent);
        let response = session
            .association
            .move_user(pc_id, request, &mut acceptor)
            .await;

        outcome_of(response)
    }
}

fn outcome_of(response: Result<MoveResponse>) -> RetrieveOutcome {
    match response {
        Ok(response) if response.status == status::SUCCESS => RetrieveOutcome::Success,
        Ok(response) => crate::status::translate(
            response.status,
            response.counters,
            response.status_detail.as_ref(),
        ),
        Err(e) if e.is_transport() => {
            error!("Network failure during C-MOVE: {}", e);
            RetrieveOutcome::ConnectionError(e.to_string())
        }
        Err(e) => {
            error!("C-MOVE failed: {}", e);
            RetrieveOutcome::ProtocolError(e.to_string())
        }
    }
}
