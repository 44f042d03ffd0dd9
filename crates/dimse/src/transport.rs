//! Association transport used by the retrieve engine
//!
//! The engine never touches sockets or PDUs itself. It drives these traits,
//! which the [`ul`](crate::ul) module implements on top of `dicom-ul` and which
//! tests implement with scripted in-memory peers.

use async_trait::async_trait;
use dicom_object::InMemDicomObject;

use crate::command::{MoveRequest, MoveResponse};
use crate::config::RemoteNode;
use crate::error::Result;
use crate::types::SubOperationCounters;

/// Opens sessions to remote archives
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish an association proposing the given abstract syntaxes
    async fn connect(
        &self,
        node: &RemoteNode,
        abstract_syntaxes: &[&str],
    ) -> Result<Box<dyn ScuAssociation>>;
}

/// An established association to the archive, used as SCU
#[async_trait]
pub trait ScuAssociation: Send {
    /// Our own AE title on this association
    fn calling_ae_title(&self) -> &str;

    /// Id of an accepted presentation context for `abstract_syntax`
    fn accepted_presentation_context(&self, abstract_syntax: &str) -> Option<u8>;

    /// Send a C-MOVE request and block until the final response arrives.
    ///
    /// Every inbound sub-association opened by the archive meanwhile is handed
    /// to `handler`, which is re-invoked until the handle is terminated.
    async fn move_user(
        &mut self,
        presentation_context_id: u8,
        request: MoveRequest,
        handler: &mut dyn SubOperationHandler,
    ) -> Result<MoveResponse>;

    /// Release the association and free the network resources
    async fn disconnect(self: Box<Self>) -> Result<()>;
}

/// Negotiation parameters for inbound sub-associations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptPolicy {
    /// Abstract syntaxes we accept
    pub abstract_syntaxes: Vec<String>,
    /// Transfer syntaxes we accept, most preferred first
    pub transfer_syntaxes: Vec<String>,
}

/// An inbound association request that has not been negotiated yet
#[async_trait]
pub trait IncomingAssociation: Send {
    /// Address of the peer, for logging
    fn peer(&self) -> String;

    /// Negotiate presentation contexts and acknowledge the association.
    ///
    /// On failure the underlying connection is dropped.
    async fn accept(self: Box<Self>, policy: &AcceptPolicy) -> Result<Box<dyn SubAssociation>>;
}

/// What the peer sent next on a sub-association
#[derive(Debug)]
pub enum Received {
    /// Nothing is waiting to be read
    Idle,
    /// A complete command set
    Command {
        presentation_context_id: u8,
        command: InMemDicomObject,
    },
    /// The peer asked to release the association
    PeerReleased,
    /// The peer aborted the association
    PeerAborted,
}

/// A data set received after a command
#[derive(Debug, Clone)]
pub struct ReceivedDataset {
    /// Transfer syntax negotiated for the presentation context
    pub transfer_syntax: String,
    pub dataset: InMemDicomObject,
}

/// An accepted inbound association on which we act as SCP
#[async_trait]
pub trait SubAssociation: Send {
    /// AE title of the peer
    fn peer_ae_title(&self) -> &str;

    /// Receive the next command, or report idleness or termination.
    ///
    /// Network transports wait for the next PDU. [`Received::Idle`] is for
    /// transports that cannot wait; [`drive_sub_association`] yields to the
    /// runtime before asking again.
    async fn receive_command(&mut self) -> Result<Received>;

    /// Receive the data set that follows a command, if one is sent
    async fn receive_dataset(&mut self, presentation_context_id: u8)
        -> Result<Option<ReceivedDataset>>;

    /// Send a response command set (no data set)
    async fn send_command(
        &mut self,
        presentation_context_id: u8,
        command: InMemDicomObject,
    ) -> Result<()>;

    /// Confirm a release requested by the peer
    async fn acknowledge_release(&mut self) -> Result<()>;

    /// Abort the association
    async fn abort(&mut self) -> Result<()>;
}

/// Lifecycle of one sub-association as seen by the transport and the handler
pub enum SubAssociationHandle {
    /// Requested by the peer, not yet negotiated
    Unaccepted(Box<dyn IncomingAssociation>),
    /// Negotiated, commands can be exchanged
    Accepted(Box<dyn SubAssociation>),
    /// Nothing left to do on this sub-association
    Terminated(Termination),
}

/// How a sub-association ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Negotiation failed, the association was dropped
    Rejected,
    /// The peer released the association
    Released,
    /// The peer aborted the association
    Aborted,
    /// We aborted the association after an error
    Failed,
}

impl SubAssociationHandle {
    pub fn is_terminated(&self) -> bool {
        matches!(self, SubAssociationHandle::Terminated(_))
    }

    /// Move the current state out, leaving the handle terminated as failed
    pub fn take(&mut self) -> SubAssociationHandle {
        std::mem::replace(self, SubAssociationHandle::Terminated(Termination::Failed))
    }
}

impl std::fmt::Debug for SubAssociationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubAssociationHandle::Unaccepted(incoming) => {
                write!(f, "Unaccepted({})", incoming.peer())
            }
            SubAssociationHandle::Accepted(association) => {
                write!(f, "Accepted({})", association.peer_ae_title())
            }
            SubAssociationHandle::Terminated(termination) => {
                write!(f, "Terminated({:?})", termination)
            }
        }
    }
}

/// Callback the transport invokes while a C-MOVE is in flight
#[async_trait]
pub trait SubOperationHandler: Send {
    /// Advance the sub-association one step
    async fn on_sub_association(&mut self, handle: &mut SubAssociationHandle);

    /// An intermediate C-MOVE response arrived
    fn on_move_progress(&mut self, _counters: &SubOperationCounters) {}
}

/// Drive a sub-association handle until it is terminated.
///
/// Transports call this for each inbound association so that one
/// sub-association is finished before the next is considered.
pub async fn drive_sub_association(
    handler: &mut dyn SubOperationHandler,
    mut handle: SubAssociationHandle,
) -> Termination {
    loop {
        if let SubAssociationHandle::Terminated(termination) = handle {
            return termination;
        }
        handler.on_sub_association(&mut handle).await;
        if let SubAssociationHandle::Accepted(_) = handle {
            // nothing was waiting: let other tasks make progress first
            tokio::task::yield_now().await;
        }
    }
}
