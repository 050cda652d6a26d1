//! Role state for the DAGA setup handshake.
//!
//! - `relay`: [`RelayProtocol`], dispatches setup, collects trustee
//!   commitments, admits clients
//! - `trustee`: [`TrusteeProtocol`], answers setup, collects peer
//!   commitments and client generators

mod relay;
mod trustee;

pub use relay::{RelayProtocol, RelayState};
pub use trustee::{TrusteeEvent, TrusteeProtocol, TrusteeState};

use crate::connection::NodeId;
use crate::error::NetError;
use crate::message::SetupTag;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error("{tag} not expected in state {state}")]
    UnexpectedMessage { state: &'static str, tag: SetupTag },

    #[error("unknown trustee: {0}")]
    UnknownTrustee(NodeId),

    #[error("node {sender} sent a message on behalf of node {claimed}")]
    SenderMismatch { sender: NodeId, claimed: NodeId },

    #[error("trustee {0} already reported a commitment")]
    DuplicateCommitment(NodeId),

    #[error("trustees have not finished setup")]
    NotReady,

    #[error("relay connection lost")]
    RelayDisconnected,
}

impl ProtocolError {
    /// Whether the session with the peer should end. Rejected messages leave
    /// the connection usable; transport failures and lost relays do not.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Net(err) => err.is_fatal(),
            Self::RelayDisconnected => true,
            _ => false,
        }
    }
}
