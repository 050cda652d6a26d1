use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::ProtocolError;
use crate::connection::{NodeId, NodeRepresentation};
use crate::fanout::broadcast_to_connected_nodes;
use crate::message::{SetupMessage, SetupTag};
use crate::suite::Suite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrusteeState {
    Idle,
    SetupInProgress,
    SetupComplete,
}

impl TrusteeState {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::SetupInProgress => "SetupInProgress",
            Self::SetupComplete => "SetupComplete",
        }
    }
}

/// What a handled message changed, for the driver loop to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrusteeEvent {
    /// The relay asked for setup; the driver should pick r_j and call
    /// [`TrusteeProtocol::finish_setup`].
    SetupRequested { roster_size: usize },
    CommitmentRecorded { trustee_id: NodeId },
    /// Every trustee's commitment is now known.
    SetupComplete,
    ClientRegistered { client_id: NodeId },
}

/// Trustee-side session state.
pub struct TrusteeProtocol<S: Suite, C> {
    suite: Arc<S>,
    state: TrusteeState,
    pub trustee_id: NodeId,
    /// Ids of every trustee in the context, this one included.
    pub trustee_ids: BTreeSet<NodeId>,
    /// Direct connections to other trustees, if any.
    pub trustees: Vec<NodeRepresentation<C, S::Point>>,
    pub relay: NodeRepresentation<C, S::Point>,
    pub public_key_roster: Vec<S::Point>,
    pub rand: Option<u64>,
    pub client_generators: BTreeMap<NodeId, S::Point>,
    pub client_public_keys: BTreeMap<NodeId, S::Point>,
    pub trustee_commitments: BTreeMap<NodeId, S::Point>,
}

impl<S, C> TrusteeProtocol<S, C>
where
    S: Suite,
    C: AsyncRead + AsyncWrite + Send,
{
    pub fn new(
        suite: Arc<S>,
        trustee_id: NodeId,
        trustee_ids: impl IntoIterator<Item = NodeId>,
        relay: NodeRepresentation<C, S::Point>,
    ) -> Self {
        let mut trustee_ids: BTreeSet<NodeId> = trustee_ids.into_iter().collect();
        trustee_ids.insert(trustee_id);
        Self {
            suite,
            state: TrusteeState::Idle,
            trustee_id,
            trustee_ids,
            trustees: Vec::new(),
            relay,
            public_key_roster: Vec::new(),
            rand: None,
            client_generators: BTreeMap::new(),
            client_public_keys: BTreeMap::new(),
            trustee_commitments: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> TrusteeState {
        self.state
    }

    pub fn add_peer(&mut self, peer: NodeRepresentation<C, S::Point>) {
        self.trustees.push(peer);
    }

    fn unexpected(&self, tag: SetupTag) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            state: self.state.name(),
            tag,
        }
    }

    /// Record a commitment and report whether setup just completed.
    fn record_commitment(&mut self, trustee_id: NodeId, commitment: S::Point) -> TrusteeEvent {
        self.trustee_commitments.insert(trustee_id, commitment);
        let complete = self
            .trustee_ids
            .iter()
            .all(|id| self.trustee_commitments.contains_key(id));
        if complete && self.state == TrusteeState::SetupInProgress && self.rand.is_some() {
            self.state = TrusteeState::SetupComplete;
            info!(trustee = self.trustee_id, "setup complete");
            return TrusteeEvent::SetupComplete;
        }
        TrusteeEvent::CommitmentRecorded { trustee_id }
    }

    /// Handle one frame body received from the relay.
    pub fn handle_message(&mut self, body: &[u8]) -> Result<TrusteeEvent, ProtocolError> {
        let message = SetupMessage::decode(&*self.suite, body)?;
        let tag = message.tag();
        debug!(trustee = self.trustee_id, %tag, "trustee received setup message");

        match message {
            SetupMessage::TrusteeSetup { trustee_keys } => {
                if self.state != TrusteeState::Idle {
                    return Err(self.unexpected(tag));
                }
                if trustee_keys.len() != self.trustee_ids.len() {
                    warn!(
                        roster = trustee_keys.len(),
                        configured = self.trustee_ids.len(),
                        "trustee roster size differs from configuration"
                    );
                }
                let roster_size = trustee_keys.len();
                self.public_key_roster = trustee_keys;
                self.state = TrusteeState::SetupInProgress;
                info!(trustee = self.trustee_id, roster_size, "setup started");
                Ok(TrusteeEvent::SetupRequested { roster_size })
            }
            SetupMessage::TrusteeFinishedSetup {
                trustee_id,
                commitment,
            } => {
                if self.state == TrusteeState::Idle {
                    return Err(self.unexpected(tag));
                }
                if !self.trustee_ids.contains(&trustee_id) {
                    return Err(ProtocolError::UnknownTrustee(trustee_id));
                }
                if trustee_id == self.trustee_id {
                    // Our own commitment echoed back by the relay.
                    debug!(trustee = self.trustee_id, "own commitment echoed");
                }
                Ok(self.record_commitment(trustee_id, commitment))
            }
            SetupMessage::ClientJoining {
                client_id,
                public_key,
                generator,
            } => {
                if self.state != TrusteeState::SetupComplete {
                    return Err(ProtocolError::NotReady);
                }
                self.client_generators.insert(client_id, generator);
                self.client_public_keys.insert(client_id, public_key);
                debug!(trustee = self.trustee_id, client = client_id, "client generator recorded");
                Ok(TrusteeEvent::ClientRegistered { client_id })
            }
            SetupMessage::ClientContextReq { .. } => Err(self.unexpected(tag)),
        }
    }

    /// Store r_j and report this trustee's commitment to the relay.
    ///
    /// Peers with a direct connection get the same message best-effort. A
    /// failed write to the relay flags it disconnected and is returned.
    pub async fn finish_setup(
        &mut self,
        rand: u64,
        commitment: S::Point,
    ) -> Result<TrusteeEvent, ProtocolError> {
        if self.state != TrusteeState::SetupInProgress {
            return Err(self.unexpected(SetupTag::TrusteeFinishedSetup));
        }
        if !self.relay.connected {
            return Err(ProtocolError::RelayDisconnected);
        }
        let message = SetupMessage::TrusteeFinishedSetup {
            trustee_id: self.trustee_id,
            commitment: commitment.clone(),
        }
        .encode(&*self.suite)?;

        if let Err(err) = self.relay.connection.write_message(&message).await {
            warn!(trustee = self.trustee_id, error = %err, "relay unreachable, marking disconnected");
            self.relay.connected = false;
            return Err(err.into());
        }
        broadcast_to_connected_nodes(&mut self.trustees, &message).await;

        self.rand = Some(rand);
        Ok(self.record_commitment(self.trustee_id, commitment))
    }
}
