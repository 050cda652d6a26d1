use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::ProtocolError;
use crate::connection::{NodeId, NodeRepresentation};
use crate::fanout::broadcast_to_connected_nodes;
use crate::marshal::{AuthContext, marshal_node_public_keys};
use crate::message::{SetupMessage, SetupTag};
use crate::suite::Suite;

/// Where the relay stands in the setup handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Created,
    AwaitingTrusteeSetup,
    TrusteesReady,
    AcceptingClients,
}

impl RelayState {
    fn name(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::AwaitingTrusteeSetup => "AwaitingTrusteeSetup",
            Self::TrusteesReady => "TrusteesReady",
            Self::AcceptingClients => "AcceptingClients",
        }
    }
}

/// Relay-side session state for one authentication context.
///
/// Created fresh for every context. `initialized` turns true only once every
/// trustee has reported `TRUSTEE_FINISHED_SETUP`.
pub struct RelayProtocol<S: Suite, C> {
    suite: Arc<S>,
    state: RelayState,
    pub initialized: bool,
    pub trustee_hosts: Vec<String>,
    pub trustees: Vec<NodeRepresentation<C, S::Point>>,
    pub client_public_keys: BTreeMap<NodeId, S::Point>,
    pub trustee_public_keys: BTreeMap<NodeId, S::Point>,
}

impl<S, C> RelayProtocol<S, C>
where
    S: Suite,
    C: AsyncRead + AsyncWrite + Send,
{
    pub fn new(suite: Arc<S>, trustee_hosts: Vec<String>) -> Self {
        Self {
            suite,
            state: RelayState::Created,
            initialized: false,
            trustee_hosts,
            trustees: Vec::new(),
            client_public_keys: BTreeMap::new(),
            trustee_public_keys: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn add_trustee(&mut self, trustee: NodeRepresentation<C, S::Point>) {
        debug!(trustee = trustee.id, "trustee registered");
        self.trustees.push(trustee);
    }

    fn trustee_index(&self, id: NodeId) -> Option<usize> {
        self.trustees.iter().position(|t| t.id == id)
    }

    fn unexpected(&self, message: &SetupMessage<S::Point>) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            state: self.state.name(),
            tag: message.tag(),
        }
    }

    /// Send `TRUSTEE_SETUP` with the trustee roster to every connected trustee.
    ///
    /// Trustees that cannot be reached are flagged disconnected; the relay
    /// then waits on the others.
    pub async fn start_setup(&mut self) -> Result<(), ProtocolError> {
        if self.state != RelayState::Created {
            return Err(ProtocolError::UnexpectedMessage {
                state: self.state.name(),
                tag: SetupTag::TrusteeSetup,
            });
        }
        let mut message = (SetupTag::TrusteeSetup as u16).to_be_bytes().to_vec();
        message.extend(marshal_node_public_keys(&*self.suite, &self.trustees)?);

        broadcast_to_connected_nodes(&mut self.trustees, &message).await;
        self.state = RelayState::AwaitingTrusteeSetup;
        info!(trustees = self.trustees.len(), "trustee setup dispatched");
        Ok(())
    }

    /// Trustees that have not yet reported a commitment.
    pub fn pending_trustees(&self) -> Vec<NodeId> {
        self.trustees
            .iter()
            .map(|t| t.id)
            .filter(|id| !self.trustee_public_keys.contains_key(id))
            .collect()
    }

    /// Handle one frame body received from node `sender`.
    ///
    /// Returns the reply to send back to the sender, if any.
    pub async fn handle_message(
        &mut self,
        sender: NodeId,
        body: &[u8],
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let message = SetupMessage::decode(&*self.suite, body)?;
        debug!(sender, tag = %message.tag(), "relay received setup message");

        if let Some(claimed) = message.claimed_id() {
            if claimed != sender {
                return Err(ProtocolError::SenderMismatch { sender, claimed });
            }
        }

        match message {
            SetupMessage::TrusteeFinishedSetup {
                trustee_id,
                ref commitment,
            } => {
                if self.state != RelayState::AwaitingTrusteeSetup {
                    return Err(self.unexpected(&message));
                }
                if self.trustee_index(trustee_id).is_none() {
                    return Err(ProtocolError::UnknownTrustee(trustee_id));
                }
                if self.trustee_public_keys.contains_key(&trustee_id) {
                    return Err(ProtocolError::DuplicateCommitment(trustee_id));
                }
                self.trustee_public_keys
                    .insert(trustee_id, commitment.clone());

                // Every trustee learns every commitment through the relay.
                broadcast_to_connected_nodes(&mut self.trustees, body).await;

                if self.trustee_public_keys.len() == self.trustees.len() {
                    self.initialized = true;
                    self.state = RelayState::TrusteesReady;
                    info!("all trustees finished setup");
                }
                Ok(None)
            }
            SetupMessage::ClientJoining {
                client_id,
                ref public_key,
                ..
            } => {
                if !self.initialized {
                    return Err(ProtocolError::NotReady);
                }
                self.client_public_keys
                    .insert(client_id, public_key.clone());
                self.state = RelayState::AcceptingClients;
                broadcast_to_connected_nodes(&mut self.trustees, body).await;
                info!(client = client_id, "client joined");
                Ok(None)
            }
            SetupMessage::ClientContextReq { client_id } => {
                if !self.initialized {
                    return Err(ProtocolError::NotReady);
                }
                debug!(client = client_id, "serving authentication context");
                let context = AuthContext {
                    trustee_keys: self.trustee_public_keys.values().cloned().collect(),
                    client_keys: self.client_public_keys.values().cloned().collect(),
                };
                Ok(Some(context.encode(&*self.suite)?))
            }
            SetupMessage::TrusteeSetup { .. } => Err(self.unexpected(&message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;

    use super::*;
    use crate::connection::Connection;
    use crate::framing::read_message;
    use crate::suite::RistrettoSuite;
    use crate::suite::test_points::point;

    type Relay = RelayProtocol<RistrettoSuite, DuplexStream>;

    /// A relay with `n` trustees (ids 1..=n). Returns the trustees' ends.
    fn relay_with_trustees(n: u32) -> (Relay, Vec<DuplexStream>) {
        let mut relay = Relay::new(
            Arc::new(RistrettoSuite),
            (1..=n).map(|i| format!("127.0.0.1:{}", 9000 + i)).collect(),
        );
        let mut far_ends = Vec::new();
        for id in 1..=n {
            let (near, far) = tokio::io::duplex(64 * 1024);
            relay.add_trustee(NodeRepresentation::new(
                id,
                Arc::new(Connection::new(near)),
                point(u64::from(id)),
            ));
            far_ends.push(far);
        }
        (relay, far_ends)
    }

    fn finished(id: u32, commitment: u64) -> Vec<u8> {
        SetupMessage::TrusteeFinishedSetup {
            trustee_id: id,
            commitment: point(commitment),
        }
        .encode(&RistrettoSuite)
        .unwrap()
    }

    fn joining(id: u32) -> Vec<u8> {
        SetupMessage::ClientJoining {
            client_id: id,
            public_key: point(500 + u64::from(id)),
            generator: point(600 + u64::from(id)),
        }
        .encode(&RistrettoSuite)
        .unwrap()
    }

    #[tokio::test]
    async fn setup_dispatch_reaches_every_trustee() {
        let (mut relay, mut far_ends) = relay_with_trustees(2);
        relay.start_setup().await.unwrap();
        assert_eq!(relay.state(), RelayState::AwaitingTrusteeSetup);

        for far in &mut far_ends {
            let body = read_message(far).await.unwrap();
            let message = SetupMessage::decode(&RistrettoSuite, &body).unwrap();
            assert_eq!(
                message,
                SetupMessage::TrusteeSetup {
                    trustee_keys: vec![point(1), point(2)]
                }
            );
        }
    }

    #[tokio::test]
    async fn setup_dispatch_matches_encoded_message() {
        let (mut relay, mut far_ends) = relay_with_trustees(3);
        relay.start_setup().await.unwrap();
        let expected = SetupMessage::TrusteeSetup {
            trustee_keys: vec![point(1), point(2), point(3)],
        }
        .encode(&RistrettoSuite)
        .unwrap();
        assert_eq!(read_message(&mut far_ends[2]).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn initialized_only_after_all_trustees() {
        let (mut relay, _far_ends) = relay_with_trustees(2);
        relay.start_setup().await.unwrap();

        relay.handle_message(1, &finished(1, 11)).await.unwrap();
        assert!(!relay.initialized);
        assert_eq!(relay.pending_trustees(), vec![2]);

        relay.handle_message(2, &finished(2, 22)).await.unwrap();
        assert!(relay.initialized);
        assert_eq!(relay.state(), RelayState::TrusteesReady);
        assert_eq!(relay.trustee_public_keys[&2], point(22));
    }

    #[tokio::test]
    async fn commitments_are_forwarded_to_trustees() {
        let (mut relay, mut far_ends) = relay_with_trustees(2);
        relay.start_setup().await.unwrap();
        relay.handle_message(1, &finished(1, 11)).await.unwrap();

        let far = &mut far_ends[1];
        let _setup = read_message(far).await.unwrap();
        let forwarded = read_message(far).await.unwrap();
        assert_eq!(forwarded, finished(1, 11));
    }

    #[tokio::test]
    async fn clients_rejected_before_setup_completes() {
        let (mut relay, _far_ends) = relay_with_trustees(1);
        relay.start_setup().await.unwrap();
        let err = relay.handle_message(100, &joining(100)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::NotReady));
    }

    #[tokio::test]
    async fn client_join_and_context_request() {
        let (mut relay, _far_ends) = relay_with_trustees(2);
        relay.start_setup().await.unwrap();
        relay.handle_message(1, &finished(1, 11)).await.unwrap();
        relay.handle_message(2, &finished(2, 22)).await.unwrap();

        assert!(relay.handle_message(100, &joining(100)).await.unwrap().is_none());
        assert_eq!(relay.state(), RelayState::AcceptingClients);

        let request = SetupMessage::ClientContextReq { client_id: 100 }
            .encode(&RistrettoSuite)
            .unwrap();
        let reply = relay.handle_message(100, &request).await.unwrap().unwrap();
        let context = AuthContext::decode(&RistrettoSuite, &reply).unwrap();
        assert_eq!(context.trustee_keys, vec![point(11), point(22)]);
        assert_eq!(context.client_keys, vec![point(600)]);
    }

    #[tokio::test]
    async fn unknown_or_impersonating_trustee() {
        let (mut relay, _far_ends) = relay_with_trustees(2);
        relay.start_setup().await.unwrap();

        let err = relay.handle_message(9, &finished(9, 1)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTrustee(9)));

        let err = relay.handle_message(1, &finished(2, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::SenderMismatch {
                sender: 1,
                claimed: 2
            }
        ));
        assert!(relay.trustee_public_keys.is_empty());
    }

    #[tokio::test]
    async fn repeated_commitment_is_rejected() {
        let (mut relay, mut far_ends) = relay_with_trustees(2);
        relay.start_setup().await.unwrap();
        relay.handle_message(1, &finished(1, 11)).await.unwrap();

        let err = relay.handle_message(1, &finished(1, 99)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateCommitment(1)));
        assert_eq!(relay.trustee_public_keys[&1], point(11));
        assert!(!relay.initialized);

        // Only the first commitment was forwarded.
        relay.handle_message(2, &finished(2, 22)).await.unwrap();
        let far = &mut far_ends[1];
        let _setup = read_message(far).await.unwrap();
        assert_eq!(read_message(far).await.unwrap(), finished(1, 11));
        assert_eq!(read_message(far).await.unwrap(), finished(2, 22));
    }

    #[tokio::test]
    async fn client_cannot_speak_for_another() {
        let (mut relay, _far_ends) = relay_with_trustees(1);
        relay.start_setup().await.unwrap();
        relay.handle_message(1, &finished(1, 11)).await.unwrap();

        let err = relay.handle_message(101, &joining(100)).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::SenderMismatch {
                sender: 101,
                claimed: 100
            }
        ));
        assert!(relay.client_public_keys.is_empty());
    }

    #[tokio::test]
    async fn finished_before_dispatch_is_unexpected() {
        let (mut relay, _far_ends) = relay_with_trustees(1);
        let err = relay.handle_message(1, &finished(1, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedMessage {
                state: "Created",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_trustee_is_flagged_not_fatal() {
        let (mut relay, mut far_ends) = relay_with_trustees(2);
        drop(far_ends.remove(0));
        relay.start_setup().await.unwrap();
        assert!(!relay.trustees[0].connected);
        assert!(relay.trustees[1].connected);
    }
}
