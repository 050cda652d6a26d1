use anyhow::{Context, Result, bail};
use daga_net::timeout::{liveness_channels, read_message_with_timeout};
use daga_net::{
    Connection, LivenessReceivers, NodeId, NodeRepresentation, ReadOutcome, RelayProtocol,
    RistrettoSuite, SetupMessage, TcpConnection,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, Role};
use crate::net::{connect_with_retry, is_closed};

pub type Relay = RelayProtocol<RistrettoSuite, TcpStream>;

pub async fn run(config: NodeConfig) -> Result<()> {
    let mut relay = connect_trustees(&config).await?;
    relay.start_setup().await?;
    await_trustees(&mut relay, config.read_timeout).await?;

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(listen = %config.listen, "accepting clients");
    serve_clients(Arc::new(Mutex::new(relay)), listener).await
}

/// Dial every configured trustee.
pub async fn connect_trustees(config: &NodeConfig) -> Result<Relay> {
    let trustees: Vec<_> = config.peers_with_role(Role::Trustee).collect();
    if trustees.is_empty() {
        bail!("a relay needs at least one trustee peer");
    }

    let hosts = trustees.iter().map(|t| t.address.clone()).collect();
    let mut relay = Relay::new(Arc::new(RistrettoSuite), hosts);
    for peer in trustees {
        let conn = connect_with_retry(&peer.address, config.connect_retries)
            .await
            .with_context(|| format!("trustee {} ({}) unreachable", peer.id, peer.name))?;
        relay.add_trustee(NodeRepresentation::new(
            peer.id,
            Arc::new(conn),
            peer.public_key,
        ));
    }
    Ok(relay)
}

/// Collect `TRUSTEE_FINISHED_SETUP` from every trustee.
///
/// A trustee that times out or disconnects is dropped from further reads.
/// Fails once no reachable trustee is left to answer.
pub async fn await_trustees(relay: &mut Relay, timeout: Duration) -> Result<()> {
    let (notifier, mut receivers) = liveness_channels(relay.trustees.len());

    while !relay.initialized {
        let pending: Vec<(NodeId, Arc<TcpConnection>)> = relay
            .trustees
            .iter()
            .filter(|t| t.connected && !relay.trustee_public_keys.contains_key(&t.id))
            .map(|t| (t.id, Arc::clone(&t.connection)))
            .collect();
        if pending.is_empty() {
            bail!(
                "setup cannot complete: {} of {} trustees finished, the rest are unreachable",
                relay.trustee_public_keys.len(),
                relay.trustees.len()
            );
        }

        let notifier = &notifier;
        let reads = pending.iter().map(|(id, conn)| async move {
            (*id, read_message_with_timeout(*id, conn, timeout, notifier).await)
        });
        for (id, outcome) in join_all(reads).await {
            if let ReadOutcome::Data(body) = outcome {
                if let Err(err) = relay.handle_message(id, &body).await {
                    warn!(trustee = id, error = %err, "rejected trustee message");
                }
            }
        }
        reap_unresponsive(relay, &mut receivers);
    }
    Ok(())
}

fn reap_unresponsive(relay: &mut Relay, receivers: &mut LivenessReceivers) {
    let mut lost = Vec::new();
    while let Ok(id) = receivers.timed_out.try_recv() {
        lost.push(id);
    }
    while let Ok(id) = receivers.disconnected.try_recv() {
        lost.push(id);
    }
    for trustee in relay.trustees.iter_mut().filter(|t| lost.contains(&t.id)) {
        if trustee.connected {
            warn!(trustee = trustee.id, "trustee unresponsive, giving up on it");
            trustee.connected = false;
        }
    }
}

/// Serve client sessions until the listener fails.
pub async fn serve_clients(relay: Arc<Mutex<Relay>>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await.context("accept failed")?;
        let conn = match Connection::from_tcp(stream) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%addr, error = %err, "dropping client connection");
                continue;
            }
        };
        let relay = Arc::clone(&relay);
        tokio::spawn(async move {
            if let Err(err) = serve_client(relay, conn).await {
                warn!(%addr, error = %err, "client session failed");
            }
        });
    }
}

/// One client connection. The node id claimed by its first message becomes
/// the connection's identity.
///
/// A rejected message is logged and the session goes on; fatal errors end it.
async fn serve_client(relay: Arc<Mutex<Relay>>, conn: TcpConnection) -> Result<()> {
    let mut identity: Option<NodeId> = None;
    loop {
        let body = match conn.read_message().await {
            Ok(body) => body,
            Err(err) if is_closed(&err) => {
                debug!(client = ?identity, "client closed the connection");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let sender = match identity {
            Some(id) => id,
            None => {
                let message = match SetupMessage::decode(&RistrettoSuite, &body) {
                    Ok(message) => message,
                    Err(err) if err.is_fatal() => return Err(err.into()),
                    Err(err) => {
                        warn!(error = %err, "rejected first client message");
                        continue;
                    }
                };
                let claimed = message
                    .claimed_id()
                    .context("first client message carries no node id")?;
                *identity.insert(claimed)
            }
        };

        let reply = match relay.lock().await.handle_message(sender, &body).await {
            Ok(reply) => reply,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                warn!(client = sender, error = %err, "rejected client message");
                continue;
            }
        };
        if let Some(reply) = reply {
            conn.write_message(&reply).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Peer;
    use crate::keys::KeyPair;
    use crate::{client, trustee};
    use daga_net::PROTOCOL_VERSION;
    use daga_net::framing::write_message;
    use daga_net::protocol::TrusteeState;
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;

    fn node(id: NodeId, role: Role, peers: Vec<Peer>) -> NodeConfig {
        NodeConfig {
            id,
            name: format!("node-{id}"),
            role,
            listen: "127.0.0.1:0".parse().unwrap(),
            secret: None,
            read_timeout: Duration::from_secs(5),
            connect_retries: 1,
            peers,
        }
    }

    fn peer(id: NodeId, role: Role, address: SocketAddr, keys: &KeyPair) -> Peer {
        Peer {
            id,
            name: format!("node-{id}"),
            role,
            address: address.to_string(),
            public_key: keys.public,
        }
    }

    #[tokio::test]
    async fn test_setup_and_client_join_over_loopback() {
        let relay_keys = KeyPair::generate();
        let trustee_keys = [KeyPair::generate(), KeyPair::generate()];
        let client_keys = KeyPair::generate();

        let mut listeners = Vec::new();
        for _ in &trustee_keys {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let addrs: Vec<SocketAddr> = listeners.iter().map(|l| l.local_addr().unwrap()).collect();
        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();

        let trustee_peers: Vec<Peer> = (0..2)
            .map(|i| peer(i as NodeId + 1, Role::Trustee, addrs[i], &trustee_keys[i]))
            .collect();
        let relay_peer = peer(0, Role::Relay, client_addr, &relay_keys);

        let mut trustee_tasks = Vec::new();
        for (i, listener) in listeners.into_iter().enumerate() {
            let mut peers = vec![relay_peer.clone()];
            peers.extend(trustee_peers.iter().filter(|p| p.id != i as NodeId + 1).cloned());
            let config = node(i as NodeId + 1, Role::Trustee, peers);
            trustee_tasks.push(tokio::spawn(async move {
                trustee::serve(&config, listener).await
            }));
        }

        let relay_config = node(0, Role::Relay, trustee_peers);
        let mut relay = connect_trustees(&relay_config).await.unwrap();
        relay.start_setup().await.unwrap();
        await_trustees(&mut relay, relay_config.read_timeout).await.unwrap();
        assert!(relay.initialized);
        assert_eq!(relay.trustee_public_keys.len(), 2);

        let relay = Arc::new(Mutex::new(relay));
        let server = tokio::spawn(serve_clients(Arc::clone(&relay), client_listener));

        let mut client_config = node(100, Role::Client, vec![relay_peer]);
        client_config.secret = Some(client_keys.secret);
        let context = client::join(&client_config).await.unwrap();
        assert_eq!(context.trustee_keys.len(), 2);
        assert_eq!(context.client_keys, vec![client_keys.public]);

        // Tear the relay down so the trustees see their connection close.
        server.abort();
        let _ = server.await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::strong_count(&relay) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        drop(relay);

        for task in trustee_tasks {
            let trustee = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(trustee.state(), TrusteeState::SetupComplete);
            assert_eq!(trustee.trustee_commitments.len(), 2);
            assert!(trustee.rand.is_some());
            assert!(trustee.client_generators.contains_key(&100));
        }
    }

    #[tokio::test]
    async fn test_setup_fails_when_every_trustee_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let keys = KeyPair::generate();
        let config = NodeConfig {
            read_timeout: Duration::from_millis(100),
            ..node(
                0,
                Role::Relay,
                vec![peer(1, Role::Trustee, listener.local_addr().unwrap(), &keys)],
            )
        };

        let mut relay = connect_trustees(&config).await.unwrap();
        // Accepted but never answered.
        let (_silent, _) = listener.accept().await.unwrap();
        relay.start_setup().await.unwrap();

        let err = await_trustees(&mut relay, config.read_timeout)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("0 of 1 trustees finished"));
        assert!(!relay.trustees[0].connected);
    }

    /// A relay-side client session over loopback. Returns the client's end.
    async fn client_session(relay: Relay) -> (TcpStream, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let conn = Connection::from_tcp(stream).unwrap();
        let session = tokio::spawn(serve_client(Arc::new(Mutex::new(relay)), conn));
        (client, session)
    }

    #[tokio::test]
    async fn test_rejected_client_messages_keep_session_open() {
        let relay = Relay::new(Arc::new(RistrettoSuite), Vec::new());
        let (mut client, session) = client_session(relay).await;

        // An unknown setup tag, then a request the relay is not ready for.
        write_message(&mut client, &[0, 9]).await.unwrap();
        let request = SetupMessage::ClientContextReq { client_id: 100 }
            .encode(&RistrettoSuite)
            .unwrap();
        write_message(&mut client, &request).await.unwrap();
        drop(client);

        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_ends_client_session() {
        let relay = Relay::new(Arc::new(RistrettoSuite), Vec::new());
        let (mut client, session) = client_session(relay).await;

        let mut frame = (PROTOCOL_VERSION - 1).to_be_bytes().to_vec();
        frame.extend_from_slice(&[0, 0, 0, 2, 0, 3]);
        client.write_all(&frame).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("version mismatch"), "{err}");
    }

    #[tokio::test]
    async fn test_relay_without_trustees_rejected() {
        let err = connect_trustees(&node(0, Role::Relay, Vec::new()))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("at least one trustee"));
    }
}
