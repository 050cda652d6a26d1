use anyhow::{Context, Result};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::scalar::Scalar;
use daga_net::protocol::TrusteeEvent;
use daga_net::{Connection, NodeRepresentation, RistrettoSuite, TrusteeProtocol};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, Role};
use crate::net::is_closed;

pub type Trustee = TrusteeProtocol<RistrettoSuite, TcpStream>;

pub async fn run(config: NodeConfig) -> Result<()> {
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(listen = %config.listen, "waiting for the relay");
    serve(&config, listener).await?;
    Ok(())
}

/// Accept the relay's connection and follow its setup messages until it
/// hangs up.
pub async fn serve(config: &NodeConfig, listener: TcpListener) -> Result<Trustee> {
    let relay_peer = config.relay_peer()?;
    let (stream, addr) = listener.accept().await.context("accept failed")?;
    let conn = Arc::new(Connection::from_tcp(stream)?);
    info!(%addr, relay = relay_peer.id, "relay connected");

    let relay = NodeRepresentation::new(relay_peer.id, Arc::clone(&conn), relay_peer.public_key);
    let mut trustee = Trustee::new(
        Arc::new(RistrettoSuite),
        config.id,
        config.peers_with_role(Role::Trustee).map(|p| p.id),
        relay,
    );

    loop {
        let body = match conn.read_message().await {
            Ok(body) => body,
            Err(err) if is_closed(&err) => {
                info!(state = ?trustee.state(), "relay closed the connection");
                return Ok(trustee);
            }
            Err(err) => return Err(err).context("failed to read from relay"),
        };

        match trustee.handle_message(&body) {
            Ok(TrusteeEvent::SetupRequested { roster_size }) => {
                let rand = rand::random::<u64>();
                let commitment = RISTRETTO_BASEPOINT_POINT * Scalar::from(rand);
                let event = trustee.finish_setup(rand, commitment).await?;
                debug!(roster_size, ?event, "commitment sent");
            }
            Ok(event) => debug!(?event, "setup progressed"),
            Err(err) if err.is_fatal() => return Err(err).context("trustee session failed"),
            Err(err) => warn!(error = %err, "ignoring relay message"),
        }
    }
}
