use anyhow::{Context, Result};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use daga_net::marshal::AuthContext;
use daga_net::timeout::{liveness_channels, read_message_with_timeout};
use daga_net::{RistrettoSuite, SetupMessage};
use std::sync::Arc;
use tracing::info;

use crate::config::NodeConfig;
use crate::keys::{KeyPair, random_scalar};
use crate::net::connect_with_retry;

pub async fn run(config: NodeConfig) -> Result<()> {
    let context = join(&config).await?;
    info!(
        trustees = context.trustee_keys.len(),
        clients = context.client_keys.len(),
        "received authentication context"
    );
    Ok(())
}

/// Announce this client to the relay and fetch the authentication context.
pub async fn join(config: &NodeConfig) -> Result<AuthContext<RistrettoPoint>> {
    let secret = config.secret.context("clients need a private_key")?;
    let keys = KeyPair::from_secret(secret);
    let relay = config.relay_peer()?;
    let conn = Arc::new(connect_with_retry(&relay.address, config.connect_retries).await?);

    let joining = SetupMessage::ClientJoining {
        client_id: config.id,
        public_key: keys.public,
        generator: RISTRETTO_BASEPOINT_POINT * random_scalar(),
    };
    conn.write_message(&joining.encode(&RistrettoSuite)?).await?;
    info!(client = config.id, "joined");

    let request = SetupMessage::ClientContextReq {
        client_id: config.id,
    };
    conn.write_message(&request.encode(&RistrettoSuite)?).await?;

    let (notifier, _receivers) = liveness_channels(1);
    let body = read_message_with_timeout(relay.id, &conn, config.read_timeout, &notifier)
        .await
        .into_data()
        .context("relay did not answer the context request")?;
    Ok(AuthContext::decode(&RistrettoSuite, &body)?)
}
