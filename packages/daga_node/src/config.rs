use anyhow::{Context, Result, bail};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use daga_net::{NodeId, RistrettoSuite};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::keys;

// =============================================================================
// Node config (figment-deserialized from the config file / env vars)
// =============================================================================
//
//   node.toml:   [timeouts]
//                read_ms = 2000
//
//   env var:     DAGA_TIMEOUTS__READ_MS=2000   (double underscore = nesting)

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Relay,
    Trustee,
    Client,
}

/// The config file as written, before keys and addresses are parsed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    pub id: NodeId,
    #[serde(default = "default_name")]
    pub name: String,
    pub role: Role,
    #[serde(default = "default_suite")]
    pub suite: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base64url scalar. Clients need one; relays and trustees may omit it.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutsFileConfig,
    #[serde(default)]
    pub peers: Vec<PeerFileConfig>,
}

/// Lives under `[timeouts]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutsFileConfig {
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

impl Default for TimeoutsFileConfig {
    fn default() -> Self {
        Self {
            read_ms: default_read_ms(),
            connect_retries: default_connect_retries(),
        }
    }
}

/// One `[[peers]]` entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerFileConfig {
    pub id: NodeId,
    #[serde(default)]
    pub name: Option<String>,
    pub role: Role,
    pub address: String,
    pub public_key: String,
}

fn default_name() -> String {
    "daga-node".to_string()
}

fn default_suite() -> String {
    RistrettoSuite::NAME.to_string()
}

fn default_listen() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_read_ms() -> u64 {
    5000
}

fn default_connect_retries() -> u32 {
    3
}

/// Layer the config file under `DAGA_*` env vars.
///
/// Env vars use double-underscore for nesting:
///   `DAGA_TIMEOUTS__READ_MS=100`  →  `timeouts.read_ms = 100`
pub fn load_config(path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Toml},
    };

    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("DAGA_").split("__"))
}

// =============================================================================
// Runtime config
// =============================================================================

#[derive(Clone, Debug)]
pub struct Peer {
    pub id: NodeId,
    pub name: String,
    pub role: Role,
    pub address: String,
    pub public_key: RistrettoPoint,
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub id: NodeId,
    pub name: String,
    pub role: Role,
    pub listen: SocketAddr,
    pub secret: Option<Scalar>,
    pub read_timeout: Duration,
    pub connect_retries: u32,
    pub peers: Vec<Peer>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("config file {} not found", path.display());
        }
        let file: FileConfig = load_config(path)
            .extract()
            .with_context(|| format!("failed to load config from {}", path.display()))?;
        Self::from_file(file)
    }

    pub fn from_file(file: FileConfig) -> Result<Self> {
        if file.suite != RistrettoSuite::NAME {
            bail!(
                "unsupported suite {:?} (only {} is available)",
                file.suite,
                RistrettoSuite::NAME
            );
        }
        let listen: SocketAddr = file
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {:?}", file.listen))?;
        let secret = file
            .private_key
            .as_deref()
            .map(keys::decode_secret)
            .transpose()
            .context("invalid private_key")?;

        let mut seen = BTreeSet::from([file.id]);
        let mut peers = Vec::with_capacity(file.peers.len());
        for peer in file.peers {
            if !seen.insert(peer.id) {
                bail!("duplicate node id {} in peers", peer.id);
            }
            let public_key = keys::decode_public(&peer.public_key)
                .with_context(|| format!("invalid public_key for peer {}", peer.id))?;
            peers.push(Peer {
                id: peer.id,
                name: peer.name.unwrap_or_else(|| format!("node-{}", peer.id)),
                role: peer.role,
                address: peer.address,
                public_key,
            });
        }

        Ok(Self {
            id: file.id,
            name: file.name,
            role: file.role,
            listen,
            secret,
            read_timeout: Duration::from_millis(file.timeouts.read_ms),
            connect_retries: file.timeouts.connect_retries,
            peers,
        })
    }

    pub fn peers_with_role(&self, role: Role) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(move |p| p.role == role)
    }

    /// The single relay this node talks to.
    pub fn relay_peer(&self) -> Result<&Peer> {
        let mut relays = self.peers_with_role(Role::Relay);
        match (relays.next(), relays.next()) {
            (Some(relay), None) => Ok(relay),
            (None, _) => bail!("no relay among the configured peers"),
            (Some(_), Some(_)) => bail!("more than one relay among the configured peers"),
        }
    }
}
