//! Key material for node configs: generation and base64url encoding.

use anyhow::{Context, Result, anyhow};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use daga_net::{RistrettoSuite, Suite};
use data_encoding::BASE64URL_NOPAD;
use rand::RngCore;

pub struct KeyPair {
    pub secret: Scalar,
    pub public: RistrettoPoint,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(random_scalar())
    }

    pub fn from_secret(secret: Scalar) -> Self {
        Self {
            secret,
            public: RISTRETTO_BASEPOINT_POINT * secret,
        }
    }
}

/// A uniformly random scalar, reduced from 64 random bytes.
pub fn random_scalar() -> Scalar {
    let mut wide = [0u8; 64];
    rand::rng().fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

pub fn encode_secret(secret: &Scalar) -> String {
    BASE64URL_NOPAD.encode(secret.as_bytes())
}

pub fn encode_public(point: &RistrettoPoint) -> String {
    BASE64URL_NOPAD.encode(&RistrettoSuite.serialize(point))
}

pub fn decode_secret(encoded: &str) -> Result<Scalar> {
    let bytes = BASE64URL_NOPAD
        .decode(encoded.as_bytes())
        .context("not unpadded base64url")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow!("expected 32 bytes, got {}", b.len()))?;
    Option::<Scalar>::from(Scalar::from_canonical_bytes(bytes))
        .ok_or_else(|| anyhow!("not a canonical scalar"))
}

pub fn decode_public(encoded: &str) -> Result<RistrettoPoint> {
    let bytes = BASE64URL_NOPAD
        .decode(encoded.as_bytes())
        .context("not unpadded base64url")?;
    Ok(RistrettoSuite.deserialize(&bytes)?)
}
