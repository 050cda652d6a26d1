//! The cryptographic suite contract.
//!
//! This layer never does group arithmetic. It only needs a deterministic byte
//! representation for group elements and a fallible way back. The suite is
//! passed explicitly to every call that touches a group element.

use std::fmt;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};

/// A suite rejected the bytes handed to [`Suite::deserialize`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct SuiteError {
    reason: String,
}

impl SuiteError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub trait Suite: Send + Sync {
    type Point: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    /// Short identifier, matched against the `suite` field of node configs.
    fn name(&self) -> &'static str;

    /// Deterministic: the same point always yields the same bytes.
    fn serialize(&self, point: &Self::Point) -> Vec<u8>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Point, SuiteError>;
}

/// ristretto255 over Curve25519. Points travel as 32-byte compressed encodings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RistrettoSuite;

impl RistrettoSuite {
    pub const NAME: &'static str = "ristretto255";
}

impl Suite for RistrettoSuite {
    type Point = RistrettoPoint;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn serialize(&self, point: &RistrettoPoint) -> Vec<u8> {
        point.compress().to_bytes().to_vec()
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<RistrettoPoint, SuiteError> {
        let compressed = CompressedRistretto::from_slice(bytes)
            .map_err(|_| SuiteError::new(format!("expected 32 bytes, got {}", bytes.len())))?;
        compressed
            .decompress()
            .ok_or_else(|| SuiteError::new("not a canonical ristretto255 encoding"))
    }
}
