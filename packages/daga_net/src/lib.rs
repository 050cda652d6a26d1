//! Framed transport and wire encoding for DAGA (deniable anonymous group
//! authentication).
//!
//! The crate carries the bytes exchanged between a Relay, its Trustees and
//! Clients. It knows nothing about the group arithmetic itself: group elements
//! cross this layer through the [`Suite`] serialize/deserialize contract, and
//! proofs and signatures are opaque byte strings.
//!
//! - [`framing`]: versioned `[u16 version][u32 length][body]` envelope
//! - [`tlv`]: length-prefixed byte-array and sequence codecs
//! - [`timeout`]: read/timer race with liveness notifications
//! - [`marshal`]: composite messages (key arrays, proofs, transcripts)
//! - [`fanout`]: best-effort and fail-fast broadcast
//! - [`protocol`]: relay and trustee setup state

pub mod connection;
pub mod error;
pub mod fanout;
pub mod framing;
pub mod marshal;
pub mod message;
pub mod protocol;
pub mod suite;
pub mod timeout;
pub mod tlv;

pub use connection::{Connection, NodeId, NodeRepresentation, TcpConnection};
pub use error::{ElementPosition, NetError};
pub use framing::PROTOCOL_VERSION;
pub use message::{MessageType, SetupMessage, SetupTag};
pub use protocol::{ProtocolError, RelayProtocol, TrusteeProtocol};
pub use suite::{RistrettoSuite, Suite, SuiteError};
pub use timeout::{LivenessNotifier, LivenessReceivers, ReadOutcome};
