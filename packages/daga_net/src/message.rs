//! Message tags and the setup-handshake messages.
//!
//! Two unrelated enumerations share the u16 tag space: [`MessageType`] tags
//! transport payloads, [`SetupTag`] tags handshake steps. They live at
//! different protocol layers and must not be confused.

use std::fmt;

use crate::connection::NodeId;
use crate::error::{ElementPosition, NetError};
use crate::marshal;
use crate::suite::Suite;
use crate::tlv::{SequenceReader, put_u32_prefixed};

/// Kind of a transport payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Data = 0,
    DataAndResync = 1,
    PublicKeys = 2,
    LastUploadFailed = 3,
}

impl TryFrom<u16> for MessageType {
    type Error = NetError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::DataAndResync),
            2 => Ok(Self::PublicKeys),
            3 => Ok(Self::LastUploadFailed),
            other => Err(NetError::UnknownMessageType(other)),
        }
    }
}

/// Step of the DAGA setup handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SetupTag {
    /// Relay asks trustees for a fresh authentication context.
    TrusteeSetup = 0,
    /// A trustee finished its part of the setup.
    TrusteeFinishedSetup = 1,
    /// A client asks the relay to be authenticated.
    ClientJoining = 2,
    /// A client asks for the authentication context.
    ClientContextReq = 3,
}

impl TryFrom<u16> for SetupTag {
    type Error = NetError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::TrusteeSetup),
            1 => Ok(Self::TrusteeFinishedSetup),
            2 => Ok(Self::ClientJoining),
            3 => Ok(Self::ClientContextReq),
            other => Err(NetError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for SetupTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TrusteeSetup => "TRUSTEE_SETUP",
            Self::TrusteeFinishedSetup => "TRUSTEE_FINISHED_SETUP",
            Self::ClientJoining => "CLIENT_JOINING",
            Self::ClientContextReq => "CLIENT_CONTEXT_REQ",
        };
        f.write_str(name)
    }
}

/// A payload tagged with its transport kind: `[u16 type][data]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedPayload {
    pub message_type: MessageType,
    pub data: Vec<u8>,
}

impl TaggedPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.data.len());
        out.extend_from_slice(&(self.message_type as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self, NetError> {
        let mut reader = SequenceReader::new(body);
        let message_type = MessageType::try_from(reader.read_u16()?)?;
        Ok(Self {
            message_type,
            data: reader.rest().to_vec(),
        })
    }
}

/// One step of the setup handshake.
///
/// Wire format is `[u16 setup tag]` followed by:
///
/// | tag                      | payload                                     |
/// |--------------------------|---------------------------------------------|
/// | `TRUSTEE_SETUP`          | public-key array of the trustee roster      |
/// | `TRUSTEE_FINISHED_SETUP` | `[u32 id][u32 len][commitment]`             |
/// | `CLIENT_JOINING`         | `[u32 id][u32 len][key][u32 len][generator]` |
/// | `CLIENT_CONTEXT_REQ`     | `[u32 id]`                                  |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupMessage<P> {
    TrusteeSetup {
        trustee_keys: Vec<P>,
    },
    TrusteeFinishedSetup {
        trustee_id: NodeId,
        commitment: P,
    },
    ClientJoining {
        client_id: NodeId,
        public_key: P,
        generator: P,
    },
    ClientContextReq {
        client_id: NodeId,
    },
}

impl<P> SetupMessage<P> {
    pub fn tag(&self) -> SetupTag {
        match self {
            Self::TrusteeSetup { .. } => SetupTag::TrusteeSetup,
            Self::TrusteeFinishedSetup { .. } => SetupTag::TrusteeFinishedSetup,
            Self::ClientJoining { .. } => SetupTag::ClientJoining,
            Self::ClientContextReq { .. } => SetupTag::ClientContextReq,
        }
    }

    /// The node id the message claims to come from. `TRUSTEE_SETUP` carries
    /// none.
    pub fn claimed_id(&self) -> Option<NodeId> {
        match self {
            Self::TrusteeSetup { .. } => None,
            Self::TrusteeFinishedSetup { trustee_id, .. } => Some(*trustee_id),
            Self::ClientJoining { client_id, .. } | Self::ClientContextReq { client_id } => {
                Some(*client_id)
            }
        }
    }

    pub fn encode<S>(&self, suite: &S) -> Result<Vec<u8>, NetError>
    where
        S: Suite<Point = P>,
    {
        let mut out = (self.tag() as u16).to_be_bytes().to_vec();
        match self {
            Self::TrusteeSetup { trustee_keys } => {
                out.extend(marshal::marshal_public_key_array(suite, trustee_keys)?);
            }
            Self::TrusteeFinishedSetup {
                trustee_id,
                commitment,
            } => {
                out.extend_from_slice(&trustee_id.to_be_bytes());
                put_u32_prefixed(&mut out, &suite.serialize(commitment))?;
            }
            Self::ClientJoining {
                client_id,
                public_key,
                generator,
            } => {
                out.extend_from_slice(&client_id.to_be_bytes());
                put_u32_prefixed(&mut out, &suite.serialize(public_key))?;
                put_u32_prefixed(&mut out, &suite.serialize(generator))?;
            }
            Self::ClientContextReq { client_id } => {
                out.extend_from_slice(&client_id.to_be_bytes());
            }
        }
        Ok(out)
    }

    pub fn decode<S>(suite: &S, body: &[u8]) -> Result<Self, NetError>
    where
        S: Suite<Point = P>,
    {
        let mut reader = SequenceReader::new(body);
        let tag = SetupTag::try_from(reader.read_u16()?)?;
        let point = |bytes: &[u8], position: ElementPosition| {
            suite
                .deserialize(bytes)
                .map_err(|source| NetError::InvalidGroupElementEncoding { position, source })
        };
        let message = match tag {
            SetupTag::TrusteeSetup => Self::TrusteeSetup {
                trustee_keys: marshal::unmarshal_public_key_array(suite, reader.rest())?,
            },
            SetupTag::TrusteeFinishedSetup => Self::TrusteeFinishedSetup {
                trustee_id: reader.read_u32()?,
                commitment: point(reader.read_prefixed()?, ElementPosition::Commitment)?,
            },
            SetupTag::ClientJoining => Self::ClientJoining {
                client_id: reader.read_u32()?,
                public_key: point(reader.read_prefixed()?, ElementPosition::ClientKey)?,
                generator: point(reader.read_prefixed()?, ElementPosition::ClientGenerator)?,
            },
            SetupTag::ClientContextReq => Self::ClientContextReq {
                client_id: reader.read_u32()?,
            },
        };
        Ok(message)
    }
}
