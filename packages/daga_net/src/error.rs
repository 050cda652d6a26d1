//! Error taxonomy for the transport and codec layer.

use std::fmt;
use std::io;

use crate::suite::SuiteError;

/// Where in a composite message a group element failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementPosition {
    /// The lone key of a single-public-key message.
    PublicKey,
    /// Entry `n` of a public-key array.
    Key(usize),
    /// The base point of a base + keys message.
    Base,
    /// The base point contributed by trustee `n` in a transcript.
    TranscriptBase { trustee: usize },
    /// Client `client`'s ephemeral key as shuffled by trustee `trustee`.
    EphemeralKey { trustee: usize, client: usize },
    /// The commitment in `TRUSTEE_FINISHED_SETUP`.
    Commitment,
    /// The public key in `CLIENT_JOINING`.
    ClientKey,
    /// The generator in `CLIENT_JOINING`.
    ClientGenerator,
}

impl fmt::Display for ElementPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey => write!(f, "public key"),
            Self::Key(i) => write!(f, "key #{i}"),
            Self::Base => write!(f, "base point"),
            Self::TranscriptBase { trustee } => write!(f, "base point of trustee #{trustee}"),
            Self::EphemeralKey { trustee, client } => {
                write!(f, "ephemeral key [{trustee}][{client}]")
            }
            Self::Commitment => write!(f, "trustee commitment"),
            Self::ClientKey => write!(f, "client public key"),
            Self::ClientGenerator => write!(f, "client generator"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Lower-level I/O failure. The connection should be presumed broken.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("short read: read {read} of {expected} bytes")]
    ShortRead { read: usize, expected: usize },

    #[error("protocol version mismatch: peer speaks {received}, we speak {local}")]
    ProtocolVersionMismatch { received: u16, local: u16 },

    /// A datagram shorter than its header announced. `partial` holds the body
    /// bytes that did arrive; it is a best-effort result, not a success.
    #[error("truncated datagram: received {received} of {expected} body bytes")]
    TruncatedDatagram {
        partial: Vec<u8>,
        received: usize,
        expected: usize,
    },

    #[error("frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),

    #[error("invalid group element encoding at {position}: {source}")]
    InvalidGroupElementEncoding {
        position: ElementPosition,
        #[source]
        source: SuiteError,
    },

    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType { expected: u16, actual: u16 },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u16),

    #[error("timed out")]
    Timeout,
}

impl NetError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEncoding(msg.into())
    }

    /// True for errors after which the connection can no longer be trusted to
    /// be frame-aligned, or whose peer cannot be talked to at all.
    ///
    /// A version mismatch is fatal: the peer speaks an incompatible protocol,
    /// so every later frame from it would be rejected too.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::ShortWrite { .. }
                | Self::ShortRead { .. }
                | Self::ProtocolVersionMismatch { .. }
                | Self::FrameTooLarge { .. }
                | Self::Timeout
        )
    }
}
