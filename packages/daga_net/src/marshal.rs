//! Composite messages carrying group elements, proofs and signatures.
//!
//! Layouts (all integers big-endian, all lengths u32):
//!
//! ```text
//! public key        [u16 PUBLICKEYS][key]
//! key array         [u16 PUBLICKEYS]([len][key])*
//! base + keys       [len][base][len][key array]
//! + proof           ...[len][proof]
//! + signatures      ...[len]([len][signature])*
//! transcript        ([len][base]){n} ([len]([len][key]){m}){n} ([len][proof]){n}
//! auth context      [len][trustee key array][len][client key array]
//! ```
//!
//! Every element decode failure reports where in the structure it happened.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::{Connection, NodeRepresentation};
use crate::error::{ElementPosition, NetError};
use crate::message::MessageType;
use crate::suite::Suite;
use crate::tlv::{SequenceReader, encode_sequence, put_u32_prefixed};

fn deserialize_at<S: Suite>(
    suite: &S,
    bytes: &[u8],
    position: ElementPosition,
) -> Result<S::Point, NetError> {
    suite
        .deserialize(bytes)
        .map_err(|source| NetError::InvalidGroupElementEncoding { position, source })
}

fn expect_public_keys_tag(reader: &mut SequenceReader<'_>) -> Result<(), NetError> {
    let tag = reader.read_u16()?;
    if tag != MessageType::PublicKeys as u16 {
        return Err(NetError::UnexpectedMessageType {
            expected: MessageType::PublicKeys as u16,
            actual: tag,
        });
    }
    Ok(())
}

// --- Single key ---

pub fn encode_public_key<S: Suite>(suite: &S, key: &S::Point) -> Vec<u8> {
    let mut out = (MessageType::PublicKeys as u16).to_be_bytes().to_vec();
    out.extend(suite.serialize(key));
    out
}

pub fn decode_public_key<S: Suite>(suite: &S, body: &[u8]) -> Result<S::Point, NetError> {
    let mut reader = SequenceReader::new(body);
    expect_public_keys_tag(&mut reader)?;
    deserialize_at(suite, reader.rest(), ElementPosition::PublicKey)
}

// --- Key arrays ---

pub fn marshal_public_key_array<S: Suite>(
    suite: &S,
    keys: &[S::Point],
) -> Result<Vec<u8>, NetError> {
    let mut out = (MessageType::PublicKeys as u16).to_be_bytes().to_vec();
    for key in keys {
        put_u32_prefixed(&mut out, &suite.serialize(key))?;
    }
    Ok(out)
}

pub fn unmarshal_public_key_array<S: Suite>(
    suite: &S,
    buf: &[u8],
) -> Result<Vec<S::Point>, NetError> {
    let mut reader = SequenceReader::new(buf);
    expect_public_keys_tag(&mut reader)?;
    reader
        .read_unbounded()?
        .into_iter()
        .enumerate()
        .map(|(i, bytes)| deserialize_at(suite, bytes, ElementPosition::Key(i)))
        .collect()
}

/// The public-key array of a roster, in roster order.
pub fn marshal_node_public_keys<S: Suite, C>(
    suite: &S,
    nodes: &[NodeRepresentation<C, S::Point>],
) -> Result<Vec<u8>, NetError> {
    let keys: Vec<S::Point> = nodes.iter().map(|n| n.public_key.clone()).collect();
    marshal_public_key_array(suite, &keys)
}

// --- Base + keys composites ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseAndKeys<P> {
    pub base: P,
    pub keys: Vec<P>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseKeysAndProof<P> {
    pub base: P,
    pub keys: Vec<P>,
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseKeysAndSignatures<P> {
    pub base: P,
    pub keys: Vec<P>,
    pub signatures: Vec<Vec<u8>>,
}

fn put_base_and_keys<S: Suite>(
    out: &mut Vec<u8>,
    suite: &S,
    base: &S::Point,
    keys: &[S::Point],
) -> Result<(), NetError> {
    put_u32_prefixed(out, &suite.serialize(base))?;
    put_u32_prefixed(out, &marshal_public_key_array(suite, keys)?)
}

fn read_base_and_keys<S: Suite>(
    reader: &mut SequenceReader<'_>,
    suite: &S,
) -> Result<(S::Point, Vec<S::Point>), NetError> {
    let base = deserialize_at(suite, reader.read_prefixed()?, ElementPosition::Base)?;
    let keys = unmarshal_public_key_array(suite, reader.read_prefixed()?)?;
    Ok((base, keys))
}

impl<P> BaseAndKeys<P> {
    pub fn encode<S: Suite<Point = P>>(&self, suite: &S) -> Result<Vec<u8>, NetError> {
        let mut out = Vec::new();
        put_base_and_keys(&mut out, suite, &self.base, &self.keys)?;
        Ok(out)
    }

    pub fn decode<S: Suite<Point = P>>(suite: &S, body: &[u8]) -> Result<Self, NetError> {
        let (base, keys) = read_base_and_keys(&mut SequenceReader::new(body), suite)?;
        Ok(Self { base, keys })
    }
}

impl<P> BaseKeysAndProof<P> {
    pub fn encode<S: Suite<Point = P>>(&self, suite: &S) -> Result<Vec<u8>, NetError> {
        let mut out = Vec::new();
        put_base_and_keys(&mut out, suite, &self.base, &self.keys)?;
        put_u32_prefixed(&mut out, &self.proof)?;
        Ok(out)
    }

    pub fn decode<S: Suite<Point = P>>(suite: &S, body: &[u8]) -> Result<Self, NetError> {
        let mut reader = SequenceReader::new(body);
        let (base, keys) = read_base_and_keys(&mut reader, suite)?;
        let proof = reader.read_prefixed()?.to_vec();
        Ok(Self { base, keys, proof })
    }
}

impl<P> BaseKeysAndSignatures<P> {
    pub fn encode<S: Suite<Point = P>>(&self, suite: &S) -> Result<Vec<u8>, NetError> {
        let mut out = Vec::new();
        put_base_and_keys(&mut out, suite, &self.base, &self.keys)?;
        put_u32_prefixed(&mut out, &encode_sequence(&self.signatures)?)?;
        Ok(out)
    }

    pub fn decode<S: Suite<Point = P>>(suite: &S, body: &[u8]) -> Result<Self, NetError> {
        let mut reader = SequenceReader::new(body);
        let (base, keys) = read_base_and_keys(&mut reader, suite)?;
        let signatures = SequenceReader::new(reader.read_prefixed()?)
            .read_unbounded()?
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        Ok(Self {
            base,
            keys,
            signatures,
        })
    }
}

// --- Transcript ---

/// Per-trustee outputs of a DAGA context setup.
///
/// `bases[i]`, `ephemeral_keys[i]` and `proofs[i]` were produced by trustee
/// `i`; `ephemeral_keys[i][j]` is client `j`'s key after trustee `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript<P> {
    pub bases: Vec<P>,
    pub ephemeral_keys: Vec<Vec<P>>,
    pub proofs: Vec<Vec<u8>>,
}

impl<P> Transcript<P> {
    pub fn trustee_count(&self) -> usize {
        self.bases.len()
    }

    /// Entries are never empty on the wire: a zero length would read back as
    /// the end of the sequence.
    pub fn encode<S: Suite<Point = P>>(&self, suite: &S) -> Result<Vec<u8>, NetError> {
        let n = self.trustee_count();
        if self.ephemeral_keys.len() != n || self.proofs.len() != n {
            return Err(NetError::malformed(format!(
                "transcript has {n} bases, {} key arrays and {} proofs",
                self.ephemeral_keys.len(),
                self.proofs.len()
            )));
        }
        if let Some(i) = self.proofs.iter().position(Vec::is_empty) {
            return Err(NetError::malformed(format!("proof of trustee #{i} is empty")));
        }
        if let Some(i) = self.ephemeral_keys.iter().position(Vec::is_empty) {
            return Err(NetError::malformed(format!(
                "ephemeral keys of trustee #{i} are empty"
            )));
        }

        let mut out = encode_sequence(self.bases.iter().map(|b| suite.serialize(b)))?;
        for row in &self.ephemeral_keys {
            let inner = encode_sequence(row.iter().map(|k| suite.serialize(k)))?;
            put_u32_prefixed(&mut out, &inner)?;
        }
        out.extend(encode_sequence(&self.proofs)?);
        Ok(out)
    }

    /// Decode a transcript of exactly `n_trustees` entries per section, each
    /// key array holding exactly `n_clients` keys.
    pub fn decode<S: Suite<Point = P>>(
        suite: &S,
        body: &[u8],
        n_clients: usize,
        n_trustees: usize,
    ) -> Result<Self, NetError> {
        let mut reader = SequenceReader::new(body);

        let bases = reader
            .read_exact(n_trustees, "transcript bases")?
            .into_iter()
            .enumerate()
            .map(|(trustee, bytes)| {
                deserialize_at(suite, bytes, ElementPosition::TranscriptBase { trustee })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut ephemeral_keys = Vec::with_capacity(n_trustees);
        for (trustee, row) in reader
            .read_exact(n_trustees, "ephemeral key arrays")?
            .into_iter()
            .enumerate()
        {
            let keys = SequenceReader::new(row)
                .read_exact(n_clients, "ephemeral keys")?
                .into_iter()
                .enumerate()
                .map(|(client, bytes)| {
                    deserialize_at(
                        suite,
                        bytes,
                        ElementPosition::EphemeralKey { trustee, client },
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;
            ephemeral_keys.push(keys);
        }

        let proofs = reader
            .read_exact(n_trustees, "transcript proofs")?
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();

        Ok(Self {
            bases,
            ephemeral_keys,
            proofs,
        })
    }
}

// --- Authentication context ---

/// What a client receives in answer to `CLIENT_CONTEXT_REQ`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext<P> {
    pub trustee_keys: Vec<P>,
    pub client_keys: Vec<P>,
}

impl<P> AuthContext<P> {
    pub fn encode<S: Suite<Point = P>>(&self, suite: &S) -> Result<Vec<u8>, NetError> {
        let mut out = Vec::new();
        put_u32_prefixed(&mut out, &marshal_public_key_array(suite, &self.trustee_keys)?)?;
        put_u32_prefixed(&mut out, &marshal_public_key_array(suite, &self.client_keys)?)?;
        Ok(out)
    }

    pub fn decode<S: Suite<Point = P>>(suite: &S, body: &[u8]) -> Result<Self, NetError> {
        let mut reader = SequenceReader::new(body);
        let trustee_keys = unmarshal_public_key_array(suite, reader.read_prefixed()?)?;
        let client_keys = unmarshal_public_key_array(suite, reader.read_prefixed()?)?;
        Ok(Self {
            trustee_keys,
            client_keys,
        })
    }
}

// --- Over a connection ---

pub async fn tell_public_key<C, S>(
    conn: &Connection<C>,
    suite: &S,
    key: &S::Point,
) -> Result<(), NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    conn.write_message(&encode_public_key(suite, key)).await
}

pub async fn read_public_key<C, S>(conn: &Connection<C>, suite: &S) -> Result<S::Point, NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    decode_public_key(suite, &conn.read_message().await?)
}

pub async fn write_public_key_array<C, S>(
    conn: &Connection<C>,
    suite: &S,
    keys: &[S::Point],
) -> Result<(), NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    conn.write_message(&marshal_public_key_array(suite, keys)?)
        .await
}

pub async fn read_public_key_array<C, S>(
    conn: &Connection<C>,
    suite: &S,
) -> Result<Vec<S::Point>, NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    unmarshal_public_key_array(suite, &conn.read_message().await?)
}

pub async fn write_base_and_keys<C, S>(
    conn: &Connection<C>,
    suite: &S,
    message: &BaseAndKeys<S::Point>,
) -> Result<(), NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    conn.write_message(&message.encode(suite)?).await
}

pub async fn read_base_and_keys_from<C, S>(
    conn: &Connection<C>,
    suite: &S,
) -> Result<BaseAndKeys<S::Point>, NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    BaseAndKeys::decode(suite, &conn.read_message().await?)
}

pub async fn write_base_keys_and_proof<C, S>(
    conn: &Connection<C>,
    suite: &S,
    message: &BaseKeysAndProof<S::Point>,
) -> Result<(), NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    conn.write_message(&message.encode(suite)?).await
}

pub async fn read_base_keys_and_proof<C, S>(
    conn: &Connection<C>,
    suite: &S,
) -> Result<BaseKeysAndProof<S::Point>, NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    BaseKeysAndProof::decode(suite, &conn.read_message().await?)
}

pub async fn write_base_keys_and_signatures<C, S>(
    conn: &Connection<C>,
    suite: &S,
    message: &BaseKeysAndSignatures<S::Point>,
) -> Result<(), NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    conn.write_message(&message.encode(suite)?).await
}

pub async fn read_base_keys_and_signatures<C, S>(
    conn: &Connection<C>,
    suite: &S,
) -> Result<BaseKeysAndSignatures<S::Point>, NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    BaseKeysAndSignatures::decode(suite, &conn.read_message().await?)
}

pub async fn write_transcript<C, S>(
    conn: &Connection<C>,
    suite: &S,
    transcript: &Transcript<S::Point>,
) -> Result<(), NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    conn.write_message(&transcript.encode(suite)?).await
}

pub async fn read_transcript<C, S>(
    conn: &Connection<C>,
    suite: &S,
    n_clients: usize,
    n_trustees: usize,
) -> Result<Transcript<S::Point>, NetError>
where
    C: AsyncRead + AsyncWrite + Send,
    S: Suite,
{
    Transcript::decode(suite, &conn.read_message().await?, n_clients, n_trustees)
}
