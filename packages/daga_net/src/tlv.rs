//! Length-value codecs for variable-size fields.
//!
//! Two incompatible encodings live here and are never mixed:
//!
//! - the generic byte-array codec, `[u16 length][bytes]` per entry, used by
//!   [`marshal_byte_arrays`] / [`unmarshal_byte_arrays`];
//! - the `[u32 length][bytes]` sequence codec used by every cryptographic
//!   composite, read through [`SequenceReader`].
//!
//! Every read is bounds-checked; inconsistent lengths surface as
//! [`NetError::MalformedEncoding`].

use crate::error::NetError;

/// Largest entry the u16 byte-array codec can carry.
pub const MAX_BYTE_ARRAY_LEN: usize = u16::MAX as usize;

/// Concatenate `[u16 length][bytes]` for every array.
///
/// # Panics
///
/// If any array is longer than [`MAX_BYTE_ARRAY_LEN`]. That is a caller bug,
/// not a runtime condition.
pub fn marshal_byte_arrays(arrays: &[&[u8]]) -> Vec<u8> {
    let size = arrays.iter().map(|a| a.len() + 2).sum();
    let mut out = Vec::with_capacity(size);
    for array in arrays {
        assert!(
            array.len() <= MAX_BYTE_ARRAY_LEN,
            "cannot marshal byte arrays longer than {MAX_BYTE_ARRAY_LEN} bytes (got {})",
            array.len()
        );
        out.extend_from_slice(&(array.len() as u16).to_be_bytes());
        out.extend_from_slice(array);
    }
    out
}

/// Inverse of [`marshal_byte_arrays`]: read entries until the input is used up.
pub fn unmarshal_byte_arrays(input: &[u8]) -> Result<Vec<Vec<u8>>, NetError> {
    let mut arrays = Vec::new();
    let mut pos = 0;
    while pos < input.len() {
        if input.len() - pos < 2 {
            return Err(NetError::malformed(format!(
                "dangling byte at offset {pos}, expected a 2-byte length"
            )));
        }
        let len = u16::from_be_bytes([input[pos], input[pos + 1]]) as usize;
        let start = pos + 2;
        let end = start + len;
        if end > input.len() {
            return Err(NetError::malformed(format!(
                "byte array #{} declares {len} bytes but only {} remain",
                arrays.len(),
                input.len() - start
            )));
        }
        arrays.push(input[start..end].to_vec());
        pos = end;
    }
    Ok(arrays)
}

/// Append `[u32 length][bytes]`.
pub fn put_u32_prefixed(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), NetError> {
    let len = u32::try_from(bytes.len()).map_err(|_| NetError::FrameTooLarge {
        size: bytes.len(),
        limit: u32::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Encode entries as a u32 sequence with no terminator.
///
/// Empty entries are refused: a zero length is the terminator, so a decoder
/// would stop at the empty entry and drop everything after it.
pub fn encode_sequence<I, B>(entries: I) -> Result<Vec<u8>, NetError>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for (i, entry) in entries.into_iter().enumerate() {
        let entry = entry.as_ref();
        if entry.is_empty() {
            return Err(NetError::malformed(format!(
                "sequence entry {i} is empty and would read as the terminator"
            )));
        }
        put_u32_prefixed(&mut out, entry)?;
    }
    Ok(out)
}

/// Cursor over a buffer of big-endian integers and u32-prefixed entries.
#[derive(Debug, Clone)]
pub struct SequenceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SequenceReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], NetError> {
        if n > self.remaining() {
            return Err(NetError::malformed(format!(
                "{what} needs {n} bytes at offset {} but only {} remain",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u16(&mut self) -> Result<u16, NetError> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, NetError> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// A mandatory `[u32 length][bytes]` field. Zero-length fields are allowed.
    pub fn read_prefixed(&mut self) -> Result<&'a [u8], NetError> {
        let len = self.read_u32()? as usize;
        self.take(len, "length-prefixed field")
    }

    /// The next entry of a sequence, or `None` when the sequence has ended:
    /// fewer than 4 bytes remain, or a zero length prefix (which is consumed).
    pub fn next_entry(&mut self) -> Result<Option<&'a [u8]>, NetError> {
        if self.remaining() < 4 {
            return Ok(None);
        }
        let len = self.read_u32()? as usize;
        if len == 0 {
            return Ok(None);
        }
        self.take(len, "sequence entry").map(Some)
    }

    /// Read a sequence until it ends.
    pub fn read_unbounded(&mut self) -> Result<Vec<&'a [u8]>, NetError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Read exactly `count` entries. A sequence that ends early is malformed.
    pub fn read_exact(&mut self, count: usize, what: &str) -> Result<Vec<&'a [u8]>, NetError> {
        let mut entries = Vec::with_capacity(count.min(self.remaining() / 4));
        while entries.len() < count {
            match self.next_entry()? {
                Some(entry) => entries.push(entry),
                None => {
                    return Err(NetError::malformed(format!(
                        "expected {count} {what}, sequence ended after {}",
                        entries.len()
                    )));
                }
            }
        }
        Ok(entries)
    }
}
