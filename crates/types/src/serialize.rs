//! Bit-exact wire serialization.
//!
//! Every consensus object has exactly one canonical byte encoding: fields are
//! concatenated big-endian with no framing beyond explicit length prefixes.
//! Hashes and signatures are computed over these canonical bytes, so encoding
//! must be deterministic and decoding must consume the input exactly.

use thiserror::Error;

/// Upper bound on any single length-prefixed allocation read from the wire.
pub const ALLOCATION_LIMIT: u64 = 4 * 1024 * 1024;

/// Errors produced while decoding wire bytes.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The input ended before the object was fully decoded
    #[error("unexpected end of input: needed {needed} more bytes, had {available}")]
    UnexpectedEnd {
        /// Bytes still required
        needed: usize,
        /// Bytes remaining in the input
        available: usize,
    },

    /// A length prefix exceeds the allocation safety limit
    #[error("{0} length {1} exceeds the allocation limit")]
    OversizedLength(&'static str, u64),

    /// Input remained after the object was fully decoded
    #[error("{0} trailing bytes after decoding")]
    TrailingBytes(usize),

    /// A decoded field failed validation
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Which field was malformed
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Result type for wire decoding.
pub type SerializeResult<T> = std::result::Result<T, SerializationError>;

/// Types with a canonical wire encoding.
pub trait Serial {
    /// Append the canonical encoding of `self` to `out`.
    fn serial(&self, out: &mut Vec<u8>);

    /// Serialize into a fresh buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serial(&mut out);
        out
    }
}

/// Types decodable from their canonical wire encoding.
pub trait Deserial: Sized {
    /// Decode one object from the cursor, advancing it.
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self>;

    /// Decode an object that must consume the whole input.
    fn from_bytes(bytes: &[u8]) -> SerializeResult<Self> {
        let mut cursor = ReadCursor::new(bytes);
        let value = Self::deserial(&mut cursor)?;
        cursor.expect_end()?;
        Ok(value)
    }
}

/// A forward-only reader over a byte slice.
#[derive(Debug)]
pub struct ReadCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ReadCursor<'a> {
    /// Create a cursor at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> SerializeResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(SerializationError::UnexpectedEnd {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> SerializeResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> SerializeResult<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("exact slice");
        Ok(u32::from_be_bytes(bytes))
    }

    /// Read a big-endian `u64`.
    pub fn read_u64(&mut self) -> SerializeResult<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("exact slice");
        Ok(u64::from_be_bytes(bytes))
    }

    /// Read an `f64` stored as big-endian IEEE-754 bits.
    pub fn read_f64(&mut self) -> SerializeResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Read a fixed-size byte array.
    pub fn read_array<const N: usize>(&mut self) -> SerializeResult<[u8; N]> {
        Ok(self.take(N)?.try_into().expect("exact slice"))
    }

    /// Read `len` bytes into an owned buffer, `what` naming the field for
    /// the oversize error.
    pub fn read_vec(&mut self, len: u64, what: &'static str) -> SerializeResult<Vec<u8>> {
        if len > ALLOCATION_LIMIT {
            return Err(SerializationError::OversizedLength(what, len));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Read an unsigned LEB128 varint.
    pub fn read_varint(&mut self) -> SerializeResult<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 63 && byte > 1 {
                return Err(SerializationError::InvalidField {
                    field: "varint",
                    reason: "value exceeds 64 bits".into(),
                });
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Fail unless the whole input has been consumed.
    pub fn expect_end(&self) -> SerializeResult<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(SerializationError::TrailingBytes(n)),
        }
    }
}

/// Append a big-endian `u32`.
pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Append a big-endian `u64`.
pub fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Append an `f64` as big-endian IEEE-754 bits.
pub fn write_f64(out: &mut Vec<u8>, value: f64) {
    write_u64(out, value.to_bits());
}

/// Append an unsigned LEB128 varint.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}
