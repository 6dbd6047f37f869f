//! Wire representations for a QPACK field-section prefix and its field lines
//! (RFC 9204 sections 4.5.1 and 4.5.2–4.5.6).
//!
//! Post-base representations (4.5.3, 4.5.5) are never emitted by [`super::encoder`]
//! and are reported as [`BlockError::PostBaseUnsupported`] on decode.

use bytes::{Buf, BufMut, Bytes};

use super::{prefix_int, prefix_string};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockError {
    UnexpectedEnd,
    Overflow,
    HuffmanUnsupported,
    PostBaseUnsupported,
    Malformed,
}

impl From<prefix_int::Error> for BlockError {
    fn from(e: prefix_int::Error) -> Self {
        match e {
            prefix_int::Error::UnexpectedEnd => BlockError::UnexpectedEnd,
            prefix_int::Error::Overflow => BlockError::Overflow,
        }
    }
}

impl From<prefix_string::Error> for BlockError {
    fn from(e: prefix_string::Error) -> Self {
        match e {
            prefix_string::Error::UnexpectedEnd => BlockError::UnexpectedEnd,
            prefix_string::Error::Overflow => BlockError::Overflow,
            prefix_string::Error::HuffmanUnsupported => BlockError::HuffmanUnsupported,
        }
    }
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for BlockError {}

/// The two-integer prefix (RFC 9204 section 4.5.1) at the start of every field section.
///
/// This crate encodes `required_insert_count` directly rather than RFC 9204's
/// wraparound-robust transform: that encoding exists to protect against a
/// compression-blocking attack where a hostile peer's table size estimate
/// disagrees with the decoder's, which cannot happen between this crate's own
/// encoder and decoder.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeaderPrefix {
    pub required_insert_count: u64,
    pub base: u64,
}

impl HeaderPrefix {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        prefix_int::encode(8, 0, self.required_insert_count, buf);
        if self.base >= self.required_insert_count {
            prefix_int::encode(7, 0x00, self.base - self.required_insert_count, buf);
        } else {
            prefix_int::encode(7, 0x80, self.required_insert_count - self.base - 1, buf);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, BlockError> {
        if !buf.has_remaining() {
            return Err(BlockError::UnexpectedEnd);
        }
        let first = buf.get_u8();
        let required_insert_count = prefix_int::decode(8, first, buf)?;

        if !buf.has_remaining() {
            return Err(BlockError::UnexpectedEnd);
        }
        let second = buf.get_u8();
        let negative = second & 0x80 != 0;
        let delta = prefix_int::decode(7, second, buf)?;
        let base = if negative {
            required_insert_count.checked_sub(delta + 1).ok_or(BlockError::Malformed)?
        } else {
            required_insert_count + delta
        };
        Ok(Self {
            required_insert_count,
            base,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldLine {
    Indexed {
        dynamic: bool,
        index: u64,
    },
    LiteralWithNameRef {
        dynamic: bool,
        never_indexed: bool,
        index: u64,
        value: Bytes,
    },
    LiteralWithLiteralName {
        never_indexed: bool,
        name: Bytes,
        value: Bytes,
    },
}

impl FieldLine {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            FieldLine::Indexed { dynamic, index } => {
                let flags = 0x80 | if *dynamic { 0x00 } else { 0x40 };
                prefix_int::encode(6, flags, *index, buf);
            }
            FieldLine::LiteralWithNameRef {
                dynamic,
                never_indexed,
                index,
                value,
            } => {
                let flags = 0x40
                    | if *never_indexed { 0x20 } else { 0x00 }
                    | if *dynamic { 0x00 } else { 0x10 };
                prefix_int::encode(4, flags, *index, buf);
                prefix_string::encode(7, 0x00, value, buf);
            }
            FieldLine::LiteralWithLiteralName {
                never_indexed,
                name,
                value,
            } => {
                let flags = 0x20 | if *never_indexed { 0x10 } else { 0x00 };
                prefix_string::encode(3, flags, name, buf);
                prefix_string::encode(7, 0x00, value, buf);
            }
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, BlockError> {
        if !buf.has_remaining() {
            return Err(BlockError::UnexpectedEnd);
        }
        let first = buf.get_u8();

        if first & 0x80 != 0 {
            let dynamic = first & 0x40 == 0;
            let index = prefix_int::decode(6, first, buf)?;
            return Ok(FieldLine::Indexed { dynamic, index });
        }

        if first & 0x40 != 0 {
            let never_indexed = first & 0x20 != 0;
            let dynamic = first & 0x10 == 0;
            let index = prefix_int::decode(4, first, buf)?;
            let value = decode_value(buf)?;
            return Ok(FieldLine::LiteralWithNameRef {
                dynamic,
                never_indexed,
                index,
                value,
            });
        }

        if first & 0x20 != 0 {
            let never_indexed = first & 0x10 != 0;
            let name = prefix_string::decode(3, 0x08, first, buf)?;
            let value = decode_value(buf)?;
            return Ok(FieldLine::LiteralWithLiteralName {
                never_indexed,
                name,
                value,
            });
        }

        Err(BlockError::PostBaseUnsupported)
    }
}

fn decode_value<B: Buf>(buf: &mut B) -> Result<Bytes, BlockError> {
    if !buf.has_remaining() {
        return Err(BlockError::UnexpectedEnd);
    }
    let first = buf.get_u8();
    Ok(prefix_string::decode(7, 0x80, first, buf)?)
}
