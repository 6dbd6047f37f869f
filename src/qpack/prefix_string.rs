//! RFC 9204 section 4.1.2 — prefix-coded string literals.
//!
//! Huffman coding of string literals is a pure compression optimization; RFC 9204
//! makes it optional ("H" bit). This crate always sends literal (uncompressed)
//! strings and never sets the H bit, which is fully conformant for a QPACK sender.
//! Decoding a Huffman-coded string from a peer is not supported; such a field is
//! reported as `QPACK_DECOMPRESSION_FAILED`, the action a decoder is entitled to
//! take for a string in a form it can't process.

use bytes::{Buf, BufMut, Bytes};

use super::prefix_int;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    UnexpectedEnd,
    Overflow,
    HuffmanUnsupported,
}

impl From<prefix_int::Error> for Error {
    fn from(e: prefix_int::Error) -> Self {
        match e {
            prefix_int::Error::UnexpectedEnd => Error::UnexpectedEnd,
            prefix_int::Error::Overflow => Error::Overflow,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnexpectedEnd => write!(f, "unexpected end decoding string literal"),
            Error::Overflow => write!(f, "string literal length overflowed"),
            Error::HuffmanUnsupported => write!(f, "huffman-coded string literal is not supported"),
        }
    }
}

impl std::error::Error for Error {}

/// Encode `value` as a literal string with an `n`-bit length prefix, never Huffman-coded.
pub fn encode<B: BufMut>(n: u8, extra_flags: u8, value: &[u8], buf: &mut B) {
    prefix_int::encode(n, extra_flags, value.len() as u64, buf);
    buf.put_slice(value);
}

/// Decode a prefix-coded string. `n` is the prefix width and `first_byte` the byte
/// that carried the length prefix (needed to read the H flag at bit `huffman_bit`).
pub fn decode<B: Buf>(n: u8, huffman_bit: u8, first_byte: u8, buf: &mut B) -> Result<Bytes, Error> {
    let huffman = first_byte & huffman_bit != 0;
    let len = prefix_int::decode(n, first_byte, buf)? as usize;
    if huffman {
        return Err(Error::HuffmanUnsupported);
    }
    if buf.remaining() < len {
        return Err(Error::UnexpectedEnd);
    }
    Ok(buf.copy_to_bytes(len))
}
