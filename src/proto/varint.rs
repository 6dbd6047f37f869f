//! QUIC variable-length integer encoding (RFC 9000 section 16).

use bytes::{Buf, BufMut};

use super::coding::{BufExt, BufMutExt, Decode, Encode, UnexpectedEnd};

/// An integer in the range `[0, 2^62)`, encoded in 1, 2, 4, or 8 bytes depending on magnitude.
#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd, Hash, Default)]
pub struct VarInt(u64);

impl VarInt {
    pub const MAX: VarInt = VarInt((1 << 62) - 1);

    /// Construct a `VarInt`, failing if `value` is out of range.
    pub fn from_u64(value: u64) -> Result<Self, VarIntBoundsExceeded> {
        if value <= Self::MAX.0 {
            Ok(VarInt(value))
        } else {
            Err(VarIntBoundsExceeded)
        }
    }

    pub const fn from_u32(value: u32) -> Self {
        VarInt(value as u64)
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }

    /// Number of bytes the minimal-length encoding of `self` takes up.
    pub const fn size(self) -> usize {
        if self.0 < 2u64.pow(6) {
            1
        } else if self.0 < 2u64.pow(14) {
            2
        } else if self.0 < 2u64.pow(30) {
            4
        } else if self.0 < 2u64.pow(62) {
            8
        } else {
            unreachable!()
        }
    }

    /// Given the first byte already peeked at, the number of bytes the whole encoding occupies.
    pub fn encoded_size(first: u8) -> usize {
        match first >> 6 {
            0b00 => 1,
            0b01 => 2,
            0b10 => 4,
            0b11 => 8,
            _ => unreachable!(),
        }
    }
}

impl std::fmt::Debug for VarInt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for VarInt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<VarInt> for u64 {
    fn from(v: VarInt) -> Self {
        v.0
    }
}

impl From<u8> for VarInt {
    fn from(v: u8) -> Self {
        VarInt(v.into())
    }
}

impl From<u16> for VarInt {
    fn from(v: u16) -> Self {
        VarInt(v.into())
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::from_u64(value)
    }
}

/// Raised when attempting to build a `VarInt` from a value `>= 2^62`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VarIntBoundsExceeded;

impl std::fmt::Display for VarIntBoundsExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "value too large for varint encoding")
    }
}

impl std::error::Error for VarIntBoundsExceeded {}

impl Decode for VarInt {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if !buf.has_remaining() {
            return Err(UnexpectedEnd(1));
        }
        let first = buf.chunk()[0];
        let tag = first >> 6;
        let len = 1usize << tag;
        if buf.remaining() < len {
            return Err(UnexpectedEnd(len));
        }
        let mut val = (buf.get_u8() & 0x3f) as u64;
        for _ in 1..len {
            val = (val << 8) | buf.get_u8() as u64;
        }
        Ok(VarInt(val))
    }
}

impl Encode for VarInt {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        let x = self.0;
        if x < 2u64.pow(6) {
            buf.put_u8(x as u8);
        } else if x < 2u64.pow(14) {
            buf.put_u16(0b01 << 14 | x as u16);
        } else if x < 2u64.pow(30) {
            buf.put_u32(0b10 << 30 | x as u32);
        } else if x < 2u64.pow(62) {
            buf.put_u64(0b11 << 62 | x);
        } else {
            unreachable!()
        }
    }
}

// keep `BufExt`/`BufMutExt` reachable for callers that only import this module
#[allow(unused_imports)]
use self::{BufExt as _, BufMutExt as _};

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::*;

    fn roundtrip(n: u64) {
        let v = VarInt::from_u64(n).unwrap();
        let mut buf = BytesMut::new();
        v.encode(&mut buf);
        assert_eq!(buf.len(), v.size());
        let mut read = buf.freeze();
        let decoded = VarInt::decode(&mut read).unwrap();
        assert_eq!(decoded.into_inner(), n);
    }

    #[test]
    fn boundaries_roundtrip() {
        for n in [0, 1, 63, 64, 16383, 16384, 0x3fff_ffff, 0x4000_0000, VarInt::MAX.into_inner()] {
            roundtrip(n);
        }
    }

    #[test]
    fn encoding_is_minimal_length() {
        assert_eq!(VarInt::from_u64(37).unwrap().size(), 1);
        assert_eq!(VarInt::from_u64(15293).unwrap().size(), 2);
        assert_eq!(VarInt::from_u64(494_878_333).unwrap().size(), 4);
        assert_eq!(VarInt::from_u64(151_288_809_941_952_652).unwrap().size(), 8);
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(VarInt::from_u64(1 << 62).is_err());
    }

    #[test]
    fn decode_truncated_is_unexpected_end() {
        let mut buf = Bytes::from_static(&[0b01_000000]);
        assert!(VarInt::decode(&mut buf).is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_roundtrip(n in 0u64..(1u64 << 62)) {
            roundtrip(n);
        }
    }
}
