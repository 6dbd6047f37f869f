use std::ops::Add;

use bytes::{Buf, BufMut};

use super::{
    coding::{Decode, Encode, UnexpectedEnd},
    varint::VarInt,
};

/// Which side of the connection opened a stream.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Side {
    Client,
    Server,
}

/// A QUIC stream identifier. The low two bits encode initiator and directionality
/// (RFC 9000 section 2.1); the remaining bits are a per-(initiator, direction) counter.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Ord, PartialOrd)]
pub struct StreamId(pub(crate) u64);

impl StreamId {
    pub fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 0
    }

    pub fn is_bidi(&self) -> bool {
        self.0 % 4 < 2
    }

    pub fn initiator(&self) -> Side {
        if self.is_client_initiated() {
            Side::Client
        } else {
            Side::Server
        }
    }

    fn index(&self) -> u64 {
        self.0 >> 2
    }

    /// The raw wire value of this stream id.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The first client-initiated bidirectional stream id — every HTTP/3 request
    /// stream counts up from here.
    pub fn first_request() -> Self {
        StreamId(0)
    }
}

impl Add<usize> for StreamId {
    type Output = StreamId;

    fn add(self, rhs: usize) -> Self::Output {
        let bits = self.0 & 0x3;
        let index = u64::min(self.index().saturating_add(rhs as u64), VarInt::MAX.into_inner() >> 2);
        StreamId((index << 2) | bits)
    }
}

impl From<u64> for StreamId {
    fn from(v: u64) -> Self {
        StreamId(v)
    }
}

impl TryFrom<VarInt> for StreamId {
    type Error = InvalidStreamId;

    fn try_from(v: VarInt) -> Result<Self, Self::Error> {
        Ok(StreamId(v.into_inner()))
    }
}

impl From<StreamId> for VarInt {
    fn from(id: StreamId) -> Self {
        VarInt::from_u64(id.0).expect("stream id exceeds varint range")
    }
}

/// Raised when a stream id read off the wire is not representable.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InvalidStreamId(pub u64);

impl std::fmt::Display for InvalidStreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid stream id: {}", self.0)
    }
}

impl std::error::Error for InvalidStreamId {}

impl Decode for StreamId {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        Ok(StreamId(VarInt::decode(buf)?.into_inner()))
    }
}

impl Encode for StreamId {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        VarInt::from_u64(self.0).expect("stream id exceeds varint range").encode(buf)
    }
}

/// The role a unidirectional stream plays, identified by its leading varint.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct StreamType(u64);

impl StreamType {
    pub const CONTROL: StreamType = StreamType(0x00);
    pub const PUSH: StreamType = StreamType(0x01);
    pub const ENCODER: StreamType = StreamType(0x02);
    pub const DECODER: StreamType = StreamType(0x03);

    /// Upper bound on the wire size of a `StreamType` (a single varint).
    pub const MAX_ENCODED_SIZE: usize = VarInt::MAX.size();

    /// A stream type drawn from the reserved grease range `0x1f * N + 0x21`, with a
    /// freshly rolled `N` each call so peers can't learn to special-case one fixed
    /// grease identifier.
    pub fn grease() -> Self {
        StreamType(0x1f * fastrand::u64(1..=1024) + 0x21)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// True for the reserved grease range `0x1f * N + 0x21`.
    pub fn is_grease(&self) -> bool {
        self.0 > 0x21 && (self.0 - 0x21) % 0x1f == 0
    }
}

impl From<u64> for StreamType {
    fn from(v: u64) -> Self {
        StreamType(v)
    }
}

impl Decode for StreamType {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        Ok(StreamType(VarInt::decode(buf)?.into_inner()))
    }
}

impl Encode for StreamType {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        VarInt::from_u64(self.0).expect("stream type exceeds varint range").encode(buf)
    }
}
