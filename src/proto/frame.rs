//! HTTP/3 frame header (`varint(type) || varint(length)`) and known frame bodies.

use bytes::{Buf, BufMut, Bytes};

use super::{
    coding::{BufExt, BufMutExt, Decode, Encode, UnexpectedEnd},
    stream::StreamId,
    varint::VarInt,
};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FrameType(u64);

impl FrameType {
    pub const DATA: FrameType = FrameType(0x00);
    pub const HEADERS: FrameType = FrameType(0x01);
    pub const CANCEL_PUSH: FrameType = FrameType(0x03);
    pub const SETTINGS: FrameType = FrameType(0x04);
    pub const PUSH_PROMISE: FrameType = FrameType(0x05);
    pub const GOAWAY: FrameType = FrameType(0x07);
    pub const MAX_PUSH_ID: FrameType = FrameType(0x0d);

    /// A frame type drawn from the reserved grease range `0x1f * N + 0x21`, with a
    /// freshly rolled `N` each call so peers can't learn to special-case one fixed
    /// grease identifier.
    pub fn grease() -> Self {
        FrameType(0x1f * fastrand::u64(1..=1024) + 0x21)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    fn is_grease(&self) -> bool {
        self.0 > 0x21 && (self.0 - 0x21) % 0x1f == 0
    }
}

impl Decode for FrameType {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        Ok(FrameType(VarInt::decode(buf)?.into_inner()))
    }
}

impl Encode for FrameType {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        VarInt::from_u64(self.0).expect("frame type out of range").encode(buf)
    }
}

/// A parsed SETTINGS payload: an ordered list of (identifier, value) pairs.
///
/// Unrecognized identifiers are kept, not dropped, so `GENERAL_PROTOCOL_ERROR`
/// duplicate-detection and grease settings round-trip correctly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    entries: Vec<(u64, u64)>,
}

impl Settings {
    pub const QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
    pub const MAX_FIELD_SECTION_SIZE: u64 = 0x06;
    pub const QPACK_BLOCKED_STREAMS: u64 = 0x07;
    pub const ENABLE_CONNECT_PROTOCOL: u64 = 0x08;
    pub const H3_DATAGRAM: u64 = 0x33;

    pub fn get(&self, id: u64) -> Option<u64> {
        self.entries.iter().find(|(k, _)| *k == id).map(|(_, v)| *v)
    }

    pub fn insert(&mut self, id: u64, value: u64) {
        self.entries.push((id, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries.iter().copied()
    }

    fn encoded_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, v)| VarInt::from_u64(*k).unwrap().size() + VarInt::from_u64(*v).unwrap().size())
            .sum()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        for (k, v) in &self.entries {
            buf.write_var(*k);
            buf.write_var(*v);
        }
    }

    fn decode<B: Buf>(buf: &mut B, len: usize) -> Result<Self, FrameError> {
        let mut body = buf.take(len);
        let mut entries = Vec::new();
        while body.has_remaining() {
            let id = body.get_var().map_err(|_| FrameError::Malformed)?;
            let value = body.get_var().map_err(|_| FrameError::Malformed)?;
            entries.push((id, value));
        }
        Ok(Settings { entries })
    }
}

/// Maximum size of a frame *header* (type + length varints); payload length is unbounded.
pub const MAX_ENCODED_SIZE: usize = 2 * VarInt::MAX.size();

/// Marker payload for a `Data` frame whose body hasn't been read off the wire yet —
/// only its declared length is known.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PayloadLen(pub usize);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame<B> {
    Data(B),
    Headers(Bytes),
    CancelPush(u64),
    Settings(Settings),
    PushPromise(Bytes),
    Goaway(StreamId),
    MaxPushId(u64),
    /// An empty frame in the reserved grease range, sent (never received as such;
    /// it decodes as `FrameError::UnknownFrame`) to exercise unknown-frame tolerance.
    Grease,
}

impl<B> Frame<B> {
    pub fn headers(payload: impl Into<Bytes>) -> Self {
        Frame::Headers(payload.into())
    }
}

impl<B: Buf> Frame<B> {
    pub fn payload(&self) -> Option<&dyn Buf> {
        match self {
            Frame::Data(b) => Some(b as &dyn Buf),
            Frame::Headers(h) | Frame::PushPromise(h) => Some(h as &dyn Buf),
            _ => None,
        }
    }

    pub fn payload_mut(&mut self) -> Option<&mut dyn Buf> {
        match self {
            Frame::Data(b) => Some(b as &mut dyn Buf),
            Frame::Headers(h) | Frame::PushPromise(h) => Some(h as &mut dyn Buf),
            _ => None,
        }
    }

    pub fn encode<D: BufMut>(&self, buf: &mut D) {
        match self {
            Frame::Data(d) => {
                FrameType::DATA.encode(buf);
                buf.write_var(d.remaining() as u64);
            }
            Frame::Headers(h) => {
                FrameType::HEADERS.encode(buf);
                buf.write_var(h.remaining() as u64);
            }
            Frame::CancelPush(id) => {
                FrameType::CANCEL_PUSH.encode(buf);
                buf.write_var(VarInt::from_u64(*id).unwrap().size() as u64);
                buf.write_var(*id);
            }
            Frame::Settings(s) => {
                FrameType::SETTINGS.encode(buf);
                buf.write_var(s.encoded_len() as u64);
                s.encode(buf);
            }
            Frame::PushPromise(p) => {
                FrameType::PUSH_PROMISE.encode(buf);
                buf.write_var(p.remaining() as u64);
            }
            Frame::Goaway(id) => {
                let size = VarInt::from(*id).size();
                FrameType::GOAWAY.encode(buf);
                buf.write_var(size as u64);
                VarInt::from(*id).encode(buf);
            }
            Frame::MaxPushId(id) => {
                FrameType::MAX_PUSH_ID.encode(buf);
                buf.write_var(VarInt::from_u64(*id).unwrap().size() as u64);
                buf.write_var(*id);
            }
            Frame::Grease => {
                FrameType::grease().encode(buf);
                buf.write_var(0);
            }
        }
    }

    /// Encode the frame header followed immediately by its payload bytes. Only useful
    /// in tests, where the destination is a plain contiguous buffer rather than a
    /// gathered `WriteBuf`.
    pub fn encode_with_payload<D: BufMut>(&self, buf: &mut D) {
        self.encode(buf);
        if let Some(p) = self.payload() {
            buf.put_slice(p.chunk());
        }
    }
}

impl Frame<PayloadLen> {
    /// Attempt to decode one frame header (and, for small fixed-body frames, its
    /// payload) from `buf`. Returns `FrameError::Incomplete` if not enough bytes
    /// are buffered yet, without consuming anything from `buf` in that case.
    pub fn decode<T: Buf>(buf: &mut T) -> Result<Self, FrameError> {
        let ty = FrameType::decode(buf).map_err(|_| FrameError::Incomplete(1))?;
        let len = VarInt::decode(buf).map_err(|_| FrameError::Incomplete(1))?.into_inner() as usize;

        if ty.is_grease() {
            if buf.remaining() < len {
                return Err(FrameError::Incomplete(len));
            }
            buf.advance(len);
            return Err(FrameError::UnknownFrame(ty.value()));
        }

        match ty {
            FrameType::DATA => Ok(Frame::Data(PayloadLen(len))),
            FrameType::HEADERS => {
                if buf.remaining() < len {
                    return Err(FrameError::Incomplete(len));
                }
                Ok(Frame::Headers(buf.copy_to_bytes(len)))
            }
            FrameType::PUSH_PROMISE => {
                if buf.remaining() < len {
                    return Err(FrameError::Incomplete(len));
                }
                Ok(Frame::PushPromise(buf.copy_to_bytes(len)))
            }
            FrameType::CANCEL_PUSH => {
                if buf.remaining() < len {
                    return Err(FrameError::Incomplete(len));
                }
                let mut body = buf.take(len);
                let id = body.get_var().map_err(|_| FrameError::Malformed)?;
                Ok(Frame::CancelPush(id))
            }
            FrameType::MAX_PUSH_ID => {
                if buf.remaining() < len {
                    return Err(FrameError::Incomplete(len));
                }
                let mut body = buf.take(len);
                let id = body.get_var().map_err(|_| FrameError::Malformed)?;
                Ok(Frame::MaxPushId(id))
            }
            FrameType::GOAWAY => {
                if buf.remaining() < len {
                    return Err(FrameError::Incomplete(len));
                }
                let mut body = buf.take(len);
                let id = StreamId::decode(&mut body).map_err(|_| FrameError::Malformed)?;
                Ok(Frame::Goaway(id))
            }
            FrameType::SETTINGS => {
                if buf.remaining() < len {
                    return Err(FrameError::Incomplete(len));
                }
                Ok(Frame::Settings(Settings::decode(buf, len)?))
            }
            other => {
                if buf.remaining() < len {
                    return Err(FrameError::Incomplete(len));
                }
                buf.advance(len);
                Err(FrameError::UnknownFrame(other.value()))
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameError {
    UnknownFrame(u64),
    Incomplete(usize),
    Malformed,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::UnknownFrame(ty) => write!(f, "unknown frame type 0x{ty:x}"),
            FrameError::Incomplete(min) => write!(f, "incomplete frame, need at least {min} more bytes"),
            FrameError::Malformed => write!(f, "malformed frame body"),
        }
    }
}

impl std::error::Error for FrameError {}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn settings_roundtrip() {
        let mut settings = Settings::default();
        settings.insert(Settings::QPACK_MAX_TABLE_CAPACITY, 4096);
        settings.insert(Settings::QPACK_BLOCKED_STREAMS, 100);

        let mut buf = BytesMut::new();
        Frame::<Bytes>::Settings(settings.clone()).encode_with_payload(&mut buf);

        let mut read = buf.freeze();
        match Frame::decode(&mut read).unwrap() {
            Frame::Settings(s) => assert_eq!(s, settings),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn headers_frame_roundtrip() {
        let mut buf = BytesMut::new();
        Frame::<Bytes>::headers(&b"salut"[..]).encode_with_payload(&mut buf);
        let mut read = buf.freeze();
        match Frame::decode(&mut read).unwrap() {
            Frame::Headers(h) => assert_eq!(&h[..], b"salut"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn data_frame_only_reports_length() {
        let mut buf = BytesMut::new();
        Frame::<Bytes>::Data(Bytes::from("body")).encode_with_payload(&mut buf);
        let mut read = buf.freeze();
        assert_eq!(Frame::decode(&mut read).unwrap(), Frame::Data(PayloadLen(4)));
        // the payload itself is left on the wire, not consumed by `decode`
        assert_eq!(read.remaining(), 4);
    }

    #[test]
    fn truncated_header_is_incomplete() {
        let mut buf = BytesMut::new();
        Frame::<Bytes>::headers(&b"salut"[..]).encode_with_payload(&mut buf);
        buf.truncate(buf.len() - 1);
        let mut read = buf.freeze();
        assert_eq!(Frame::decode(&mut read), Err(FrameError::Incomplete(5)));
    }

    #[test]
    fn unknown_frame_is_skipped() {
        let grease = FrameType::grease();
        let mut buf = BytesMut::new();
        grease.encode(&mut buf);
        buf.write_var(3);
        buf.put_slice(b"abc");
        let mut read = buf.freeze();
        assert_eq!(Frame::<Bytes>::decode(&mut read), Err(FrameError::UnknownFrame(grease.value())));
        assert_eq!(read.remaining(), 0);
    }

    #[test]
    fn goaway_roundtrip() {
        let mut buf = BytesMut::new();
        Frame::<Bytes>::Goaway(StreamId::from(2)).encode_with_payload(&mut buf);
        assert_eq!(&buf[..], b"\x07\x01\x02");
        let mut read = buf.freeze();
        assert_eq!(Frame::decode(&mut read).unwrap(), Frame::Goaway(StreamId::from(2)));
    }
}
