//! Unidirectional stream role identification and the stack-buffered frame/stream-type
//! write helper shared by every send path.

use std::task::{Context, Poll};

use bytes::{Buf, BufMut as _, Bytes};
use futures_util::{future, ready};

use crate::{
    buf::BufList,
    error::{Code, Error, ErrorLevel},
    frame::FrameStream,
    proto::{
        self,
        coding::{Decode as _, Encode},
        frame::Frame,
        stream::StreamType,
        varint::VarInt,
    },
    quic::{self, RecvStream, SendStream},
};

#[inline]
pub(crate) async fn write<S, D, B>(stream: &mut S, data: D) -> Result<(), Error>
where
    S: SendStream<B>,
    D: Into<WriteBuf<B>>,
    B: Buf,
{
    stream.send_data(data)?;
    future::poll_fn(|cx| stream.poll_ready(cx)).await?;
    Ok(())
}

const WRITE_BUF_ENCODE_SIZE: usize = StreamType::MAX_ENCODED_SIZE + proto::frame::MAX_ENCODED_SIZE;

/// Encodes a stream-type byte and/or a frame header on the stack before the
/// payload, so callers never need to allocate just to prefix wire data.
pub struct WriteBuf<B>
where
    B: Buf,
{
    buf: [u8; WRITE_BUF_ENCODE_SIZE],
    len: usize,
    pos: usize,
    frame: Option<Frame<B>>,
}

impl<B> WriteBuf<B>
where
    B: Buf,
{
    fn encode_stream_type(&mut self, ty: StreamType) {
        let mut buf_mut = &mut self.buf[self.len..];
        ty.encode(&mut buf_mut);
        self.len = WRITE_BUF_ENCODE_SIZE - buf_mut.remaining_mut();
    }

    fn encode_frame_header(&mut self) {
        if let Some(frame) = self.frame.as_ref() {
            let mut buf_mut = &mut self.buf[self.len..];
            frame.encode(&mut buf_mut);
            self.len = WRITE_BUF_ENCODE_SIZE - buf_mut.remaining_mut();
        }
    }
}

impl<B> From<StreamType> for WriteBuf<B>
where
    B: Buf,
{
    fn from(ty: StreamType) -> Self {
        let mut me = Self {
            buf: [0; WRITE_BUF_ENCODE_SIZE],
            len: 0,
            pos: 0,
            frame: None,
        };
        me.encode_stream_type(ty);
        me
    }
}

impl<B> From<Frame<B>> for WriteBuf<B>
where
    B: Buf,
{
    fn from(frame: Frame<B>) -> Self {
        let mut me = Self {
            buf: [0; WRITE_BUF_ENCODE_SIZE],
            len: 0,
            pos: 0,
            frame: Some(frame),
        };
        me.encode_frame_header();
        me
    }
}

impl<B> From<(StreamType, Frame<B>)> for WriteBuf<B>
where
    B: Buf,
{
    fn from((ty, frame): (StreamType, Frame<B>)) -> Self {
        let mut me = Self {
            buf: [0; WRITE_BUF_ENCODE_SIZE],
            len: 0,
            pos: 0,
            frame: Some(frame),
        };
        me.encode_stream_type(ty);
        me.encode_frame_header();
        me
    }
}

impl<B> Buf for WriteBuf<B>
where
    B: Buf,
{
    fn remaining(&self) -> usize {
        self.len - self.pos + self.frame.as_ref().and_then(|f| f.payload()).map_or(0, |x| x.remaining())
    }

    fn chunk(&self) -> &[u8] {
        if self.len - self.pos > 0 {
            &self.buf[self.pos..self.len]
        } else if let Some(payload) = self.frame.as_ref().and_then(|f| f.payload()) {
            payload.chunk()
        } else {
            &[]
        }
    }

    fn advance(&mut self, mut cnt: usize) {
        let remaining_header = self.len - self.pos;
        if remaining_header > 0 {
            let advanced = usize::min(cnt, remaining_header);
            self.pos += advanced;
            cnt -= advanced;
        }

        if let Some(payload) = self.frame.as_mut().and_then(|f| f.payload_mut()) {
            payload.advance(cnt);
        }
    }
}

/// A peer-initiated unidirectional stream, once its role has been resolved.
pub(crate) enum AcceptedRecvStream<S, B>
where
    S: quic::RecvStream,
{
    Control(FrameStream<S, B>),
    Push(FrameStream<S, B>),
    Encoder(S),
    Decoder(S),
    /// A stream type in the reserved grease range; bytes are discarded.
    Reserved,
}

/// Reads the leading varint(s) off a freshly accepted unidirectional stream to
/// determine its role, buffering bytes across as many `poll_data` calls as needed.
pub(crate) struct AcceptRecvStream<S>
where
    S: quic::RecvStream,
{
    stream: S,
    ty: Option<StreamType>,
    buf: BufList<Bytes>,
    expected: Option<usize>,
}

impl<S> AcceptRecvStream<S>
where
    S: RecvStream,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            ty: None,
            buf: BufList::new(),
            expected: None,
        }
    }

    pub fn into_stream<B>(self) -> Result<AcceptedRecvStream<S, B>, Error> {
        let ty = self.ty.expect("stream type not resolved yet");
        Ok(match ty {
            StreamType::CONTROL => AcceptedRecvStream::Control(FrameStream::with_bufs(self.stream, self.buf)),
            StreamType::PUSH => {
                // Server push is not implemented by this crate; the stream is identified
                // only so it can be reported and aborted by the caller.
                AcceptedRecvStream::Push(FrameStream::with_bufs(self.stream, self.buf))
            }
            StreamType::ENCODER => AcceptedRecvStream::Encoder(self.stream),
            StreamType::DECODER => AcceptedRecvStream::Decoder(self.stream),
            t if t.is_grease() => AcceptedRecvStream::Reserved,
            t => {
                return Err(Code::H3_STREAM_CREATION_ERROR
                    .with_reason(format!("unknown stream type 0x{:x}", t.value()), ErrorLevel::ConnectionError))
            }
        })
    }

    pub fn ty(&self) -> Option<StreamType> {
        self.ty
    }

    pub fn poll_type(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        loop {
            if self.ty.is_some() {
                return Poll::Ready(Ok(()));
            }

            match ready!(self.stream.poll_data(cx))? {
                Some(mut b) => self.buf.push_bytes(&mut b),
                None => {
                    return Poll::Ready(Err(Code::H3_STREAM_CREATION_ERROR
                        .with_reason("stream closed before type received", ErrorLevel::ConnectionError)));
                }
            }

            if self.expected.is_none() && self.buf.remaining() >= 1 {
                self.expected = Some(VarInt::encoded_size(self.buf.chunk()[0]));
            }

            match self.expected {
                Some(expected) if self.buf.remaining() >= expected => {}
                _ => continue,
            }

            self.ty = Some(StreamType::decode(&mut self.buf).map_err(|_| {
                Code::H3_INTERNAL_ERROR.with_reason("unexpected end parsing stream type", ErrorLevel::ConnectionError)
            })?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::stream::StreamId;

    #[test]
    fn write_buf_encode_streamtype() {
        let wbuf = WriteBuf::<Bytes>::from(StreamType::ENCODER);
        assert_eq!(wbuf.chunk(), b"\x02");
    }

    #[test]
    fn write_buf_encode_frame() {
        let wbuf = WriteBuf::<Bytes>::from(Frame::Goaway(StreamId::from(2)));
        assert_eq!(wbuf.chunk(), b"\x07\x01\x02");
    }

    #[test]
    fn write_buf_encode_streamtype_then_frame() {
        let wbuf = WriteBuf::<Bytes>::from((StreamType::ENCODER, Frame::Goaway(StreamId::from(2))));
        assert_eq!(wbuf.chunk(), b"\x02\x07\x01\x02");
    }

    #[test]
    fn write_buf_advances() {
        let mut wbuf = WriteBuf::<Bytes>::from((StreamType::ENCODER, Frame::Data(Bytes::from("hey"))));
        assert_eq!(wbuf.chunk(), b"\x02\x00\x03");
        wbuf.advance(3);
        assert_eq!(wbuf.remaining(), 3);
        assert_eq!(wbuf.chunk(), b"hey");
        wbuf.advance(2);
        assert_eq!(wbuf.chunk(), b"y");
        wbuf.advance(1);
        assert_eq!(wbuf.remaining(), 0);
    }

    #[test]
    fn write_buf_advance_jumps_header_and_payload() {
        let mut wbuf = WriteBuf::<Bytes>::from((StreamType::ENCODER, Frame::Data(Bytes::from("hey"))));
        wbuf.advance(4);
        assert_eq!(wbuf.chunk(), b"ey");
    }
}
