//! Per-stream frame assembly: turns a raw `quic::RecvStream`/`SendStream` into a
//! sequence of [`Frame`]s, buffering across receive-call boundaries.

use std::marker::PhantomData;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::ready;
use tracing::trace;

use crate::{
    buf::BufList,
    error::{Code, Error, ErrorLevel, TransportError},
    proto::{
        frame::{self, Frame, PayloadLen},
        stream::StreamId,
    },
    quic::{BidiStream, RecvStream, SendStream},
    stream::WriteBuf,
};

pub struct FrameStream<S, B> {
    stream: S,
    bufs: BufList<Bytes>,
    decoder: FrameDecoder,
    remaining_data: usize,
    is_eos: bool,
    _phantom_buffer: PhantomData<B>,
}

impl<S, B> FrameStream<S, B> {
    pub fn new(stream: S) -> Self {
        Self::with_bufs(stream, BufList::new())
    }

    pub(crate) fn with_bufs(stream: S, bufs: BufList<Bytes>) -> Self {
        Self {
            stream,
            bufs,
            decoder: FrameDecoder::default(),
            remaining_data: 0,
            is_eos: false,
            _phantom_buffer: PhantomData,
        }
    }
}

impl<S, B> FrameStream<S, B>
where
    S: RecvStream,
{
    /// Poll for the next frame header. Must not be called while a `Data` frame's
    /// payload is still being drained via [`Self::poll_data`].
    pub fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Frame<PayloadLen>>, FrameStreamError>> {
        assert!(
            self.remaining_data == 0,
            "there is still data to read, call poll_data() until it returns None"
        );

        loop {
            let end = self.try_recv(cx)?;

            return match self.decoder.decode(&mut self.bufs)? {
                Some(Frame::Data(PayloadLen(len))) => {
                    self.remaining_data = len;
                    Poll::Ready(Ok(Some(Frame::Data(PayloadLen(len)))))
                }
                Some(frame) => Poll::Ready(Ok(Some(frame))),
                None => match end {
                    Poll::Ready(false) => continue,
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(true) => {
                        if self.bufs.remaining() > 0 {
                            Poll::Ready(Err(FrameStreamError::UnexpectedEnd))
                        } else {
                            Poll::Ready(Ok(None))
                        }
                    }
                },
            };
        }
    }

    pub fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>, FrameStreamError>> {
        if self.remaining_data == 0 {
            return Poll::Ready(Ok(None));
        }

        let end = ready!(self.try_recv(cx))?;
        let data = self.bufs.take_chunk(self.remaining_data);

        match (data, end) {
            (None, true) => Poll::Ready(Ok(None)),
            (None, false) => Poll::Pending,
            (Some(d), true) if d.len() < self.remaining_data && self.bufs.remaining() == 0 => {
                Poll::Ready(Err(FrameStreamError::UnexpectedEnd))
            }
            (Some(d), _) => {
                self.remaining_data -= d.len();
                Poll::Ready(Ok(Some(d)))
            }
        }
    }

    pub(crate) fn stop_sending(&mut self, error_code: crate::error::Code) {
        self.stream.stop_sending(error_code.value());
    }

    pub(crate) fn has_data(&self) -> bool {
        self.remaining_data != 0
    }

    pub(crate) fn is_eos(&self) -> bool {
        self.is_eos && self.bufs.remaining() == 0
    }

    fn try_recv(&mut self, cx: &mut Context<'_>) -> Poll<Result<bool, FrameStreamError>> {
        if self.is_eos {
            return Poll::Ready(Ok(true));
        }
        match self.stream.poll_data(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(FrameStreamError::Quic(e.into()))),
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(None)) => {
                self.is_eos = true;
                Poll::Ready(Ok(true))
            }
            Poll::Ready(Ok(Some(mut d))) => {
                self.bufs.push_bytes(&mut d);
                Poll::Ready(Ok(false))
            }
        }
    }
}

impl<T, B> SendStream<B> for FrameStream<T, B>
where
    T: SendStream<B>,
    B: Buf,
{
    type Error = <T as SendStream<B>>::Error;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.stream.poll_ready(cx)
    }

    fn send_data<D: Into<WriteBuf<B>>>(&mut self, data: D) -> Result<(), Self::Error> {
        self.stream.send_data(data)
    }

    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.stream.poll_finish(cx)
    }

    fn reset(&mut self, reset_code: u64) {
        self.stream.reset(reset_code)
    }

    fn id(&self) -> StreamId {
        self.stream.id()
    }
}

impl<S, B> FrameStream<S, B>
where
    S: BidiStream<B>,
    B: Buf,
{
    pub(crate) fn split(self) -> (FrameStream<S::SendStream, B>, FrameStream<S::RecvStream, B>) {
        let (send, recv) = self.stream.split();
        (
            FrameStream {
                stream: send,
                bufs: BufList::new(),
                decoder: FrameDecoder::default(),
                remaining_data: 0,
                is_eos: false,
                _phantom_buffer: PhantomData,
            },
            FrameStream {
                stream: recv,
                bufs: self.bufs,
                decoder: self.decoder,
                remaining_data: self.remaining_data,
                is_eos: self.is_eos,
                _phantom_buffer: PhantomData,
            },
        )
    }
}

/// Incremental frame-header parser. Remembers the minimum byte count it needs so
/// callers can keep accumulating buffers without re-parsing from scratch.
#[derive(Default)]
pub(crate) struct FrameDecoder {
    expected: Option<usize>,
}

impl FrameDecoder {
    fn decode(&mut self, src: &mut BufList<Bytes>) -> Result<Option<Frame<PayloadLen>>, FrameStreamError> {
        loop {
            if src.remaining() == 0 {
                return Ok(None);
            }

            if let Some(min) = self.expected {
                if src.remaining() < min {
                    return Ok(None);
                }
            }

            let before = src.remaining();
            let mut attempt = src.clone();
            let decoded = Frame::decode(&mut attempt);
            let consumed = before - attempt.remaining();

            match decoded {
                Err(frame::FrameError::UnknownFrame(ty)) => {
                    trace!("ignoring unknown frame type 0x{:x}", ty);
                    src.advance(consumed);
                    self.expected = None;
                    continue;
                }
                Err(frame::FrameError::Incomplete(min)) => {
                    self.expected = Some(min);
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
                Ok(frame) => {
                    src.advance(consumed);
                    self.expected = None;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum FrameStreamError {
    Proto(frame::FrameError),
    Quic(TransportError),
    UnexpectedEnd,
}

impl From<frame::FrameError> for FrameStreamError {
    fn from(err: frame::FrameError) -> Self {
        FrameStreamError::Proto(err)
    }
}

impl std::fmt::Display for FrameStreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameStreamError::Proto(e) => write!(f, "{e}"),
            FrameStreamError::Quic(e) => write!(f, "{e}"),
            FrameStreamError::UnexpectedEnd => write!(f, "stream ended mid-frame"),
        }
    }
}

impl std::error::Error for FrameStreamError {}

impl From<FrameStreamError> for Error {
    fn from(e: FrameStreamError) -> Self {
        match e {
            FrameStreamError::Quic(cause) => cause.into(),
            FrameStreamError::Proto(p) => Code::H3_FRAME_ERROR.with_reason(p.to_string(), ErrorLevel::ConnectionError),
            FrameStreamError::UnexpectedEnd => {
                Code::H3_FRAME_ERROR.with_reason("stream ended mid-frame", ErrorLevel::ConnectionError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, fmt, sync::Arc};

    use assert_matches::assert_matches;
    use bytes::BytesMut;
    use futures_util::future::poll_fn;

    use super::*;
    use crate::{proto::coding::Encode, quic};

    #[test]
    fn one_frame() {
        let mut buf = BytesMut::with_capacity(16);
        Frame::<Bytes>::headers(&b"salut"[..]).encode_with_payload(&mut buf);
        let mut list = BufList::from(buf);

        let mut decoder = FrameDecoder::default();
        assert_matches!(decoder.decode(&mut list), Ok(Some(Frame::Headers(_))));
    }

    #[test]
    fn incomplete_frame() {
        let mut buf = BytesMut::with_capacity(16);
        Frame::<Bytes>::headers(&b"salut"[..]).encode_with_payload(&mut buf);
        buf.truncate(buf.len() - 1);
        let mut list = BufList::from(buf);

        let mut decoder = FrameDecoder::default();
        assert_matches!(decoder.decode(&mut list), Ok(None));
    }

    #[test]
    fn header_spread_over_two_buffers() {
        let mut buf = BytesMut::with_capacity(16);
        Frame::<Bytes>::headers(&b"salut"[..]).encode_with_payload(&mut buf);
        let buf = buf.freeze();

        let mut list = BufList::new();
        list.push(buf.slice(0..1));
        list.push(buf.slice(1..));

        let mut decoder = FrameDecoder::default();
        assert_matches!(decoder.decode(&mut list), Ok(Some(Frame::Headers(_))));
    }

    #[test]
    fn two_frames_then_incomplete() {
        let mut buf = BytesMut::with_capacity(64);
        Frame::<Bytes>::headers(&b"header"[..]).encode_with_payload(&mut buf);
        Frame::Data(Bytes::from_static(b"body")).encode_with_payload(&mut buf);
        Frame::<Bytes>::headers(&b"trailer"[..]).encode_with_payload(&mut buf);
        buf.truncate(buf.len() - 1);
        let mut list = BufList::from(buf);

        let mut decoder = FrameDecoder::default();
        assert_matches!(decoder.decode(&mut list), Ok(Some(Frame::Headers(_))));
        assert_matches!(decoder.decode(&mut list), Ok(Some(Frame::Data(PayloadLen(4)))));
        assert_matches!(decoder.decode(&mut list), Ok(None));
    }

    #[derive(Default)]
    struct FakeRecv {
        chunks: VecDeque<Bytes>,
    }

    impl FakeRecv {
        fn chunk(&mut self, buf: Bytes) -> &mut Self {
            self.chunks.push_back(buf);
            self
        }
    }

    impl RecvStream for FakeRecv {
        type Buf = Bytes;
        type Error = FakeError;

        fn poll_data(&mut self, _: &mut Context<'_>) -> Poll<Result<Option<Self::Buf>, Self::Error>> {
            Poll::Ready(Ok(self.chunks.pop_front()))
        }

        fn stop_sending(&mut self, _: u64) {
            unimplemented!()
        }
    }

    #[derive(Debug)]
    struct FakeError;

    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "fake error")
        }
    }

    impl std::error::Error for FakeError {}

    impl quic::Error for FakeError {
        fn is_timeout(&self) -> bool {
            false
        }

        fn err_code(&self) -> Option<u64> {
            None
        }
    }

    #[tokio::test]
    async fn poll_full_request() {
        let mut recv = FakeRecv::default();
        let mut buf = BytesMut::with_capacity(64);
        Frame::<Bytes>::headers(&b"header"[..]).encode_with_payload(&mut buf);
        Frame::Data(Bytes::from_static(b"body")).encode_with_payload(&mut buf);
        Frame::<Bytes>::headers(&b"trailer"[..]).encode_with_payload(&mut buf);
        recv.chunk(buf.freeze());

        let mut stream: FrameStream<_, Bytes> = FrameStream::new(recv);

        assert_matches!(poll_fn(|cx| stream.poll_next(cx)).await, Ok(Some(Frame::Headers(_))));
        assert_matches!(poll_fn(|cx| stream.poll_next(cx)).await, Ok(Some(Frame::Data(PayloadLen(4)))));
        assert_matches!(poll_fn(|cx| stream.poll_data(cx)).await, Ok(Some(b)) if b.len() == 4);
        assert_matches!(poll_fn(|cx| stream.poll_next(cx)).await, Ok(Some(Frame::Headers(_))));
    }

    #[tokio::test]
    async fn poll_data_ignores_unknown_frames() {
        let mut recv = FakeRecv::default();
        let mut buf = BytesMut::with_capacity(64);
        frame::FrameType::grease().encode(&mut buf);
        crate::proto::coding::BufMutExt::write_var(&mut buf, 0);
        Frame::Data(Bytes::from_static(b"body")).encode_with_payload(&mut buf);
        recv.chunk(buf.freeze());

        let mut stream: FrameStream<_, Bytes> = FrameStream::new(recv);
        assert_matches!(poll_fn(|cx| stream.poll_next(cx)).await, Ok(Some(Frame::Data(PayloadLen(4)))));
        assert_matches!(
            poll_fn(|cx| stream.poll_data(cx)).await,
            Ok(Some(b)) if &b[..] == b"body"
        );
    }

    #[tokio::test]
    async fn poll_data_unexpected_end() {
        let mut recv = FakeRecv::default();
        let mut buf = BytesMut::with_capacity(64);
        crate::proto::coding::Encode::encode(&frame::FrameType::DATA, &mut buf);
        crate::proto::coding::BufMutExt::write_var(&mut buf, 4);
        buf.extend_from_slice(b"b");
        recv.chunk(buf.freeze());

        let mut stream: FrameStream<_, Bytes> = FrameStream::new(recv);
        assert_matches!(poll_fn(|cx| stream.poll_next(cx)).await, Ok(Some(Frame::Data(PayloadLen(4)))));
        assert_matches!(poll_fn(|cx| stream.poll_data(cx)).await, Err(FrameStreamError::UnexpectedEnd));
    }
}
