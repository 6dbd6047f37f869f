//! An in-memory, bidirectional QUIC transport standing in for a real QUIC
//! implementation.
//!
//! Generalizes the teacher's `frame.rs` unit tests' `FakeRecv` fixture (a
//! receive-only fake fed a fixed chunk queue) into a connected pair: opening a
//! stream on one side delivers the peer half to the other side's accept
//! queue, so integration tests can drive a real handshake, request, and
//! response in both directions.

#![allow(dead_code)]

use std::{
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use rh3::quic::{self, StreamId, WriteBuf};
use tokio::sync::mpsc;

/// The error type yielded by every fallible operation on this mock transport.
#[derive(Debug)]
pub struct MockError(Option<u64>);

impl fmt::Display for MockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "mock stream reset with code 0x{code:x}"),
            None => write!(f, "mock transport closed"),
        }
    }
}

impl std::error::Error for MockError {}

impl quic::Error for MockError {
    fn is_timeout(&self) -> bool {
        false
    }

    fn err_code(&self) -> Option<u64> {
        self.0
    }
}

enum Event {
    Data(Bytes),
    Fin,
    Reset(u64),
}

fn channel() -> (mpsc::UnboundedSender<Event>, mpsc::UnboundedReceiver<Event>) {
    mpsc::unbounded_channel()
}

/// The send half of a mock stream (also used standalone for unidirectional sends).
pub struct SendHalf<B> {
    id: StreamId,
    tx: mpsc::UnboundedSender<Event>,
    _buf: PhantomData<B>,
}

impl<B: Buf> quic::SendStream<B> for SendHalf<B> {
    type Error = MockError;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn send_data<T: Into<WriteBuf<B>>>(&mut self, data: T) -> Result<(), Self::Error> {
        let mut buf: WriteBuf<B> = data.into();
        let bytes = buf.copy_to_bytes(buf.remaining());
        // An unbounded channel never backs up; a dropped receiver (peer gone)
        // is silently swallowed, matching a reset stream nobody reads from.
        let _ = self.tx.send(Event::Data(bytes));
        Ok(())
    }

    fn poll_finish(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let _ = self.tx.send(Event::Fin);
        Poll::Ready(Ok(()))
    }

    fn reset(&mut self, reset_code: u64) {
        let _ = self.tx.send(Event::Reset(reset_code));
    }

    fn id(&self) -> StreamId {
        self.id
    }
}

/// The receive half of a mock stream (also used standalone for unidirectional receives).
pub struct RecvHalf<B> {
    rx: mpsc::UnboundedReceiver<Event>,
    _buf: PhantomData<B>,
}

impl<B: Buf> quic::RecvStream for RecvHalf<B> {
    type Buf = Bytes;
    type Error = MockError;

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Self::Buf>, Self::Error>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Event::Data(b))) => Poll::Ready(Ok(Some(b))),
            Poll::Ready(Some(Event::Fin)) | Poll::Ready(None) => Poll::Ready(Ok(None)),
            Poll::Ready(Some(Event::Reset(code))) => Poll::Ready(Err(MockError(Some(code)))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn stop_sending(&mut self, _error_code: u64) {
        // This mock carries no reverse signal channel for STOP_SENDING: the
        // peer's `poll_ready` always reports ready regardless, since the
        // backing channel is unbounded. Not needed by any of section 8's
        // testable properties, which observe stream resets, not stop_sending.
    }
}

/// A mock bidirectional stream: independent send/receive halves that can be
/// driven from different tasks once split.
pub struct BidiStream<B> {
    send: SendHalf<B>,
    recv: RecvHalf<B>,
}

impl<B: Buf> quic::SendStream<B> for BidiStream<B> {
    type Error = MockError;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.send.poll_ready(cx)
    }

    fn send_data<T: Into<WriteBuf<B>>>(&mut self, data: T) -> Result<(), Self::Error> {
        self.send.send_data(data)
    }

    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.send.poll_finish(cx)
    }

    fn reset(&mut self, reset_code: u64) {
        self.send.reset(reset_code)
    }

    fn id(&self) -> StreamId {
        self.send.id()
    }
}

impl<B: Buf> quic::RecvStream for BidiStream<B> {
    type Buf = Bytes;
    type Error = MockError;

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Self::Buf>, Self::Error>> {
        self.recv.poll_data(cx)
    }

    fn stop_sending(&mut self, error_code: u64) {
        self.recv.stop_sending(error_code)
    }
}

impl<B: Buf> quic::BidiStream<B> for BidiStream<B> {
    type SendStream = SendHalf<B>;
    type RecvStream = RecvHalf<B>;

    fn split(self) -> (Self::SendStream, Self::RecvStream) {
        (self.send, self.recv)
    }
}

fn bidi_pair<B: Buf>(id: StreamId) -> (BidiStream<B>, BidiStream<B>) {
    let (tx_a, rx_b) = channel();
    let (tx_b, rx_a) = channel();
    (
        BidiStream {
            send: SendHalf { id, tx: tx_a, _buf: PhantomData },
            recv: RecvHalf { rx: rx_a, _buf: PhantomData },
        },
        BidiStream {
            send: SendHalf { id, tx: tx_b, _buf: PhantomData },
            recv: RecvHalf { rx: rx_b, _buf: PhantomData },
        },
    )
}

/// Opens outgoing streams on behalf of a [`Connection`]; cheaply cloneable so
/// it can be handed to a request-sending task independent of the connection
/// driver, matching `quic::Connection::opener`'s contract.
#[derive(Clone)]
pub struct Opener<B> {
    next_bidi: Arc<AtomicU64>,
    next_uni: Arc<AtomicU64>,
    peer_bidi: mpsc::UnboundedSender<BidiStream<B>>,
    peer_uni: mpsc::UnboundedSender<RecvHalf<B>>,
}

impl<B: Buf> quic::OpenStreams<B> for Opener<B> {
    type BidiStream = BidiStream<B>;
    type SendStream = SendHalf<B>;
    type RecvStream = RecvHalf<B>;
    type Error = MockError;

    fn poll_open_bidi(&mut self, _cx: &mut Context<'_>) -> Poll<Result<Self::BidiStream, Self::Error>> {
        let n = self.next_bidi.fetch_add(1, Ordering::Relaxed);
        let id = StreamId::first_request() + n as usize;
        let (mine, theirs) = bidi_pair(id);
        let _ = self.peer_bidi.send(theirs);
        Poll::Ready(Ok(mine))
    }

    fn poll_open_send(&mut self, _cx: &mut Context<'_>) -> Poll<Result<Self::SendStream, Self::Error>> {
        let n = self.next_uni.fetch_add(1, Ordering::Relaxed);
        let id = StreamId::from(n);
        let (tx, rx) = channel();
        let send = SendHalf { id, tx, _buf: PhantomData };
        let recv = RecvHalf { rx, _buf: PhantomData };
        let _ = self.peer_uni.send(recv);
        Poll::Ready(Ok(send))
    }

    fn close(&mut self, _code: rh3::error::Code, _reason: &[u8]) {}
}

/// One end of an in-memory QUIC connection. Build a connected pair with [`pair`].
pub struct Connection<B> {
    accept_bidi: mpsc::UnboundedReceiver<BidiStream<B>>,
    accept_uni: mpsc::UnboundedReceiver<RecvHalf<B>>,
    opener: Opener<B>,
}

impl<B: Buf> quic::Connection<B> for Connection<B> {
    type BidiStream = BidiStream<B>;
    type SendStream = SendHalf<B>;
    type RecvStream = RecvHalf<B>;
    type OpenStreams = Opener<B>;
    type Error = MockError;

    fn poll_accept_recv(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Self::RecvStream>, Self::Error>> {
        self.accept_uni.poll_recv(cx).map(Ok)
    }

    fn poll_accept_bidi(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Self::BidiStream>, Self::Error>> {
        self.accept_bidi.poll_recv(cx).map(Ok)
    }

    fn poll_open_bidi(&mut self, cx: &mut Context<'_>) -> Poll<Result<Self::BidiStream, Self::Error>> {
        quic::OpenStreams::poll_open_bidi(&mut self.opener, cx)
    }

    fn poll_open_send(&mut self, cx: &mut Context<'_>) -> Poll<Result<Self::SendStream, Self::Error>> {
        quic::OpenStreams::poll_open_send(&mut self.opener, cx)
    }

    fn opener(&self) -> Self::OpenStreams {
        self.opener.clone()
    }

    fn close(&mut self, _code: rh3::error::Code, _reason: &[u8]) {}
}

/// Opener for [`Refused`]: every call fails immediately, matching the
/// connection it belongs to.
#[derive(Clone)]
pub struct RefusedOpener<B>(PhantomData<B>);

impl<B: Buf> quic::OpenStreams<B> for RefusedOpener<B> {
    type BidiStream = BidiStream<B>;
    type SendStream = SendHalf<B>;
    type RecvStream = RecvHalf<B>;
    type Error = MockError;

    fn poll_open_bidi(&mut self, _cx: &mut Context<'_>) -> Poll<Result<Self::BidiStream, Self::Error>> {
        Poll::Ready(Err(MockError(None)))
    }

    fn poll_open_send(&mut self, _cx: &mut Context<'_>) -> Poll<Result<Self::SendStream, Self::Error>> {
        Poll::Ready(Err(MockError(None)))
    }

    fn close(&mut self, _code: rh3::error::Code, _reason: &[u8]) {}
}

/// A mock connection with nobody on the other end: every operation fails
/// immediately, standing in for "connected transport, no peer ever accepts
/// the streams this endpoint needs to open" (e.g. no server listening).
pub struct Refused<B>(PhantomData<B>);

impl<B: Buf> quic::Connection<B> for Refused<B> {
    type BidiStream = BidiStream<B>;
    type SendStream = SendHalf<B>;
    type RecvStream = RecvHalf<B>;
    type OpenStreams = RefusedOpener<B>;
    type Error = MockError;

    fn poll_accept_recv(&mut self, _cx: &mut Context<'_>) -> Poll<Result<Option<Self::RecvStream>, Self::Error>> {
        Poll::Ready(Err(MockError(None)))
    }

    fn poll_accept_bidi(&mut self, _cx: &mut Context<'_>) -> Poll<Result<Option<Self::BidiStream>, Self::Error>> {
        Poll::Ready(Err(MockError(None)))
    }

    fn poll_open_bidi(&mut self, _cx: &mut Context<'_>) -> Poll<Result<Self::BidiStream, Self::Error>> {
        Poll::Ready(Err(MockError(None)))
    }

    fn poll_open_send(&mut self, _cx: &mut Context<'_>) -> Poll<Result<Self::SendStream, Self::Error>> {
        Poll::Ready(Err(MockError(None)))
    }

    fn opener(&self) -> Self::OpenStreams {
        RefusedOpener(PhantomData)
    }

    fn close(&mut self, _code: rh3::error::Code, _reason: &[u8]) {}
}

/// Build a connection that fails every operation, simulating a QUIC transport
/// with no peer ever accepting a stream (e.g. connecting to a port nobody is
/// listening on).
pub fn refused<B: Buf>() -> Refused<B> {
    Refused(PhantomData)
}

/// Build two connected mock QUIC connections: a stream opened on one side is
/// delivered to the other side's `poll_accept_bidi`/`poll_accept_recv`.
pub fn pair<B: Buf>() -> (Connection<B>, Connection<B>) {
    let (a_to_b_bidi_tx, a_to_b_bidi_rx) = mpsc::unbounded_channel();
    let (b_to_a_bidi_tx, b_to_a_bidi_rx) = mpsc::unbounded_channel();
    let (a_to_b_uni_tx, a_to_b_uni_rx) = mpsc::unbounded_channel();
    let (b_to_a_uni_tx, b_to_a_uni_rx) = mpsc::unbounded_channel();

    let a = Connection {
        accept_bidi: b_to_a_bidi_rx,
        accept_uni: b_to_a_uni_rx,
        opener: Opener {
            next_bidi: Arc::new(AtomicU64::new(0)),
            next_uni: Arc::new(AtomicU64::new(0)),
            peer_bidi: a_to_b_bidi_tx,
            peer_uni: a_to_b_uni_tx,
        },
    };
    let b = Connection {
        accept_bidi: a_to_b_bidi_rx,
        accept_uni: a_to_b_uni_rx,
        opener: Opener {
            next_bidi: Arc::new(AtomicU64::new(0)),
            next_uni: Arc::new(AtomicU64::new(0)),
            peer_bidi: b_to_a_bidi_tx,
            peer_uni: b_to_a_uni_tx,
        },
    };
    (a, b)
}
