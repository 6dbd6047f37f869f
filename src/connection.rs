//! Per-connection control-plane state: the mandatory control/encoder/decoder
//! unidirectional streams, SETTINGS exchange, GOAWAY bookkeeping, and the QPACK
//! engines shared with every request stream on the connection.

use std::{
    collections::HashMap,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::{future, ready};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Notify;
use tracing::warn;

use crate::{
    config,
    error::{Code, Error, ErrorLevel},
    frame::FrameStream,
    proto::{
        frame::{Frame, PayloadLen, Settings},
        headers::Header,
        stream::{StreamId, StreamType},
        varint::VarInt,
    },
    qpack::{
        self,
        decoder::{DecodeOutcome, Decoder},
        encoder::Encoder,
        stream::{DecoderInstruction, EncoderInstruction},
    },
    quic::{self, Connection as _, RecvStream as _, SendStream as _},
    stream::{self, AcceptRecvStream, AcceptedRecvStream},
};

/// State shared between a connection's driver and every request stream it owns:
/// the QPACK engines (owned here, borrowed by streams one encode/decode at a time),
/// peer-advertised limits, and GOAWAY/error bookkeeping.
#[doc(hidden)]
pub struct SharedState {
    pub peer_max_field_section_size: u64,
    /// The peer's advertised `QPACK_BLOCKED_STREAMS` (RFC 9204 section 2.1.2):
    /// the most streams this side may leave blocked, parked in
    /// `RequestStream::decode_headers`, at once. `VarInt::MAX` until the peer's
    /// SETTINGS frame arrives.
    pub peer_blocked_streams: u64,
    /// Request streams currently parked in `decode_field_section`'s `Blocked`
    /// outcome, keyed by stream ID. Checked against `peer_blocked_streams` before
    /// a stream is allowed to park.
    pub blocked_streams: std::collections::HashSet<u64>,
    pub error: Option<Error>,
    pub closing: Option<StreamId>,
    pub qpack_encoder: Encoder,
    pub qpack_decoder: Decoder,
    /// Encoder-stream instruction bytes queued for the local ENCODER unistream;
    /// drained by `ConnectionInner::poll_flush_qpack`.
    pub encoder_stream_out: BytesMut,
    /// Decoder-stream instruction bytes (acks, cancellations, increments) queued
    /// for the local DECODER unistream.
    pub decoder_stream_out: BytesMut,
    /// Dynamic-table indices a request stream's outgoing header block referenced,
    /// held until the peer's `HeaderAck`/`StreamCancel` releases them.
    pub outstanding_refs: HashMap<u64, Vec<u64>>,
}

#[derive(Clone)]
#[doc(hidden)]
pub struct SharedStateRef {
    state: Arc<RwLock<SharedState>>,
    /// Woken whenever the QPACK decoder's insert count advances, so a request
    /// stream blocked on `decode_field_section` knows to retry.
    qpack_progress: Arc<Notify>,
}

impl SharedStateRef {
    pub fn read(&self) -> RwLockReadGuard<'_, SharedState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SharedState> {
        self.state.write()
    }

    pub async fn wait_for_qpack_progress(&self) {
        self.qpack_progress.notified().await;
    }

    fn notify_qpack_progress(&self) {
        self.qpack_progress.notify_waiters();
    }
}

impl Default for SharedStateRef {
    fn default() -> Self {
        Self {
            state: Arc::new(RwLock::new(SharedState {
                peer_max_field_section_size: VarInt::MAX.into_inner(),
                peer_blocked_streams: VarInt::MAX.into_inner(),
                blocked_streams: std::collections::HashSet::new(),
                error: None,
                closing: None,
                qpack_encoder: Encoder::new(),
                qpack_decoder: Decoder::new(),
                encoder_stream_out: BytesMut::new(),
                decoder_stream_out: BytesMut::new(),
                outstanding_refs: HashMap::new(),
            })),
            qpack_progress: Arc::new(Notify::new()),
        }
    }
}

pub trait ConnectionState {
    fn shared_state(&self) -> &SharedStateRef;

    fn maybe_conn_err<E: Into<Error>>(&self, err: E) -> Error {
        if let Some(ref e) = self.shared_state().read().error {
            e.clone()
        } else {
            err.into()
        }
    }
}

pub struct ConnectionInner<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    pub(super) shared: SharedStateRef,
    conn: C,
    control_send: C::SendStream,
    control_recv: Option<FrameStream<C::RecvStream, B>>,
    qpack_encoder_send: C::SendStream,
    qpack_decoder_send: C::SendStream,
    /// Peer's ENCODER unistream: raw bytes, parsed as a stream of `EncoderInstruction`.
    peer_encoder_recv: Option<C::RecvStream>,
    peer_encoder_buf: BytesMut,
    /// Peer's DECODER unistream: raw bytes, parsed as a stream of `DecoderInstruction`.
    peer_decoder_recv: Option<C::RecvStream>,
    peer_decoder_buf: BytesMut,
    pending_recv_streams: Vec<AcceptRecvStream<C::RecvStream>>,
    last_accepted_stream: Option<StreamId>,
    got_peer_settings: bool,
    pub(super) send_grease_frame: bool,
}

impl<C, B> ConnectionInner<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    pub async fn new(mut conn: C, settings: &config::Settings, shared: SharedStateRef) -> Result<Self, Error> {
        //= https://www.rfc-editor.org/rfc/rfc9114#section-6.2
        //# Endpoints SHOULD create the HTTP control stream as well as the
        //# unidirectional streams required by mandatory extensions (such as the
        //# QPACK encoder and decoder streams) first, and then create additional
        //# streams as allowed by their peer.
        let mut control_send = open_send(&mut conn).await?;
        let mut qpack_encoder_send = open_send(&mut conn).await?;
        let mut qpack_decoder_send = open_send(&mut conn).await?;

        let mut local_settings = Settings::default();
        local_settings.insert(Settings::QPACK_MAX_TABLE_CAPACITY, settings.qpack_max_table_capacity);
        local_settings.insert(Settings::QPACK_BLOCKED_STREAMS, settings.qpack_blocked_streams);
        local_settings.insert(Settings::MAX_FIELD_SECTION_SIZE, settings.max_field_section_size);

        if settings.send_grease {
            //= https://www.rfc-editor.org/rfc/rfc9114#section-7.2.4.1
            //# Setting identifiers of the format 0x1f * N + 0x21 for non-negative
            //# integer values of N are reserved to exercise the requirement that
            //# unknown identifiers be ignored.
            local_settings.insert(0x1f * 2 + 0x21, 0);
        }

        //= https://www.rfc-editor.org/rfc/rfc9114#section-3.2
        //# After the QUIC connection is established, a SETTINGS frame MUST be
        //# sent by each endpoint as the initial frame of their respective HTTP
        //# control stream.
        stream::write(&mut control_send, (StreamType::CONTROL, Frame::Settings(local_settings))).await?;
        stream::write(&mut qpack_encoder_send, StreamType::ENCODER).await?;
        stream::write(&mut qpack_decoder_send, StreamType::DECODER).await?;

        {
            let mut guard = shared.write();
            let state = &mut *guard;
            state
                .qpack_encoder
                .set_capacity(settings.qpack_max_table_capacity as usize, &mut state.encoder_stream_out);
        }

        let mut conn_inner = Self {
            shared,
            conn,
            control_send,
            control_recv: None,
            qpack_encoder_send,
            qpack_decoder_send,
            peer_encoder_recv: None,
            peer_encoder_buf: BytesMut::new(),
            peer_decoder_recv: None,
            peer_decoder_buf: BytesMut::new(),
            pending_recv_streams: Vec::with_capacity(3),
            last_accepted_stream: None,
            got_peer_settings: false,
            send_grease_frame: settings.send_grease,
        };

        if settings.send_grease {
            //= https://www.rfc-editor.org/rfc/rfc9114#section-6.2.3
            //# Stream types of the format 0x1f * N + 0x21 ... have no semantics,
            //# and they MAY be sent on connections where no data is currently
            //# being transferred.
            conn_inner.start_grease_stream().await;
        }

        Ok(conn_inner)
    }

    /// Initiate graceful shutdown, accepting `max_streams` potentially in-flight streams.
    pub async fn shutdown(&mut self, max_streams: usize) -> Result<(), Error> {
        let max_id = self
            .last_accepted_stream
            .map(|id| id + max_streams)
            .unwrap_or_else(StreamId::first_request);

        self.shared.write().closing = Some(max_id);

        //= https://www.rfc-editor.org/rfc/rfc9114#section-3.3
        //# the terminating endpoint SHOULD first send a GOAWAY frame so that
        //# both endpoints can reliably determine whether previously sent
        //# frames have been processed.
        stream::write(&mut self.control_send, Frame::Goaway(max_id)).await
    }

    pub fn poll_accept_request(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<C::BidiStream>, Error>> {
        if let Some(ref e) = self.shared.read().error {
            return Poll::Ready(Err(e.clone()));
        }

        match ready!(self.conn.poll_accept_bidi(cx)) {
            Ok(stream) => Poll::Ready(Ok(stream)),
            Err(e) => Poll::Ready(Err(e.into().into())),
        }
    }

    pub fn poll_accept_recv(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        if let Some(ref e) = self.shared.read().error {
            return Poll::Ready(Err(e.clone()));
        }

        loop {
            match self.conn.poll_accept_recv(cx) {
                Poll::Ready(Ok(Some(recv))) => self.pending_recv_streams.push(AcceptRecvStream::new(recv)),
                Poll::Ready(Ok(None)) => {
                    return Poll::Ready(Err(
                        Code::H3_GENERAL_PROTOCOL_ERROR.with_reason("connection closed unexpectedly", ErrorLevel::ConnectionError)
                    ))
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into().into())),
                Poll::Pending => break,
            }
        }

        let mut resolved = vec![];
        for (index, pending) in self.pending_recv_streams.iter_mut().enumerate() {
            if let Poll::Ready(()) = pending.poll_type(cx)? {
                resolved.push(index);
            }
        }

        for (removed, index) in resolved.into_iter().enumerate() {
            let raw = self.pending_recv_streams.remove(index - removed);
            let ty = raw.ty().expect("stream type resolved");
            match ty {
                //= https://www.rfc-editor.org/rfc/rfc9114#section-6.2.1
                //# Only one control stream per peer is permitted; receipt of a
                //# second stream claiming to be a control stream MUST be treated
                //# as a connection error of type H3_STREAM_CREATION_ERROR.
                StreamType::CONTROL => {
                    if self.control_recv.is_some() {
                        return Poll::Ready(Err(self.close(Code::H3_STREAM_CREATION_ERROR, "got two control streams")));
                    }
                    match raw.into_stream::<B>()? {
                        AcceptedRecvStream::Control(s) => self.control_recv = Some(s),
                        _ => unreachable!(),
                    }
                }
                StreamType::ENCODER => {
                    if let AcceptedRecvStream::Encoder(s) = raw.into_stream::<B>()? {
                        if self.peer_encoder_recv.replace(s).is_some() {
                            return Poll::Ready(Err(
                                self.close(Code::H3_STREAM_CREATION_ERROR, "got two encoder streams")
                            ));
                        }
                    }
                }
                StreamType::DECODER => {
                    if let AcceptedRecvStream::Decoder(s) = raw.into_stream::<B>()? {
                        if self.peer_decoder_recv.replace(s).is_some() {
                            return Poll::Ready(Err(
                                self.close(Code::H3_STREAM_CREATION_ERROR, "got two decoder streams")
                            ));
                        }
                    }
                }
                //= https://www.rfc-editor.org/rfc/rfc9114#section-6.2.3
                //# Endpoints MUST NOT consider these streams to have any meaning
                //# upon receipt.
                _ => (),
            }
        }

        Poll::Pending
    }

    /// Pump the peer's encoder/decoder unistreams into our QPACK state, and flush
    /// our own queued encoder/decoder instruction bytes back out.
    pub fn poll_qpack(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        if let Poll::Ready(Err(e)) = self.poll_accept_recv(cx) {
            return Poll::Ready(Err(e));
        }

        let mut progressed = false;
        if let Some(recv) = self.peer_encoder_recv.as_mut() {
            while let Poll::Ready(Some(mut chunk)) = recv.poll_data(cx)? {
                self.peer_encoder_buf.extend_from_slice(chunk.chunk());
                chunk.advance(chunk.remaining());
            }
            let mut frozen = self.peer_encoder_buf.clone().freeze();
            loop {
                let before = frozen.remaining();
                match EncoderInstruction::decode(&mut frozen) {
                    Ok(instr) => {
                        let consumed = before - frozen.remaining();
                        self.peer_encoder_buf.advance(consumed);
                        let ack = {
                            let mut state = self.shared.write();
                            state.qpack_decoder.on_encoder_instruction(instr)?
                        };
                        progressed = true;
                        if let Some(instr) = ack {
                            let mut state = self.shared.write();
                            instr.encode(&mut state.decoder_stream_out);
                        }
                    }
                    Err(_) => break,
                }
            }
        }

        if let Some(recv) = self.peer_decoder_recv.as_mut() {
            while let Poll::Ready(Some(mut chunk)) = recv.poll_data(cx)? {
                self.peer_decoder_buf.extend_from_slice(chunk.chunk());
                chunk.advance(chunk.remaining());
            }
            let mut frozen = self.peer_decoder_buf.clone().freeze();
            loop {
                let before = frozen.remaining();
                match DecoderInstruction::decode(&mut frozen) {
                    Ok(instr) => {
                        let consumed = before - frozen.remaining();
                        self.peer_decoder_buf.advance(consumed);
                        self.apply_decoder_instruction(instr);
                    }
                    Err(_) => break,
                }
            }
        }

        if progressed {
            self.shared.notify_qpack_progress();
        }

        self.poll_flush_qpack(cx)
    }

    fn apply_decoder_instruction(&mut self, instr: DecoderInstruction) {
        let mut state = self.shared.write();
        match instr {
            DecoderInstruction::HeaderAck(stream_id) | DecoderInstruction::StreamCancel(stream_id) => {
                if let Some(indices) = state.outstanding_refs.remove(&stream_id) {
                    state.qpack_encoder.release(&indices);
                }
            }
            DecoderInstruction::InsertCountIncrement(_) => {
                // Informational only in this implementation: the encoder reads the
                // table's own insert count directly rather than tracking the
                // decoder's separately-reported running total.
            }
        }
    }

    fn poll_flush_qpack(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let (encoder_bytes, decoder_bytes) = {
            let mut state = self.shared.write();
            (state.encoder_stream_out.split(), state.decoder_stream_out.split())
        };
        if !encoder_bytes.is_empty() {
            self.qpack_encoder_send.send_data(encoder_bytes.freeze())?;
            let _ = self.qpack_encoder_send.poll_ready(cx)?;
        }
        if !decoder_bytes.is_empty() {
            self.qpack_decoder_send.send_data(decoder_bytes.freeze())?;
            let _ = self.qpack_decoder_send.poll_ready(cx)?;
        }
        Poll::Pending
    }

    pub fn poll_control(&mut self, cx: &mut Context<'_>) -> Poll<Result<Frame<PayloadLen>, Error>> {
        if let Some(ref e) = self.shared.read().error {
            return Poll::Ready(Err(e.clone()));
        }

        loop {
            match self.poll_accept_recv(cx) {
                Poll::Ready(Ok(())) => continue,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending if self.control_recv.is_none() => return Poll::Pending,
                _ => break,
            }
        }
        let _ = self.poll_qpack(cx);

        let recvd = ready!(self.control_recv.as_mut().expect("control_recv").poll_next(cx))?;

        let res = match recvd {
            //= https://www.rfc-editor.org/rfc/rfc9114#section-6.2.1
            //# If either control stream is closed at any point, this MUST be
            //# treated as a connection error of type H3_CLOSED_CRITICAL_STREAM.
            None => Err(self.close(Code::H3_CLOSED_CRITICAL_STREAM, "control stream closed")),
            Some(frame) => match frame {
                Frame::Settings(settings) if !self.got_peer_settings => {
                    self.got_peer_settings = true;
                    let mut state = self.shared.write();
                    state.peer_max_field_section_size =
                        settings.get(Settings::MAX_FIELD_SECTION_SIZE).unwrap_or(VarInt::MAX.into_inner());
                    state.peer_blocked_streams = settings.get(Settings::QPACK_BLOCKED_STREAMS).unwrap_or(VarInt::MAX.into_inner());
                    drop(state);
                    Ok(Frame::Settings(settings))
                }
                Frame::Goaway(id) => {
                    let closing = self.shared.read().closing;
                    match closing {
                        Some(closing_id) if matches_direction(closing_id, id) => {
                            //= https://www.rfc-editor.org/rfc/rfc9114#section-5.2
                            //# the identifier in each frame MUST NOT be greater than the
                            //# identifier in any previous frame.
                            if id <= closing_id {
                                self.shared.write().closing = Some(id);
                                Ok(Frame::Goaway(id))
                            } else {
                                Err(self.close(
                                    Code::H3_ID_ERROR,
                                    format!("received a GoAway({id:?}) greater than the former one ({closing_id:?})"),
                                ))
                            }
                        }
                        Some(_) => Ok(Frame::Goaway(id)),
                        None => {
                            self.shared.write().closing = Some(id);
                            Ok(Frame::Goaway(id))
                        }
                    }
                }
                f @ Frame::CancelPush(_) | f @ Frame::MaxPushId(_) => {
                    if self.got_peer_settings {
                        Ok(f)
                    } else {
                        //= https://www.rfc-editor.org/rfc/rfc9114#section-6.2.1
                        //# If the first frame of the control stream is any other frame
                        //# type, this MUST be treated as a connection error of type
                        //# H3_MISSING_SETTINGS.
                        Err(self.close(Code::H3_MISSING_SETTINGS, format!("received {f:?} before settings on control stream")))
                    }
                }
                //= https://www.rfc-editor.org/rfc/rfc9114#section-4.1
                //# Receipt of an invalid sequence of frames MUST be treated as a
                //# connection error of type H3_FRAME_UNEXPECTED.
                frame => Err(self.close(Code::H3_FRAME_UNEXPECTED, format!("on control stream: {frame:?}"))),
            },
        };
        Poll::Ready(res)
    }

    pub fn start_stream(&mut self, id: StreamId) {
        self.last_accepted_stream = Some(id);
    }

    pub fn close<T: AsRef<str>>(&mut self, code: Code, reason: T) -> Error {
        let err = code.with_reason(reason.as_ref(), ErrorLevel::ConnectionError);
        self.shared.write().error = Some(err.clone());
        self.conn.close(code, reason.as_ref().as_bytes());
        err
    }

    /// https://www.rfc-editor.org/rfc/rfc9114.html#stream-grease
    async fn start_grease_stream(&mut self) {
        let mut grease_stream = match open_send(&mut self.conn).await {
            Err(err) => {
                warn!("grease stream creation failed with {}", err);
                return;
            }
            Ok(grease) => grease,
        };

        //= https://www.rfc-editor.org/rfc/rfc9114#section-6.2.3
        //# Stream types of the format 0x1f * N + 0x21 ... have no semantics,
        //# and they MAY be sent on connections where no data is currently
        //# being transferred.
        if let Err(err) = stream::write(&mut grease_stream, (StreamType::grease(), Frame::Grease)).await {
            warn!("write data on grease stream failed with {}", err);
            return;
        }

        if let Err(e) = future::poll_fn(|cx| grease_stream.poll_finish(cx))
            .await
            .map_err(|e| Code::H3_NO_ERROR.with_transport(e))
        {
            warn!("grease stream error on close {}", e);
        }
    }
}

async fn open_send<C, B>(conn: &mut C) -> Result<C::SendStream, Error>
where
    C: quic::Connection<B>,
    B: Buf,
{
    future::poll_fn(|cx| conn.poll_open_send(cx))
        .await
        .map_err(|e| Code::H3_STREAM_CREATION_ERROR.with_transport(e))
}

fn matches_direction(a: StreamId, b: StreamId) -> bool {
    a.initiator() == b.initiator()
}

/// Per-stream receive backpressure gate (section 4.6's async-receive flow control):
/// an application may report a received chunk as not fully consumed, which disables
/// further delivery until it calls [`ReceiveControl::complete_receive`].
struct ReceiveGate {
    enabled: std::sync::atomic::AtomicBool,
    notify: Notify,
}

impl ReceiveGate {
    fn new() -> Self {
        Self {
            enabled: std::sync::atomic::AtomicBool::new(true),
            notify: Notify::new(),
        }
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, std::sync::atomic::Ordering::SeqCst);
        if enabled {
            self.notify.notify_waiters();
        }
    }

    async fn wait_until_enabled(&self) {
        loop {
            // Subscribe before re-checking: a `set_enabled(true)` landing between the
            // check and the `.await` below is still observed, since `Notify::notified()`
            // captures a concurrent wake-up from the moment it's created.
            let notified = self.notify.notified();
            if self.enabled.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// A cheaply-clonable handle to a request stream's receive gate, usable from outside
/// the task that's driving [`RequestStream::recv_data`].
#[derive(Clone)]
pub struct ReceiveControl(Arc<ReceiveGate>);

impl ReceiveControl {
    /// Enable or disable delivery of further received data. Disabling does not
    /// interrupt a chunk already returned by `recv_data`; it only pauses the next one.
    pub fn set_receive_enabled(&self, enabled: bool) {
        self.0.set_enabled(enabled);
    }

    /// Acknowledge that `len` bytes of a previously delivered chunk were consumed
    /// and resume delivery. `len` is recorded for parity with the event-driven API
    /// surface; this stream has no byte-level replay buffer to trim against it.
    pub fn complete_receive(&self, _len: usize) {
        self.0.set_enabled(true);
    }
}

pub struct RequestStream<S, B> {
    pub(super) id: StreamId,
    pub(super) stream: FrameStream<S, B>,
    pub(super) trailers: Option<Bytes>,
    pub(super) conn_state: SharedStateRef,
    pub(super) max_field_section_size: u64,
    send_grease_frame: bool,
    receive_gate: Arc<ReceiveGate>,
}

impl<S, B> RequestStream<S, B> {
    pub fn new(
        id: StreamId,
        stream: FrameStream<S, B>,
        max_field_section_size: u64,
        conn_state: SharedStateRef,
        grease: bool,
    ) -> Self {
        Self {
            id,
            stream,
            conn_state,
            max_field_section_size,
            trailers: None,
            send_grease_frame: grease,
            receive_gate: Arc::new(ReceiveGate::new()),
        }
    }

    /// A handle to this stream's receive gate, for pausing/resuming delivery from
    /// outside the task driving `recv_data` (the async-core counterpart of
    /// `api::RequestStream::set_receive_enabled`/`complete_receive`).
    pub fn receive_control(&self) -> ReceiveControl {
        ReceiveControl(self.receive_gate.clone())
    }
}

impl<S, B> ConnectionState for RequestStream<S, B> {
    fn shared_state(&self) -> &SharedStateRef {
        &self.conn_state
    }
}

impl<S, B> RequestStream<S, B>
where
    S: quic::RecvStream,
{
    /// Receive some of the request/response body.
    ///
    /// Waits for [`ReceiveControl::set_receive_enabled`]/`complete_receive` if the
    /// gate was disabled, e.g. because the previous chunk wasn't fully consumed.
    pub async fn recv_data(&mut self) -> Result<Option<impl Buf>, Error> {
        self.receive_gate.wait_until_enabled().await;
        if !self.stream.has_data() {
            let frame = future::poll_fn(|cx| self.stream.poll_next(cx))
                .await
                .map_err(|e| self.maybe_conn_err(e))?;
            match frame {
                Some(Frame::Data(_)) => (),
                Some(Frame::Headers(encoded)) => {
                    self.trailers = Some(encoded);
                    return Ok(None);
                }
                //= https://www.rfc-editor.org/rfc/rfc9114#section-4.1
                //# Receipt of an invalid sequence of frames MUST be treated as a
                //# connection error of type H3_FRAME_UNEXPECTED.
                Some(_) => return Err(Code::H3_FRAME_UNEXPECTED.with_reason("unexpected frame on request stream", ErrorLevel::ConnectionError)),
                None => return Ok(None),
            }
        }

        let data = future::poll_fn(|cx| self.stream.poll_data(cx))
            .await
            .map_err(|e| self.maybe_conn_err(e))?;
        Ok(data)
    }

    /// Decode a HEADERS payload into a [`Header`], parking on the connection's QPACK
    /// progress notification while the block is blocked on more dynamic-table inserts.
    ///
    /// Bounded by the peer's advertised `QPACK_BLOCKED_STREAMS` (RFC 9204 section
    /// 2.1.2): the `K+1`-th stream this connection would have to park at once is a
    /// connection error instead, since the peer's encoder promised never to cause that.
    pub(crate) async fn decode_headers(&self, encoded: &Bytes) -> Result<Header, Error> {
        let mut parked = false;
        let result = loop {
            let outcome = {
                let mut state = self.conn_state.write();
                let mut cursor = encoded.clone();
                state.qpack_decoder.decode_field_section(&mut cursor)?
            };
            match outcome {
                DecodeOutcome::Done(decoded) => {
                    let mut state = self.conn_state.write();
                    if parked {
                        state.blocked_streams.remove(&self.id.value());
                    }
                    DecoderInstruction::HeaderAck(self.id.value()).encode(&mut state.decoder_stream_out);
                    break Header::try_from_qpack_fields(decoded.fields).map_err(Into::into);
                }
                DecodeOutcome::Blocked { required_insert_count } => {
                    if !parked {
                        let mut state = self.conn_state.write();
                        if (state.blocked_streams.len() as u64) >= state.peer_blocked_streams {
                            break Err(Code::QPACK_DECOMPRESSION_FAILED.with_reason(
                                format!(
                                    "blocking on required_insert_count {required_insert_count} would park \
                                     {} streams, exceeding the peer's QPACK_BLOCKED_STREAMS={}",
                                    state.blocked_streams.len() + 1,
                                    state.peer_blocked_streams
                                ),
                                ErrorLevel::ConnectionError,
                            ));
                        }
                        state.blocked_streams.insert(self.id.value());
                        parked = true;
                    }
                    self.conn_state.wait_for_qpack_progress().await;
                }
            }
        };
        if parked {
            self.conn_state.write().blocked_streams.remove(&self.id.value());
        }
        result
    }

    /// Receive trailers.
    pub async fn recv_trailers(&mut self) -> Result<Option<http::HeaderMap>, Error> {
        let mut trailers = if let Some(encoded) = self.trailers.take() {
            encoded
        } else {
            let frame = future::poll_fn(|cx| self.stream.poll_next(cx))
                .await
                .map_err(|e| self.maybe_conn_err(e))?;
            match frame {
                Some(Frame::Headers(encoded)) => encoded,
                Some(_) => return Err(Code::H3_FRAME_UNEXPECTED.with_reason("unexpected frame while reading trailers", ErrorLevel::ConnectionError)),
                None => return Ok(None),
            }
        };

        if !self.stream.is_eos() {
            let trailing_frame = future::poll_fn(|cx| self.stream.poll_next(cx))
                .await
                .map_err(|e| self.maybe_conn_err(e))?;
            if trailing_frame.is_some() {
                return Err(Code::H3_FRAME_UNEXPECTED.with_reason("frame after trailers", ErrorLevel::ConnectionError));
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9114#section-4.2.2
        //# An HTTP/3 implementation MAY impose a limit on the maximum size of
        //# the message header it will accept on an individual HTTP message.
        let decoded = qpack::decoder::decode_stateless(&mut trailers)?;
        let mem_size = qpack::field_section_mem_size(&decoded.fields);
        if mem_size > self.max_field_section_size {
            return Err(Error::header_too_big(mem_size, self.max_field_section_size));
        }
        Ok(Some(Header::try_from_qpack_fields(decoded.fields)?.fields))
    }

    pub fn stop_sending(&mut self, err_code: Code) {
        self.stream.stop_sending(err_code);
    }
}

impl<S, B> RequestStream<S, B>
where
    S: quic::SendStream<B>,
    B: Buf,
{
    /// Encode and send a request or response header block, referencing/inserting
    /// into the connection's shared QPACK dynamic table.
    pub(crate) async fn send_headers(&mut self, header: Header) -> Result<(), Error> {
        let fields = header.into_qpack_fields();
        let mut block = BytesMut::new();
        let referenced = {
            let mut state = self.conn_state.write();
            let mut encoder_scratch = BytesMut::new();
            let referenced = state.qpack_encoder.encode(&mut block, &mut encoder_scratch, fields.iter());
            state.encoder_stream_out.unsplit(encoder_scratch);
            referenced
        };
        if !referenced.is_empty() {
            self.conn_state.write().outstanding_refs.insert(self.id.value(), referenced);
        }

        stream::write(&mut self.stream, Frame::Headers(block.freeze()))
            .await
            .map_err(|e| self.maybe_conn_err(e))
    }

    /// Send some data on the body.
    pub async fn send_data(&mut self, buf: B) -> Result<(), Error> {
        stream::write(&mut self.stream, Frame::Data(buf))
            .await
            .map_err(|e| self.maybe_conn_err(e))
    }

    /// Send a set of trailers to end the request.
    pub async fn send_trailers(&mut self, trailers: http::HeaderMap) -> Result<(), Error> {
        let header = Header::trailer(trailers);
        let fields = header.into_qpack_fields();
        let mem_size = qpack::field_section_mem_size(&fields);
        let max_mem_size = self.conn_state.read().peer_max_field_section_size;
        //= https://www.rfc-editor.org/rfc/rfc9114#section-4.2.2
        //# An implementation that has received this parameter SHOULD NOT send
        //# an HTTP message header that exceeds the indicated size.
        if mem_size > max_mem_size {
            return Err(Error::header_too_big(mem_size, max_mem_size));
        }

        let mut block = BytesMut::new();
        qpack::encoder::encode_stateless(&mut block, fields.iter());
        stream::write(&mut self.stream, Frame::Headers(block.freeze()))
            .await
            .map_err(|e| self.maybe_conn_err(e))
    }

    pub fn stop_stream(&mut self, code: Code) {
        self.stream.reset(code.value());
    }

    pub async fn finish(&mut self) -> Result<(), Error> {
        if self.send_grease_frame {
            stream::write(&mut self.stream, Frame::Grease)
                .await
                .map_err(|e| self.maybe_conn_err(e))?;
            self.send_grease_frame = false;
        }
        future::poll_fn(|cx| self.stream.poll_ready(cx))
            .await
            .map_err(|e| self.maybe_conn_err(e))?;
        future::poll_fn(|cx| self.stream.poll_finish(cx))
            .await
            .map_err(|e| self.maybe_conn_err(e))
    }
}

impl<S, B> RequestStream<S, B>
where
    S: quic::BidiStream<B>,
    B: Buf,
{
    pub(crate) fn split(self) -> (RequestStream<S::SendStream, B>, RequestStream<S::RecvStream, B>) {
        let (send, recv) = self.stream.split();
        (
            RequestStream {
                id: self.id,
                stream: send,
                trailers: None,
                conn_state: self.conn_state.clone(),
                max_field_section_size: 0,
                send_grease_frame: self.send_grease_frame,
                receive_gate: self.receive_gate.clone(),
            },
            RequestStream {
                id: self.id,
                stream: recv,
                trailers: self.trailers,
                conn_state: self.conn_state,
                max_field_section_size: self.max_field_section_size,
                send_grease_frame: self.send_grease_frame,
                receive_gate: self.receive_gate,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{fmt, task::Context};

    use bytes::BytesMut;

    use super::*;
    use crate::{error::ErrorLevel, qpack::block::HeaderPrefix, quic::RecvStream};

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

    #[derive(Default)]
    struct FakeRecv;

    impl RecvStream for FakeRecv {
        type Buf = Bytes;
        type Error = FakeError;

        fn poll_data(&mut self, _: &mut Context<'_>) -> std::task::Poll<Result<Option<Self::Buf>, Self::Error>> {
            std::task::Poll::Ready(Ok(None))
        }

        fn stop_sending(&mut self, _: u64) {}
    }

    fn request_stream(id: u64, shared: SharedStateRef) -> RequestStream<FakeRecv, Bytes> {
        RequestStream::new(StreamId::from(id), FrameStream::new(FakeRecv), VarInt::MAX.into_inner(), shared, false)
    }

    /// A header block whose `required_insert_count` the (empty) dynamic table can
    /// never satisfy, so `decode_field_section` always reports `Blocked`.
    fn unsatisfiable_header_block() -> Bytes {
        let mut buf = BytesMut::new();
        HeaderPrefix { required_insert_count: 1, base: 1 }.encode(&mut buf);
        buf.freeze()
    }

    #[tokio::test]
    async fn blocking_past_the_peer_cap_is_a_connection_error() {
        let shared = SharedStateRef::default();
        shared.write().peer_blocked_streams = 1;
        // One stream is already parked, at the cap.
        shared.write().blocked_streams.insert(999);

        let stream = request_stream(4, shared.clone());
        let err = tokio::time::timeout(std::time::Duration::from_millis(50), stream.decode_headers(&unsatisfiable_header_block()))
            .await
            .expect("does not park: the cap is already reached")
            .expect_err("blocked past the peer's cap");

        assert_eq!(err.code(), Code::QPACK_DECOMPRESSION_FAILED);
        assert_eq!(err.level(), ErrorLevel::ConnectionError);
        // The rejected stream was never added to the parked set.
        assert_eq!(shared.read().blocked_streams.len(), 1);
    }

    #[tokio::test]
    async fn blocking_under_the_peer_cap_parks_until_progress() {
        let shared = SharedStateRef::default();
        shared.write().peer_blocked_streams = 1;

        let stream = request_stream(4, shared.clone());
        // Nothing ever advances the table, so this never resolves: a short timeout
        // standing in for "still parked, not rejected outright."
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(20), stream.decode_headers(&unsatisfiable_header_block()))
            .await
            .is_err();
        assert!(timed_out, "expected the decode to still be parked, not resolved");
        assert!(shared.read().blocked_streams.contains(&4));

        // A second stream would now exceed the cap.
        let other = request_stream(8, shared.clone());
        let err = tokio::time::timeout(std::time::Duration::from_millis(50), other.decode_headers(&unsatisfiable_header_block()))
            .await
            .expect("does not park: the cap is already reached")
            .expect_err("blocked past the peer's cap");
        assert_eq!(err.code(), Code::QPACK_DECOMPRESSION_FAILED);
    }
}
