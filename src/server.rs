//! HTTP/3 server-side connection driver.
//!
//! Accepts incoming request streams, decodes their headers through the
//! connection's shared QPACK state, and exposes a [`RequestStream`] for sending
//! the response back.
//!
//! # Example
//!
//! ```rust
//! async fn doc<C>(conn: C)
//! where
//!     C: rh3::quic::Connection<bytes::Bytes>,
//!     <C as rh3::quic::Connection<bytes::Bytes>>::BidiStream: Send + 'static,
//! {
//!     let mut h3_conn = rh3::server::Connection::new(conn).await.unwrap();
//!     loop {
//!         match h3_conn.accept().await {
//!             Ok(Some((req, mut stream))) => {
//!                 tokio::spawn(async move {
//!                     let response = http::Response::builder().status(http::StatusCode::OK).body(()).unwrap();
//!                     stream.send_response(response).await.unwrap();
//!                     stream.send_data(bytes::Bytes::from("test")).await.unwrap();
//!                     stream.finish().await.unwrap();
//!                 });
//!             }
//!             Ok(None) => break,
//!             Err(err) => match err.level() {
//!                 rh3::error::ErrorLevel::ConnectionError => break,
//!                 rh3::error::ErrorLevel::StreamError => continue,
//!             },
//!         }
//!     }
//! }
//! ```

use std::{
    collections::HashSet,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Buf;
use futures_util::future;
use http::{response, HeaderMap, Request, Response, StatusCode, Uri};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::{
    config,
    connection::{self, ConnectionInner, ConnectionState, SharedStateRef},
    error::{Code, Error, ErrorLevel},
    frame::FrameStream,
    proto::{frame::Frame, headers::Header},
    quic::{self, RecvStream as _, SendStream as _, StreamId},
};

/// Create a builder of HTTP/3 server connections, carrying settings shared
/// between connections.
pub fn builder() -> Builder {
    Builder::new()
}

/// Server connection driver.
///
/// Manages a connection from the server's side of an HTTP/3 exchange: accepts
/// incoming request streams with [`Connection::accept`] and drives a graceful
/// shutdown with [`Connection::shutdown`].
pub struct Connection<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    inner: ConnectionInner<C, B>,
    max_field_section_size: u64,
    ongoing_streams: HashSet<StreamId>,
    request_end_recv: mpsc::UnboundedReceiver<StreamId>,
    request_end_send: mpsc::UnboundedSender<StreamId>,
}

impl<C, B> ConnectionState for Connection<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    fn shared_state(&self) -> &SharedStateRef {
        &self.inner.shared
    }
}

impl<C, B> Connection<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    /// Create a new HTTP/3 server connection with default settings.
    ///
    /// Use [`builder`] to customize settings before building.
    pub async fn new(conn: C) -> Result<Self, Error> {
        builder().build(conn).await
    }
}

impl<C, B> Connection<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    /// Accept an incoming request.
    ///
    /// Returns a parsed [`http::Request`] and a [`RequestStream`] the caller
    /// uses to send back a response. Returns `Ok(None)` once the connection is
    /// finished accepting new requests.
    pub async fn accept(&mut self) -> Result<Option<(Request<()>, RequestStream<C::BidiStream, B>)>, Error> {
        let mut stream = match future::poll_fn(|cx| self.poll_accept_request(cx)).await {
            Ok(Some(s)) => FrameStream::new(s),
            Ok(None) => {
                //= https://www.rfc-editor.org/rfc/rfc9114#section-3.3
                //# the terminating endpoint SHOULD first send a GOAWAY frame
                self.inner.shutdown(0).await?;
                return Ok(None);
            }
            Err(err) => return Err(self.close_on_connection_error(err)),
        };

        let stream_id = stream.id();

        let encoded = match future::poll_fn(|cx| stream.poll_next(cx)).await {
            Ok(Some(Frame::Headers(h))) => h,
            //= https://www.rfc-editor.org/rfc/rfc9114#section-4.1
            //# If a client-initiated stream terminates without enough of the
            //# HTTP message to provide a complete response, the server SHOULD
            //# abort its response stream with the error code H3_REQUEST_INCOMPLETE.
            Ok(None) => return Err(self.inner.close(Code::H3_REQUEST_INCOMPLETE, "request stream closed before headers")),
            //= https://www.rfc-editor.org/rfc/rfc9114#section-7.2.5
            //# A server MUST treat the receipt of a PUSH_PROMISE frame as a
            //# connection error of type H3_FRAME_UNEXPECTED.
            Ok(Some(_)) => return Err(self.inner.close(Code::H3_FRAME_UNEXPECTED, "first request frame is not headers")),
            Err(e) => return Err(self.close_on_connection_error(e.into())),
        };

        let mut request_stream = RequestStream {
            request_end: Arc::new(RequestEnd {
                request_end: self.request_end_send.clone(),
                stream_id,
            }),
            inner: connection::RequestStream::new(
                stream_id,
                stream,
                self.max_field_section_size,
                self.inner.shared.clone(),
                self.inner.send_grease_frame,
            ),
        };

        let header = match request_stream.inner.decode_headers(&encoded).await {
            //= https://www.rfc-editor.org/rfc/rfc9114#section-4.2.2
            //# An HTTP/3 implementation MAY impose a limit on the maximum size
            //# of the message header it will accept on an individual HTTP message.
            Err(e) if e.code() == Code::H3_EXCESSIVE_LOAD => {
                request_stream
                    .send_response(
                        Response::builder()
                            .status(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
                            .body(())
                            .expect("header too big response"),
                    )
                    .await?;
                return Err(e);
            }
            Ok(header) => header,
            Err(e) if e.level() == ErrorLevel::ConnectionError => return Err(self.inner.close(e.code(), e.to_string())),
            Err(e) => {
                request_stream.stop_stream(e.code());
                return Err(e);
            }
        };

        //= https://www.rfc-editor.org/rfc/rfc9114#section-4.1.2
        //# Malformed requests or responses that are detected MUST be treated
        //# as a stream error of type H3_MESSAGE_ERROR.
        if let Err(e) = header.require_request_pseudo() {
            let error: Error = e.into();
            request_stream.stop_stream(error.code());
            return Err(error);
        }

        let mut req = Request::new(());
        *req.uri_mut() = build_uri(&header).map_err(|e| {
            request_stream.stop_stream(Code::H3_MESSAGE_ERROR);
            e
        })?;
        *req.method_mut() = header.method.expect("validated by require_request_pseudo");
        *req.headers_mut() = header.fields;
        *req.version_mut() = http::Version::HTTP_3;

        // Grease frames are sent at most once per connection.
        self.inner.send_grease_frame = false;

        Ok(Some((req, request_stream)))
    }

    fn close_on_connection_error(&mut self, err: Error) -> Error {
        if err.is_closed() {
            return err;
        }
        self.inner.close(err.code(), err.to_string())
    }

    /// Initiate a graceful shutdown, accepting `max_requests` potentially
    /// still-in-flight requests.
    ///
    /// See [connection shutdown](https://www.rfc-editor.org/rfc/rfc9114.html#connection-shutdown).
    pub async fn shutdown(&mut self, max_requests: usize) -> Result<(), Error> {
        self.inner.shutdown(max_requests).await
    }

    fn poll_accept_request(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<C::BidiStream>, Error>> {
        if let Poll::Ready(Err(e)) = self.poll_control(cx) {
            return Poll::Ready(Err(e));
        }
        let _ = self.poll_requests_completion(cx);

        let closing = self.shared_state().read().closing;

        loop {
            match self.inner.poll_accept_request(cx) {
                Poll::Ready(Err(e)) => break Poll::Ready(Err(e)),
                Poll::Ready(Ok(None)) => {
                    if self.poll_requests_completion(cx).is_ready() {
                        break Poll::Ready(Ok(None));
                    } else {
                        // `request_end_recv` wakes us on each request completion.
                        break Poll::Pending;
                    }
                }
                Poll::Pending => {
                    if closing.is_some() && self.poll_requests_completion(cx).is_ready() {
                        break Poll::Ready(Ok(None));
                    } else {
                        return Poll::Pending;
                    }
                }
                Poll::Ready(Ok(Some(mut s))) => {
                    // During graceful shutdown, reject requests arriving outside
                    // the accepted grace interval. Request streams can still
                    // arrive out of order after ones already rejected.
                    if let Some(max_id) = closing {
                        if s.id() > max_id {
                            s.stop_sending(Code::H3_REQUEST_REJECTED.value());
                            s.reset(Code::H3_REQUEST_REJECTED.value());
                            if self.poll_requests_completion(cx).is_ready() {
                                break Poll::Ready(Ok(None));
                            }
                            continue;
                        }
                    }
                    self.inner.start_stream(s.id());
                    self.ongoing_streams.insert(s.id());
                    break Poll::Ready(Ok(Some(s)));
                }
            };
        }
    }

    fn poll_control(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        loop {
            match self.inner.poll_control(cx) {
                Poll::Ready(Ok(frame)) => match frame {
                    Frame::Settings(_) => trace!("received settings"),
                    Frame::Goaway(id) => trace!("received goaway for stream {:?}", id),
                    f @ Frame::MaxPushId(_) | f @ Frame::CancelPush(_) => warn!("ignoring push-related control frame {:?}", f),
                    //= https://www.rfc-editor.org/rfc/rfc9114#section-7.2.5
                    //# A server MUST treat the receipt of a PUSH_PROMISE frame as a
                    //# connection error of type H3_FRAME_UNEXPECTED.
                    frame => {
                        return Poll::Ready(Err(self
                            .inner
                            .close(Code::H3_FRAME_UNEXPECTED, format!("on server control stream: {frame:?}"))))
                    }
                },
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_requests_completion(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            match self.request_end_recv.poll_recv(cx) {
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Ready(Some(id)) => {
                    self.ongoing_streams.remove(&id);
                }
                Poll::Pending => {
                    if self.ongoing_streams.is_empty() {
                        // Completion of future requests will still wake us.
                        return Poll::Ready(());
                    } else {
                        return Poll::Pending;
                    }
                }
            }
        }
    }
}

fn build_uri(header: &Header) -> Result<Uri, Error> {
    let mut builder = Uri::builder();
    if let Some(scheme) = &header.scheme {
        builder = builder.scheme(scheme.as_ref());
    }
    if let Some(authority) = &header.authority {
        builder = builder.authority(authority.as_ref());
    }
    if let Some(path) = &header.path {
        builder = builder.path_and_query(path.as_ref());
    }
    builder
        .build()
        .map_err(|e| Code::H3_MESSAGE_ERROR.with_reason(format!("invalid request target: {e}"), ErrorLevel::StreamError))
}

impl<C, B> Drop for Connection<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    fn drop(&mut self) {
        self.inner.close(Code::H3_NO_ERROR, "");
    }
}

//= https://www.rfc-editor.org/rfc/rfc9114#section-6.1
//# In order to permit these streams to open, an HTTP/3 server SHOULD
//# configure non-zero minimum values for the number of permitted
//# streams and the initial stream flow-control window.

/// Builder of HTTP/3 server connections.
///
/// # Example
///
/// ```rust
/// fn doc<C, B>(conn: C)
/// where
///     C: rh3::quic::Connection<B>,
///     B: bytes::Buf,
/// {
///     let mut server_builder = rh3::server::builder();
///     server_builder.max_field_section_size(1000);
///     server_builder.send_grease(false);
/// }
/// ```
pub struct Builder {
    settings: config::Settings,
}

impl Builder {
    fn new() -> Self {
        Builder {
            settings: config::Settings::default(),
        }
    }

    /// Set the maximum field-section size this server is willing to accept.
    ///
    /// See [header size constraints](https://www.rfc-editor.org/rfc/rfc9114.html#name-header-size-constraints).
    pub fn max_field_section_size(&mut self, value: u64) -> &mut Self {
        self.settings.max_field_section_size = value;
        self
    }

    /// Whether to send grease values to the client.
    ///
    /// See [settings](https://www.rfc-editor.org/rfc/rfc9114.html#settings-parameters),
    /// [frame](https://www.rfc-editor.org/rfc/rfc9114.html#frame-reserved), and
    /// [stream](https://www.rfc-editor.org/rfc/rfc9114.html#stream-grease) grease.
    pub fn send_grease(&mut self, value: bool) -> &mut Self {
        self.settings.send_grease = value;
        self
    }

    /// Build an HTTP/3 connection from a QUIC connection.
    pub async fn build<C, B>(&self, conn: C) -> Result<Connection<C, B>, Error>
    where
        C: quic::Connection<B>,
        B: Buf,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok(Connection {
            inner: ConnectionInner::new(conn, &self.settings, SharedStateRef::default()).await?,
            max_field_section_size: self.settings.max_field_section_size,
            request_end_send: sender,
            request_end_recv: receiver,
            ongoing_streams: HashSet::new(),
        })
    }
}

struct RequestEnd {
    request_end: mpsc::UnboundedSender<StreamId>,
    stream_id: StreamId,
}

/// Manages sending a response back to the client for an accepted request.
pub struct RequestStream<S, B> {
    inner: connection::RequestStream<S, B>,
    request_end: Arc<RequestEnd>,
}

impl<S, B> ConnectionState for RequestStream<S, B> {
    fn shared_state(&self) -> &SharedStateRef {
        &self.inner.conn_state
    }
}

impl<S, B> RequestStream<S, B> {
    /// A handle for pausing/resuming `recv_data` delivery from another task, e.g. an
    /// event-loop callback that reports a chunk as not fully consumed. Valid on
    /// either half after [`RequestStream::split`]: both halves share one gate.
    pub fn receive_control(&self) -> connection::ReceiveControl {
        self.inner.receive_control()
    }
}

impl<S, B> RequestStream<S, B>
where
    S: quic::RecvStream,
{
    /// Receive data sent from the client.
    pub async fn recv_data(&mut self) -> Result<Option<impl Buf>, Error> {
        self.inner.recv_data().await
    }

    /// Tell the peer to stop sending into the underlying QUIC stream.
    pub fn stop_sending(&mut self, error_code: Code) {
        self.inner.stop_sending(error_code);
    }
}

impl<S, B> RequestStream<S, B>
where
    S: quic::SendStream<B>,
    B: Buf,
{
    /// Send the HTTP/3 response.
    ///
    /// Call this before [`RequestStream::send_data`].
    pub async fn send_response(&mut self, resp: Response<()>) -> Result<(), Error> {
        let (parts, _) = resp.into_parts();
        let response::Parts { status, headers, .. } = parts;
        self.inner.send_headers(Header::response(status, headers)).await
    }

    /// Send some data on the response body.
    pub async fn send_data(&mut self, buf: B) -> Result<(), Error> {
        self.inner.send_data(buf).await
    }

    /// Stop this stream with an error code (e.g. [`Code::H3_NO_ERROR`]).
    pub fn stop_stream(&mut self, error_code: Code) {
        self.inner.stop_stream(error_code);
    }

    /// Send a set of trailers to end the response.
    ///
    /// Either this or [`RequestStream::finish`] must be called to finalize a
    /// response.
    pub async fn send_trailers(&mut self, trailers: HeaderMap) -> Result<(), Error> {
        self.inner.send_trailers(trailers).await
    }

    /// End the response without trailers.
    ///
    /// Either this or [`RequestStream::send_trailers`] must be called to
    /// finalize a response.
    pub async fn finish(&mut self) -> Result<(), Error> {
        self.inner.finish().await
    }
}

impl<S, B> RequestStream<S, B>
where
    S: quic::RecvStream + quic::SendStream<B>,
    B: Buf,
{
    /// Receive an optional set of trailers for the request.
    pub async fn recv_trailers(&mut self) -> Result<Option<HeaderMap>, Error> {
        let res = self.inner.recv_trailers().await;
        if let Err(ref e) = res {
            if e.code() == Code::H3_EXCESSIVE_LOAD {
                self.send_response(
                    Response::builder()
                        .status(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
                        .body(())
                        .expect("header too big response"),
                )
                .await?;
            }
        }
        res
    }
}

impl<S, B> RequestStream<S, B>
where
    S: quic::BidiStream<B>,
    B: Buf,
{
    /// Split the request stream into independent send and receive halves, for
    /// use from different tasks.
    pub fn split(self) -> (RequestStream<S::SendStream, B>, RequestStream<S::RecvStream, B>) {
        let (send, recv) = self.inner.split();
        (
            RequestStream {
                inner: send,
                request_end: self.request_end.clone(),
            },
            RequestStream {
                inner: recv,
                request_end: self.request_end,
            },
        )
    }
}

impl Drop for RequestEnd {
    fn drop(&mut self) {
        if self.request_end.send(self.stream_id).is_err() {
            trace!("connection already dropped, request end for {:?} not delivered", self.stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_send_grease() {
        let builder = Builder::new();
        assert!(builder.settings.send_grease);
    }

    #[test]
    fn builder_overrides_are_recorded() {
        let mut builder = Builder::new();
        builder.max_field_section_size(1000).send_grease(false);
        assert_eq!(builder.settings.max_field_section_size, 1000);
        assert!(!builder.settings.send_grease);
    }
}
