//! HTTP/3 client-side connection driver.
//!
//! Splits a QUIC connection into a [`Connection`] (drives the control stream and
//! watches for protocol violations) and a [`SendRequest`] (opens a bidirectional
//! stream per request). The two halves are typically driven from separate tasks.
//!
//! # Example
//!
//! ```rust
//! async fn doc<C, O>(conn: C)
//! where
//!     C: rh3::quic::Connection<bytes::Bytes, OpenStreams = O>,
//!     O: rh3::quic::OpenStreams<bytes::Bytes>,
//! {
//!     let (mut driver, mut send_request) = rh3::client::new(conn).await.unwrap();
//!
//!     tokio::spawn(async move {
//!         futures_util::future::poll_fn(|cx| driver.poll_close(cx)).await.ok();
//!     });
//!
//!     let req = http::Request::builder().uri("https://example.com/").body(()).unwrap();
//!     let mut stream = send_request.send_request(req).await.unwrap();
//!     stream.finish().await.unwrap();
//!     let resp = stream.recv_response().await.unwrap();
//!     println!("{:?}", resp);
//! }
//! ```

use std::{
    marker::PhantomData,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use futures_util::future;
use http::{request, HeaderMap, Request, Response};
use tracing::{trace, warn};

use crate::{
    config,
    connection::{self, ConnectionInner, SharedStateRef},
    error::{Code, Error, ErrorLevel},
    frame::FrameStream,
    proto::{frame::Frame, headers::Header},
    quic::{self, OpenStreams as _, RecvStream as _, SendStream as _},
};

/// Create a builder of HTTP/3 client connections, carrying settings shared
/// between connections.
pub fn builder<C, B>() -> Builder<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    Builder::new()
}

/// Build an HTTP/3 client connection from a QUIC connection, using default settings.
pub async fn new<C, B>(conn: C) -> Result<(Connection<C, B>, SendRequest<C::OpenStreams, B>), Error>
where
    C: quic::Connection<B>,
    B: Buf,
{
    builder().build(conn).await
}

/// Client connection driver.
///
/// Processes the control stream (SETTINGS, GOAWAY) and watches for protocol
/// violations (a client never expects an incoming bidirectional stream). Drive
/// this with [`futures_util::future::poll_fn`] alongside issuing requests
/// through a [`SendRequest`].
pub struct Connection<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    inner: ConnectionInner<C, B>,
}

impl<C, B> Connection<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    pub fn poll_close(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        loop {
            match self.inner.poll_control(cx) {
                Poll::Ready(Ok(frame)) => match frame {
                    Frame::Settings(_) => trace!("received settings"),
                    f @ Frame::Goaway(_) => warn!("ignoring {:?} on client control stream", f),
                    frame => {
                        return Poll::Ready(Err(self
                            .inner
                            .close(Code::H3_FRAME_UNEXPECTED, format!("on client control stream: {frame:?}"))))
                    }
                },
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9114#section-6.1
        //# A client MUST treat receipt of a server-initiated bidirectional
        //# stream as a connection error of type H3_STREAM_CREATION_ERROR.
        if let Poll::Ready(_) = self.inner.poll_accept_request(cx) {
            return Poll::Ready(Err(self
                .inner
                .close(Code::H3_STREAM_CREATION_ERROR, "client received a bidirectional stream")));
        }

        Poll::Pending
    }
}

/// Builder of HTTP/3 client connections.
pub struct Builder<C, B> {
    settings: config::Settings,
    _conn: PhantomData<(C, B)>,
}

impl<C, B> Builder<C, B> {
    fn new() -> Self {
        Builder {
            settings: config::Settings::default(),
            _conn: PhantomData,
        }
    }

    /// Set the maximum field-section size this client is willing to accept
    /// on a response.
    pub fn max_field_section_size(&mut self, value: u64) -> &mut Self {
        self.settings.max_field_section_size = value;
        self
    }

    /// Whether to send grease values to the server.
    pub fn send_grease(&mut self, value: bool) -> &mut Self {
        self.settings.send_grease = value;
        self
    }
}

impl<C, B> Builder<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    /// Build the connection from a QUIC connection.
    pub async fn build(&mut self, quic: C) -> Result<(Connection<C, B>, SendRequest<C::OpenStreams, B>), Error> {
        let open = quic.opener();
        let conn_state = SharedStateRef::default();

        Ok((
            Connection {
                inner: ConnectionInner::new(quic, &self.settings, conn_state.clone()).await?,
            },
            SendRequest {
                open,
                conn_state,
                max_field_section_size: self.settings.max_field_section_size,
                _marker: PhantomData,
            },
        ))
    }
}

/// Issues requests over a client connection, each on its own bidirectional stream.
///
/// Cheaply cloneable state (`conn_state`) is shared with the [`Connection`] that
/// opened it, so requests and the control-stream driver observe the same QPACK
/// dynamic table.
pub struct SendRequest<T, B>
where
    T: quic::OpenStreams<B>,
    B: Buf,
{
    open: T,
    conn_state: SharedStateRef,
    max_field_section_size: u64,
    _marker: PhantomData<B>,
}

impl<T, B> SendRequest<T, B>
where
    T: quic::OpenStreams<B>,
    B: Buf,
{
    /// Send a request, returning a stream to send the request body (if any) and
    /// receive the response.
    pub async fn send_request(&mut self, req: Request<()>) -> Result<RequestStream<T::BidiStream, B>, Error> {
        let (parts, _) = req.into_parts();
        let request::Parts { method, uri, headers, .. } = parts;

        let scheme = Bytes::from(uri.scheme_str().unwrap_or("https").to_owned());
        let authority = Bytes::from(uri.authority().map(ToString::to_string).unwrap_or_default());
        let path = Bytes::from(uri.path_and_query().map(ToString::to_string).unwrap_or_else(|| "/".to_owned()));
        let header = Header::request(method, scheme, authority, path, headers);

        let stream = future::poll_fn(|cx| self.open.poll_open_bidi(cx)).await?;
        let id = stream.id();

        let mut inner = connection::RequestStream::new(
            id,
            FrameStream::new(stream),
            self.max_field_section_size,
            self.conn_state.clone(),
            false,
        );
        inner.send_headers(header).await?;

        Ok(RequestStream { inner })
    }
}

/// A request's stream: send the body (if any), then receive the response.
pub struct RequestStream<S, B> {
    inner: connection::RequestStream<S, B>,
}

impl<S, B> RequestStream<S, B> {
    /// A handle for pausing/resuming `recv_data` delivery from another task.
    /// Valid on either half after [`RequestStream::split`]: both halves share
    /// one gate.
    pub fn receive_control(&self) -> connection::ReceiveControl {
        self.inner.receive_control()
    }
}

impl<S, B> RequestStream<S, B>
where
    S: quic::RecvStream,
{
    /// Receive the response headers.
    ///
    /// Call this before [`RequestStream::recv_data`].
    pub async fn recv_response(&mut self) -> Result<Response<()>, Error> {
        let frame = future::poll_fn(|cx| self.inner.stream.poll_next(cx)).await?;
        let encoded = match frame {
            Some(Frame::Headers(h)) => h,
            //= https://www.rfc-editor.org/rfc/rfc9114#section-4.1
            //# Receipt of an invalid sequence of frames MUST be treated as a
            //# connection error of type H3_FRAME_UNEXPECTED.
            Some(_) => return Err(Code::H3_FRAME_UNEXPECTED.with_reason("first response frame is not headers", ErrorLevel::ConnectionError)),
            None => return Err(Code::H3_GENERAL_PROTOCOL_ERROR.with_reason("did not receive response headers", ErrorLevel::ConnectionError)),
        };

        let header = self.inner.decode_headers(&encoded).await.map_err(|e| {
            if e.code() == Code::H3_EXCESSIVE_LOAD {
                self.inner.stop_sending(Code::H3_REQUEST_REJECTED);
            }
            e
        })?;
        header.require_response_pseudo()?;

        let mut resp = Response::new(());
        *resp.status_mut() = header.status.expect("validated by require_response_pseudo");
        *resp.headers_mut() = header.fields;
        *resp.version_mut() = http::Version::HTTP_3;

        Ok(resp)
    }

    /// Receive some of the response body.
    pub async fn recv_data(&mut self) -> Result<Option<impl Buf>, Error> {
        self.inner.recv_data().await
    }

    /// Receive an optional set of trailers for the response.
    pub async fn recv_trailers(&mut self) -> Result<Option<HeaderMap>, Error> {
        let res = self.inner.recv_trailers().await;
        if let Err(ref e) = res {
            if e.code() == Code::H3_EXCESSIVE_LOAD {
                self.inner.stop_sending(Code::H3_REQUEST_CANCELLED);
            }
        }
        res
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
    /// Send some data on the request body.
    pub async fn send_data(&mut self, buf: B) -> Result<(), Error> {
        self.inner.send_data(buf).await
    }

    /// Send a set of trailers to end the request.
    pub async fn send_trailers(&mut self, trailers: HeaderMap) -> Result<(), Error> {
        self.inner.send_trailers(trailers).await
    }

    /// End the request without trailers.
    pub async fn finish(&mut self) -> Result<(), Error> {
        self.inner.finish().await
    }

    /// Abort the request with an error code.
    pub fn stop_stream(&mut self, error_code: Code) {
        self.inner.stop_stream(error_code);
    }
}

impl<S, B> RequestStream<S, B>
where
    S: quic::BidiStream<B>,
    B: Buf,
{
    /// Split into independent send and receive halves, for use from different
    /// tasks once the response headers have been read.
    pub fn split(self) -> (RequestStream<S::SendStream, B>, RequestStream<S::RecvStream, B>) {
        let (send, recv) = self.inner.split();
        (RequestStream { inner: send }, RequestStream { inner: recv })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_send_grease() {
        let builder: Builder<(), Bytes> = Builder::new();
        assert!(builder.settings.send_grease);
    }
}
