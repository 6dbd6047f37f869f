//! Opaque-handle, callback-dispatch surface over the async core.
//!
//! The async core (`server::Connection::accept`, `RequestStream::recv_data`, …)
//! is driven by `.await`ing futures directly. This module wraps that core
//! behind handles that drive themselves on a background `tokio::task` and fan
//! events out to a registered callback instead, for callers who would rather
//! not hold the future themselves. Nothing here replaces the async core; it's
//! a thin translation layer sitting on top of it.
//!
//! [`Connecting`] drives one accepted server connection; each request it
//! yields arrives as an [`IncomingRequest`], whose [`IncomingRequest::accept`]
//! splits the underlying bidirectional stream into a send-side [`RequestStream`]
//! handle (returned to the caller) and a background task pumping the receive
//! side into [`Event`]s.
//!
//! [`Connection`] is the client-side counterpart: it drives the handshake and
//! control stream, and [`Connection::request`] opens a [`Request`] the same way
//! [`IncomingRequest::accept`] hands back a server-side [`RequestStream`].

use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use futures_util::future;
use http::{HeaderMap, Request as HttpRequest, Response};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::{
    client,
    config::{self, CredentialError, CredentialFlags},
    connection::{self, ReceiveControl},
    error::{Code, Error, ErrorLevel},
    quic, server,
};

/// An opaque handle wrapping [`config::Configuration`], the api module's
/// counterpart of the async core's settings-plus-credential bundle.
pub struct Configuration {
    inner: config::Configuration,
}

impl Configuration {
    /// Open a configuration from a set of SETTINGS values. No credential is
    /// loaded yet; `settings.send_grease`/`qpack_*` etc. take effect as soon as
    /// a connection or listener is opened from this configuration.
    pub fn open(_api: &Api, settings: config::Settings) -> Self {
        Configuration {
            inner: config::Configuration::new(settings),
        }
    }

    /// Validate and attach a credential. Replaces any credential loaded earlier.
    pub fn load_credential(&mut self, credential: config::Credential, flags: CredentialFlags) -> Result<(), CredentialError> {
        self.inner.load_credential(credential, flags)
    }

    pub fn settings(&self) -> &config::Settings {
        &self.inner.settings
    }

    pub fn credential(&self) -> &config::Credential {
        self.inner.credential()
    }

    pub fn credential_flags(&self) -> CredentialFlags {
        self.inner.credential_flags()
    }

    /// Release this configuration. Connections already opened from it are unaffected.
    pub fn close(self) {}
}

/// Fan `result` out to `on_event` as a [`Event::SendComplete`], plus a
/// [`Event::PeerReceiveAborted`] if the peer is the reason it failed.
fn report_send_complete(on_event: &Mutex<dyn FnMut(Event) + Send>, result: &Result<(), Error>) {
    let mut on_event = on_event.lock().expect("event callback mutex is never held across a panic");
    on_event(Event::SendComplete { canceled: result.is_err() });
    if let Err(e) = result {
        on_event(Event::PeerReceiveAborted { error: e.code() });
    }
}

/// Placeholder byte budget reported by [`Event::IdealSendSize`]. The `quic`
/// transport trait this crate is generic over has no live byte-credit query
/// (unlike a real QUIC stack's flow-control window), so this is a fixed hint
/// rather than a value that tracks actual send-buffer occupancy.
const IDEAL_SEND_SIZE_HINT: u64 = 64 * 1024;

/// A handle to the ambient Tokio runtime used to drive connections and
/// listeners opened through this module.
///
/// This crate never owns its own threads: `Api` is a cheap capture of the
/// caller's runtime, not a runtime of its own.
#[derive(Clone)]
pub struct Api {
    handle: tokio::runtime::Handle,
}

impl Api {
    /// Capture the ambient Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics outside of a Tokio runtime context, mirroring
    /// [`tokio::runtime::Handle::current`].
    pub fn open() -> Self {
        Api {
            handle: tokio::runtime::Handle::current(),
        }
    }

    /// Release this handle. Connections and listeners already spawned from it
    /// keep running; the runtime itself is never torn down by this call.
    pub fn close(self) {}

    pub(crate) fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }
}

/// An event fanned out from a [`Connecting`] or a request's background receive
/// task to the callback supplied when it was opened.
#[derive(Debug, Clone)]
pub enum Event {
    /// The HTTP/3 handshake (SETTINGS exchange) completed.
    Connected,
    /// The transport tore the connection down, or a protocol violation forced
    /// this endpoint to do so.
    ShutdownInitiatedByTransport {
        /// The code this endpoint is closing the connection with.
        error: Code,
    },
    /// The peer initiated the shutdown (GOAWAY observed, or the peer reset a
    /// stream this side was relying on).
    ShutdownInitiatedByPeer {
        /// The code reported by the peer.
        error: Code,
    },
    /// The connection has fully torn down; state scoped to it may be freed.
    ShutdownComplete,
    /// A trailer field section was received for a request's body.
    TrailersReceived(HeaderMap),
    /// A chunk of body data arrived.
    DataReceived(Bytes),
    /// The peer finished sending on this stream (FIN observed).
    PeerSendShutdown,
    /// The peer reset their send side.
    PeerSendAborted {
        /// The code the peer reset with.
        error: Code,
    },
    /// An approximate hint of how much data could be sent right now without
    /// blocking. Fired once a response/request's headers are away.
    IdealSendSize {
        bytes: u64,
    },
    /// A `send_data`/`send_trailers`/`finish` call completed; `canceled` is set
    /// if it completed with an error instead of succeeding.
    SendComplete {
        canceled: bool,
    },
    /// The peer stopped accepting data on this stream (observed as a transport
    /// error surfacing from a send call).
    PeerReceiveAborted {
        /// The code the peer reported.
        error: Code,
    },
}

/// Drives one accepted server connection on a background task.
///
/// Each request it accepts is handed to `on_request`; connection-lifecycle
/// events (`CONNECTED`, `SHUTDOWN_*`) are handed to `on_event`. Dropping this
/// handle does not stop the background task — call [`Connecting::close`] to
/// do that explicitly, matching the rest of this module's opaque-handle shape.
pub struct Connecting<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    task: JoinHandle<()>,
    _conn: std::marker::PhantomData<(C, B)>,
}

impl<C, B> Connecting<C, B>
where
    C: quic::Connection<B> + Send + 'static,
    B: Buf + Send + 'static,
    C::BidiStream: quic::BidiStream<B> + Send + 'static,
    <C::BidiStream as quic::BidiStream<B>>::SendStream: Send + 'static,
    <C::BidiStream as quic::BidiStream<B>>::RecvStream: Send + 'static,
{
    /// Build the HTTP/3 server connection over `conn` and start accepting
    /// requests on a background task.
    pub fn open<F, R>(api: &Api, conn: C, mut on_event: F, mut on_request: R) -> Self
    where
        F: FnMut(Event) + Send + 'static,
        R: FnMut(IncomingRequest<C::BidiStream, B>) + Send + 'static,
    {
        let task = api.spawn(async move {
            let mut h3 = match server::Connection::new(conn).await {
                Ok(h3) => {
                    on_event(Event::Connected);
                    h3
                }
                Err(e) => {
                    on_event(Event::ShutdownInitiatedByTransport { error: e.code() });
                    on_event(Event::ShutdownComplete);
                    return;
                }
            };

            loop {
                match h3.accept().await {
                    Ok(Some((request, stream))) => on_request(IncomingRequest { request, stream }),
                    Ok(None) => break,
                    Err(e) if e.level() == ErrorLevel::StreamError => {
                        trace!("request stream error, connection continues: {e}");
                        continue;
                    }
                    Err(e) => {
                        on_event(Event::ShutdownInitiatedByTransport { error: e.code() });
                        break;
                    }
                }
            }

            on_event(Event::ShutdownComplete);
        });

        Connecting {
            task,
            _conn: std::marker::PhantomData,
        }
    }

    /// Stop driving this connection and wait for the background task to exit.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    /// Stop driving this connection without waiting for the background task.
    pub fn close(self) {
        self.task.abort();
    }
}

/// A request accepted on a server connection, delivered to the `on_request`
/// callback passed to [`Connecting::open`].
pub struct IncomingRequest<S, B>
where
    S: quic::BidiStream<B>,
    B: Buf,
{
    request: HttpRequest<()>,
    stream: server::RequestStream<S, B>,
}

impl<S, B> IncomingRequest<S, B>
where
    S: quic::BidiStream<B>,
    B: Buf,
{
    /// The request's method, URI, and headers.
    pub fn request(&self) -> &HttpRequest<()> {
        &self.request
    }

    /// Escape hatch to the async core: drive this request's response and body
    /// directly with `.await`, bypassing the callback/event shape entirely.
    pub fn into_parts(self) -> (HttpRequest<()>, server::RequestStream<S, B>) {
        (self.request, self.stream)
    }
}

impl<S, B> IncomingRequest<S, B>
where
    S: quic::BidiStream<B> + Send + 'static,
    S::SendStream: Send + 'static,
    S::RecvStream: Send + 'static,
    B: Buf + Send + 'static,
{
    /// Send the response headers, then split the stream: the body-send half is
    /// returned as a [`RequestStream`] handle, and the body-receive half is
    /// driven on a background task that reports its events to `on_event`.
    pub async fn accept<F>(mut self, api: &Api, response: Response<()>, on_event: F) -> Result<RequestStream<S::SendStream, B>, Error>
    where
        F: FnMut(Event) + Send + 'static,
    {
        self.stream.send_response(response).await?;
        let (send, mut recv) = self.stream.split();
        let receive = send.receive_control();
        let on_event: Arc<Mutex<dyn FnMut(Event) + Send>> = Arc::new(Mutex::new(on_event));
        let recv_events = on_event.clone();

        api.spawn(async move {
            loop {
                match recv.recv_data().await {
                    Ok(Some(mut buf)) => {
                        (recv_events.lock().expect("event callback mutex is never held across a panic"))(Event::DataReceived(
                            buf.copy_to_bytes(buf.remaining()),
                        ))
                    }
                    Ok(None) => {
                        (recv_events.lock().expect("event callback mutex is never held across a panic"))(Event::PeerSendShutdown);
                        break;
                    }
                    Err(e) if e.code() == Code::H3_NO_ERROR => break,
                    Err(e) => {
                        (recv_events.lock().expect("event callback mutex is never held across a panic"))(Event::PeerSendAborted {
                            error: e.code(),
                        });
                        break;
                    }
                }
            }
        });

        (on_event.lock().expect("event callback mutex is never held across a panic"))(Event::IdealSendSize { bytes: IDEAL_SEND_SIZE_HINT });

        Ok(RequestStream { inner: send, receive, on_event })
    }
}

/// The send half of a request stream, returned by [`IncomingRequest::accept`].
///
/// The receive half runs on its own background task reporting [`Event`]s; this
/// handle exposes the send-side async-core methods plus the `receive_control`
/// gate ([`RequestStream::set_receive_enabled`]/`complete_receive`) that
/// controls what that background task delivers.
pub struct RequestStream<S, B> {
    inner: server::RequestStream<S, B>,
    receive: ReceiveControl,
    on_event: Arc<Mutex<dyn FnMut(Event) + Send>>,
}

impl<S, B> RequestStream<S, B> {
    /// Pause or resume delivery of further `DataReceived` events.
    pub fn set_receive_enabled(&self, enabled: bool) {
        self.receive.set_receive_enabled(enabled);
    }

    /// Acknowledge `len` bytes of a previously delivered chunk and resume
    /// delivery if it was paused.
    pub fn complete_receive(&self, len: usize) {
        self.receive.complete_receive(len);
    }
}

impl<S, B> RequestStream<S, B>
where
    S: quic::SendStream<B>,
    B: Buf,
{
    /// Send some response body data.
    pub async fn send_data(&mut self, buf: B) -> Result<(), Error> {
        let result = self.inner.send_data(buf).await;
        report_send_complete(&self.on_event, &result);
        result
    }

    /// Send trailers, ending the response.
    pub async fn send_trailers(&mut self, trailers: HeaderMap) -> Result<(), Error> {
        let result = self.inner.send_trailers(trailers).await;
        report_send_complete(&self.on_event, &result);
        result
    }

    /// End the response without trailers.
    pub async fn finish(&mut self) -> Result<(), Error> {
        let result = self.inner.finish().await;
        report_send_complete(&self.on_event, &result);
        result
    }

    /// Abort the response with an error code.
    pub fn stop_stream(&mut self, error_code: Code) {
        self.inner.stop_stream(error_code);
    }
}

/// Drives one client connection's control stream on a background task, the
/// client-side counterpart of [`Connecting`].
///
/// Dropping this handle does not stop the background task — call
/// [`Connection::shutdown`] or [`Connection::close`] to do that explicitly.
pub struct Connection<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
{
    task: JoinHandle<()>,
    send_request: client::SendRequest<C::OpenStreams, B>,
    on_event: Arc<Mutex<dyn FnMut(Event) + Send>>,
}

impl<C, B> Connection<C, B>
where
    C: quic::Connection<B> + Send + 'static,
    B: Buf + Send + 'static,
    C::OpenStreams: Send + 'static,
{
    /// Complete the client handshake over `conn` and start driving its control
    /// stream on a background task, reporting lifecycle events to `on_event`.
    ///
    /// A handshake failure (e.g. no peer ever accepts the transport's opened
    /// streams) is reported as `ShutdownInitiatedByTransport` followed by
    /// `ShutdownComplete`, never `Connected`.
    pub async fn open<F>(api: &Api, conn: C, on_event: F) -> Result<Self, Error>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let on_event: Arc<Mutex<dyn FnMut(Event) + Send>> = Arc::new(Mutex::new(on_event));

        let (mut driver, send_request) = match client::new(conn).await {
            Ok(pair) => pair,
            Err(e) => {
                let mut cb = on_event.lock().expect("event callback mutex is never held across a panic");
                cb(Event::ShutdownInitiatedByTransport { error: e.code() });
                cb(Event::ShutdownComplete);
                drop(cb);
                return Err(e);
            }
        };
        (on_event.lock().expect("event callback mutex is never held across a panic"))(Event::Connected);

        let driver_events = on_event.clone();
        let task = api.spawn(async move {
            if let Err(e) = future::poll_fn(|cx| driver.poll_close(cx)).await {
                (driver_events.lock().expect("event callback mutex is never held across a panic"))(Event::ShutdownInitiatedByTransport {
                    error: e.code(),
                });
            }
        });

        Ok(Connection { task, send_request, on_event })
    }

    /// Stop driving this connection and wait for the background task to exit.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
        (self.on_event.lock().expect("event callback mutex is never held across a panic"))(Event::ShutdownComplete);
    }

    /// Stop driving this connection without waiting for the background task.
    pub fn close(self) {
        self.task.abort();
        (self.on_event.lock().expect("event callback mutex is never held across a panic"))(Event::ShutdownComplete);
    }
}

impl<C, B> Connection<C, B>
where
    C: quic::Connection<B>,
    B: Buf,
    C::OpenStreams: quic::OpenStreams<B>,
    <C::OpenStreams as quic::OpenStreams<B>>::BidiStream: quic::BidiStream<B>,
{
    /// Send a request's headers, returning a handle to drive its body and
    /// response. Escape hatch to the async core: call
    /// [`Request::accept_response`] to move to the callback/event shape, or
    /// drop down to `.await`ing the underlying `client::RequestStream`
    /// directly via the handle's own send-side methods.
    pub async fn request(&mut self, req: HttpRequest<()>) -> Result<Request<<C::OpenStreams as quic::OpenStreams<B>>::BidiStream, B>, Error> {
        let inner = self.send_request.send_request(req).await?;
        Ok(Request { inner })
    }
}

/// A request opened on a [`Connection`], the client-side counterpart of
/// [`IncomingRequest`].
pub struct Request<S, B>
where
    S: quic::BidiStream<B>,
    B: Buf,
{
    inner: client::RequestStream<S, B>,
}

impl<S, B> Request<S, B>
where
    S: quic::SendStream<B> + quic::BidiStream<B>,
    B: Buf,
{
    /// Send some request body data.
    pub async fn send_data(&mut self, buf: B) -> Result<(), Error> {
        self.inner.send_data(buf).await
    }

    /// Send trailers, ending the request.
    pub async fn send_trailers(&mut self, trailers: HeaderMap) -> Result<(), Error> {
        self.inner.send_trailers(trailers).await
    }

    /// End the request without trailers.
    pub async fn finish(&mut self) -> Result<(), Error> {
        self.inner.finish().await
    }
}

impl<S, B> Request<S, B>
where
    S: quic::BidiStream<B> + Send + 'static,
    S::SendStream: Send + 'static,
    S::RecvStream: Send + 'static,
    B: Buf + Send + 'static,
{
    /// Await the response headers, then split the stream: the body-send half
    /// is returned as a [`ClientRequestStream`] handle, and the body-receive
    /// half is driven on a background task that reports its events to
    /// `on_event`, mirroring [`IncomingRequest::accept`].
    pub async fn accept_response<F>(self, api: &Api, on_event: F) -> Result<(Response<()>, ClientRequestStream<S::SendStream, B>), Error>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let mut inner = self.inner;
        let response = inner.recv_response().await?;
        let (send, mut recv) = inner.split();
        let receive = send.receive_control();
        let on_event: Arc<Mutex<dyn FnMut(Event) + Send>> = Arc::new(Mutex::new(on_event));
        let recv_events = on_event.clone();

        api.spawn(async move {
            loop {
                match recv.recv_data().await {
                    Ok(Some(mut buf)) => {
                        (recv_events.lock().expect("event callback mutex is never held across a panic"))(Event::DataReceived(
                            buf.copy_to_bytes(buf.remaining()),
                        ))
                    }
                    Ok(None) => {
                        (recv_events.lock().expect("event callback mutex is never held across a panic"))(Event::PeerSendShutdown);
                        break;
                    }
                    Err(e) if e.code() == Code::H3_NO_ERROR => break,
                    Err(e) => {
                        (recv_events.lock().expect("event callback mutex is never held across a panic"))(Event::PeerSendAborted {
                            error: e.code(),
                        });
                        break;
                    }
                }
            }
        });

        (on_event.lock().expect("event callback mutex is never held across a panic"))(Event::IdealSendSize { bytes: IDEAL_SEND_SIZE_HINT });

        Ok((response, ClientRequestStream { inner: send, receive, on_event }))
    }
}

/// The send half of a client request stream, returned by
/// [`Request::accept_response`]. The receive half runs on its own background
/// task reporting [`Event`]s.
pub struct ClientRequestStream<S, B> {
    inner: client::RequestStream<S, B>,
    receive: ReceiveControl,
    on_event: Arc<Mutex<dyn FnMut(Event) + Send>>,
}

impl<S, B> ClientRequestStream<S, B> {
    /// Pause or resume delivery of further `DataReceived` events.
    pub fn set_receive_enabled(&self, enabled: bool) {
        self.receive.set_receive_enabled(enabled);
    }

    /// Acknowledge `len` bytes of a previously delivered chunk and resume
    /// delivery if it was paused.
    pub fn complete_receive(&self, len: usize) {
        self.receive.complete_receive(len);
    }
}

impl<S, B> ClientRequestStream<S, B>
where
    S: quic::SendStream<B>,
    B: Buf,
{
    /// Send some request body data.
    pub async fn send_data(&mut self, buf: B) -> Result<(), Error> {
        let result = self.inner.send_data(buf).await;
        report_send_complete(&self.on_event, &result);
        result
    }

    /// Send trailers, ending the request.
    pub async fn send_trailers(&mut self, trailers: HeaderMap) -> Result<(), Error> {
        let result = self.inner.send_trailers(trailers).await;
        report_send_complete(&self.on_event, &result);
        result
    }

    /// End the request without trailers.
    pub async fn finish(&mut self) -> Result<(), Error> {
        let result = self.inner.finish().await;
        report_send_complete(&self.on_event, &result);
        result
    }

    /// Abort the request with an error code.
    pub fn stop_stream(&mut self, error_code: Code) {
        self.inner.stop_stream(error_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn api_open_captures_current_runtime() {
        let api = Api::open();
        api.close();
    }

    #[test]
    fn event_is_debug_and_clone() {
        let ev = Event::ShutdownInitiatedByTransport { error: Code::H3_NO_ERROR };
        let cloned = ev.clone();
        assert_eq!(format!("{:?}", ev), format!("{:?}", cloned));
    }

    #[tokio::test]
    async fn configuration_open_has_no_credential_until_loaded() {
        let api = Api::open();
        let mut config = Configuration::open(&api, config::Settings::default());
        assert!(matches!(config.credential(), config::Credential::None));

        config
            .load_credential(config::Credential::SelfSigned, CredentialFlags::empty())
            .expect("self-signed credential is valid");
        assert!(matches!(config.credential(), config::Credential::SelfSigned));

        config.close();
        api.close();
    }
}
