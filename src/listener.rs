//! Accepts incoming QUIC connections and hands them to a server connection
//! driver.
//!
//! Binding the actual socket is the caller's transport's job (see
//! [`crate::quic::Listen`]); this module only turns accepted connections into
//! [`Event`]s and callback invocations, matching the rest of [`crate::api`]'s
//! opaque-handle shape.

use bytes::Buf;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::{
    api::{Api, Event},
    quic,
};

/// Accepts connections on a bound listening socket, handing each one to
/// `on_connection` as a raw [`quic::Connection`] for the caller to promote
/// into a [`crate::api::Connecting`] (or drive directly through
/// [`crate::server`]).
pub struct Listener {
    task: JoinHandle<()>,
}

impl Listener {
    /// Start accepting connections from `listen` on a background task.
    pub fn open<L, C, B, F, G>(api: &Api, mut listen: L, mut on_connection: F, mut on_event: G) -> Self
    where
        L: quic::Listen<B, Connection = C> + Send + 'static,
        C: quic::Connection<B> + Send + 'static,
        B: Buf + Send + 'static,
        F: FnMut(C) + Send + 'static,
        G: FnMut(Event) + Send + 'static,
    {
        let api = api.clone();
        let task = api.spawn(async move {
            loop {
                match futures_util::future::poll_fn(|cx| listen.poll_accept(cx)).await {
                    Ok(Some(conn)) => on_connection(conn),
                    Ok(None) => {
                        trace!("listener socket closed, no further connections");
                        break;
                    }
                    Err(_) => break,
                }
            }
            on_event(Event::ShutdownComplete);
        });

        Listener { task }
    }

    /// Stop accepting connections and wait for the background task to exit.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    /// Stop accepting connections without waiting for the background task.
    pub fn close(self) {
        self.task.abort();
    }
}
