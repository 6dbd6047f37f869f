//! HTTP/3 client and server core: framing, QPACK, and connection state machines
//! layered over an abstract QUIC transport ([`quic`]).
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod quic;
pub mod server;

pub use error::Error;

mod api;
mod buf;
mod connection;
mod frame;
mod listener;
mod proto;
mod qpack;
mod stream;

pub use api::{Api, ClientRequestStream, Configuration, Connecting, Connection, Event, IncomingRequest, Request, RequestStream};
pub use listener::Listener;
