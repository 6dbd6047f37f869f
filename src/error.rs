//! Error codes and error types used across the connection and stream state machines.

use std::fmt;
use std::sync::Arc;

use crate::proto::headers::HeaderError;
use crate::qpack::decoder::DecoderError;
use crate::quic;

/// An application error code, as sent on `CONNECTION_CLOSE`, `RESET_STREAM`, or `STOP_SENDING`.
///
/// Values above the known `H3_*`/`QPACK_*` constants are passed through unchanged so
/// transport-level or application-level codes can still be represented.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Code(u64);

macro_rules! codes {
    ($($(#[$docs:meta])* ($num:expr, $name:ident, $reason:expr);)+) => {
        impl Code {
            $($(#[$docs])* pub const $name: Code = Code($num);)+

            pub(crate) fn reason(&self) -> &'static str {
                match self.0 {
                    $($num => $reason,)+
                    _ => "unknown error code",
                }
            }
        }

        impl fmt::Debug for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($num => write!(f, "{}", stringify!($name)),)+
                    n => write!(f, "0x{n:x}"),
                }
            }
        }
    };
}

codes! {
    (0x100, H3_NO_ERROR, "no error");
    (0x101, H3_GENERAL_PROTOCOL_ERROR, "general protocol error");
    (0x102, H3_INTERNAL_ERROR, "internal error");
    (0x103, H3_STREAM_CREATION_ERROR, "stream creation error");
    (0x104, H3_CLOSED_CRITICAL_STREAM, "closed critical stream");
    (0x105, H3_FRAME_UNEXPECTED, "frame unexpected for this stream state");
    (0x106, H3_FRAME_ERROR, "malformed frame");
    (0x107, H3_EXCESSIVE_LOAD, "excessive load");
    (0x108, H3_ID_ERROR, "identifier error");
    (0x109, H3_SETTINGS_ERROR, "malformed settings");
    (0x10a, H3_MISSING_SETTINGS, "missing settings");
    (0x10b, H3_REQUEST_REJECTED, "request rejected");
    (0x10c, H3_REQUEST_CANCELLED, "request cancelled");
    (0x10d, H3_REQUEST_INCOMPLETE, "request incomplete");
    (0x10e, H3_MESSAGE_ERROR, "malformed message");
    (0x10f, H3_CONNECT_ERROR, "connect error");
    (0x110, H3_VERSION_FALLBACK, "version fallback");
    (0x200, QPACK_DECOMPRESSION_FAILED, "qpack decompression failed");
    (0x201, QPACK_ENCODER_STREAM_ERROR, "malformed qpack encoder stream instruction");
    (0x202, QPACK_DECODER_STREAM_ERROR, "malformed qpack decoder stream instruction");
}

impl Code {
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn with_reason(self, reason: impl Into<String>, level: ErrorLevel) -> Error {
        Error(Box::new(ErrorImpl {
            kind: Kind::Application {
                code: self,
                reason: Some(reason.into()),
                level,
            },
            cause: None,
        }))
    }

    pub fn with_cause(self, level: ErrorLevel, cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Error {
        Error(Box::new(ErrorImpl {
            kind: Kind::Application {
                code: self,
                reason: None,
                level,
            },
            cause: Some(Arc::from(cause.into())),
        }))
    }

    /// A transport-layer failure surfaced while performing an HTTP/3-level operation
    /// (opening a stream, writing to one). Always connection-scoped: the transport
    /// doesn't distinguish which request triggered it.
    pub fn with_transport(self, cause: impl Into<Box<dyn quic::Error>>) -> Error {
        let cause: Box<dyn quic::Error> = cause.into();
        self.with_reason(cause.to_string(), ErrorLevel::ConnectionError)
    }
}

/// Whether an error tears down the whole connection or resets a single stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorLevel {
    ConnectionError,
    StreamError,
}

#[derive(Clone, Debug)]
enum Kind {
    Application {
        code: Code,
        reason: Option<String>,
        level: ErrorLevel,
    },
    Closed,
}

#[derive(Clone)]
struct ErrorImpl {
    kind: Kind,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

/// The crate-wide error type returned by fallible connection/stream/qpack operations.
///
/// Cheaply [`Clone`]-able (the cause is `Arc`-shared) so a connection-level error can
/// be stored once and handed to every stream still waiting on that connection.
#[derive(Clone)]
pub struct Error(Box<ErrorImpl>);

impl Error {
    pub fn closed() -> Self {
        Self(Box::new(ErrorImpl {
            kind: Kind::Closed,
            cause: None,
        }))
    }

    pub fn code(&self) -> Code {
        match self.0.kind {
            Kind::Application { code, .. } => code,
            Kind::Closed => Code::H3_NO_ERROR,
        }
    }

    pub fn level(&self) -> ErrorLevel {
        match self.0.kind {
            Kind::Application { level, .. } => level,
            Kind::Closed => ErrorLevel::ConnectionError,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.0.kind, Kind::Closed)
    }

    /// An HTTP message's field section exceeded the peer's advertised
    /// `SETTINGS_MAX_FIELD_SECTION_SIZE` (RFC 9114 section 4.2.2). `size` is this
    /// crate's accounted size (RFC 9204 section 3.2.1), not the wire-encoded length.
    pub fn header_too_big(size: u64, max_size: u64) -> Self {
        Code::H3_EXCESSIVE_LOAD.with_reason(
            format!("field section size {size} exceeds peer limit {max_size}"),
            ErrorLevel::StreamError,
        )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            Kind::Application { code, reason, .. } => {
                write!(f, "{:?}", code)?;
                if let Some(reason) = reason {
                    write!(f, ": {reason}")?;
                }
                Ok(())
            }
            Kind::Closed => write!(f, "connection closed"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            Kind::Application { code, reason, .. } => {
                write!(f, "{}", reason.as_deref().unwrap_or_else(|| code.reason()))
            }
            Kind::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Every `quic::{Connection,SendStream,RecvStream}` associated `Error` type is bounded
/// by `Into<Box<dyn quic::Error>>`; this lets `?` convert any of them into an [`Error`]
/// directly, without each call site naming a concrete transport error type.
///
/// A transport error that carries a QUIC error code ([`quic::Error::err_code`]) comes
/// from a `RESET_STREAM`/`STOP_SENDING` on one stream: that code is preserved and the
/// result is scoped to that stream, per
/// [RFC 9114 section 8](https://www.rfc-editor.org/rfc/rfc9114#section-8) ("these error
/// codes ... do not need to be treated as a connection error"). A transport error with
/// no code (a timeout, a closed connection) has no single stream to blame and is
/// treated as connection-fatal.
impl<T: Into<Box<dyn quic::Error>>> From<T> for Error {
    fn from(e: T) -> Self {
        let cause: Box<dyn quic::Error> = e.into();
        match cause.err_code() {
            Some(code) => Code(code).with_reason(cause.to_string(), ErrorLevel::StreamError),
            None => Code::H3_INTERNAL_ERROR.with_reason(cause.to_string(), ErrorLevel::ConnectionError),
        }
    }
}

/// A boxed transport-layer error, as yielded by `quic::{Connection,SendStream,RecvStream}`.
pub type TransportError = Box<dyn quic::Error>;

impl From<HeaderError> for Error {
    fn from(e: HeaderError) -> Self {
        Code::H3_MESSAGE_ERROR.with_cause(ErrorLevel::StreamError, Box::new(e))
    }
}

impl From<DecoderError> for Error {
    fn from(e: DecoderError) -> Self {
        Code::QPACK_DECOMPRESSION_FAILED.with_cause(ErrorLevel::ConnectionError, Box::new(e))
    }
}
