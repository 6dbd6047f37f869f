//! The split between HTTP pseudo-headers (`:method`, `:scheme`, `:authority`, `:path`,
//! `:status`) and regular header fields, and the flat, ordered field list QPACK
//! actually encodes (RFC 9114 section 4.3: pseudo-headers must precede regular ones).

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use crate::qpack::HeaderField;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HeaderError {
    MissingPseudo(&'static str),
    PseudoAfterRegular,
    InvalidMethod,
    InvalidStatus,
    InvalidName,
    InvalidValue,
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::MissingPseudo(name) => write!(f, "missing pseudo-header {name}"),
            HeaderError::PseudoAfterRegular => write!(f, "pseudo-header field after a regular header field"),
            HeaderError::InvalidMethod => write!(f, "invalid :method value"),
            HeaderError::InvalidStatus => write!(f, "invalid :status value"),
            HeaderError::InvalidName => write!(f, "invalid header field name"),
            HeaderError::InvalidValue => write!(f, "invalid header field value"),
        }
    }
}

impl std::error::Error for HeaderError {}

/// A request, response, or trailer section: pseudo-headers plus a regular field map,
/// kept apart because they're encoded/decoded/printed differently but share one wire
/// representation (an ordered [`HeaderField`] list with pseudo-headers first).
#[derive(Debug, Clone, Default)]
pub struct Header {
    pub method: Option<Method>,
    pub scheme: Option<Bytes>,
    pub authority: Option<Bytes>,
    pub path: Option<Bytes>,
    pub status: Option<StatusCode>,
    pub fields: HeaderMap,
}

impl Header {
    pub fn request(method: Method, scheme: Bytes, authority: Bytes, path: Bytes, fields: HeaderMap) -> Self {
        Self {
            method: Some(method),
            scheme: Some(scheme),
            authority: Some(authority),
            path: Some(path),
            status: None,
            fields,
        }
    }

    pub fn response(status: StatusCode, fields: HeaderMap) -> Self {
        Self {
            status: Some(status),
            fields,
            ..Default::default()
        }
    }

    pub fn trailer(fields: HeaderMap) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    /// Project to the flat, ordered wire representation: pseudo-headers first, in a
    /// fixed canonical order, then regular fields in `HeaderMap` iteration order.
    pub fn into_qpack_fields(self) -> Vec<HeaderField> {
        let mut out = Vec::with_capacity(self.fields.len() + 5);
        if let Some(method) = &self.method {
            out.push(HeaderField::new(":method", method.as_str().to_string()));
        }
        if let Some(scheme) = self.scheme {
            out.push(HeaderField::new(":scheme", scheme));
        }
        if let Some(authority) = self.authority {
            out.push(HeaderField::new(":authority", authority));
        }
        if let Some(path) = self.path {
            out.push(HeaderField::new(":path", path));
        }
        if let Some(status) = &self.status {
            out.push(HeaderField::new(":status", status.as_str().to_string()));
        }
        for (name, value) in self.fields.iter() {
            out.push(HeaderField::new(name.as_str().to_string(), value.as_bytes().to_vec()));
        }
        out
    }

    /// Reassemble from a decoded field list, validating that all pseudo-headers
    /// precede all regular headers (RFC 9114 section 4.3).
    pub fn try_from_qpack_fields(decoded: Vec<HeaderField>) -> Result<Self, HeaderError> {
        let mut header = Header::default();
        let mut seen_regular = false;

        for field in decoded {
            if field.name.starts_with(b":") {
                if seen_regular {
                    return Err(HeaderError::PseudoAfterRegular);
                }
                match &field.name[..] {
                    b":method" => {
                        header.method =
                            Some(Method::from_bytes(&field.value).map_err(|_| HeaderError::InvalidMethod)?);
                    }
                    b":scheme" => header.scheme = Some(field.value),
                    b":authority" => header.authority = Some(field.value),
                    b":path" => header.path = Some(field.value),
                    b":status" => {
                        let code = std::str::from_utf8(&field.value)
                            .ok()
                            .and_then(|s| s.parse::<u16>().ok())
                            .ok_or(HeaderError::InvalidStatus)?;
                        header.status = Some(StatusCode::from_u16(code).map_err(|_| HeaderError::InvalidStatus)?);
                    }
                    _ => (), // unrecognized pseudo-header: ignored, not an error
                }
            } else {
                seen_regular = true;
                let name = HeaderName::from_bytes(&field.name).map_err(|_| HeaderError::InvalidName)?;
                let value = HeaderValue::from_bytes(&field.value).map_err(|_| HeaderError::InvalidValue)?;
                header.fields.append(name, value);
            }
        }
        Ok(header)
    }

    pub fn require_request_pseudo(&self) -> Result<(), HeaderError> {
        if self.method.is_none() {
            return Err(HeaderError::MissingPseudo(":method"));
        }
        if self.path.is_none() {
            return Err(HeaderError::MissingPseudo(":path"));
        }
        Ok(())
    }

    pub fn require_response_pseudo(&self) -> Result<(), HeaderError> {
        if self.status.is_none() {
            return Err(HeaderError::MissingPseudo(":status"));
        }
        Ok(())
    }
}
