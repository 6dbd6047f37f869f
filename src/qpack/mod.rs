//! A from-scratch QPACK (RFC 9204) implementation: header compression for HTTP/3,
//! coupled to the encoder/decoder streams that keep both endpoints' dynamic tables
//! in sync.
//!
//! Huffman string coding is not implemented (see [`prefix_string`]); dynamic-table
//! post-base references are never emitted by [`encoder`], which keeps [`decoder`]
//! considerably simpler without giving up correctness — both are optional encoder
//! strategies under RFC 9204, not wire-format requirements.

pub mod block;
pub mod decoder;
pub mod dynamic;
pub mod encoder;
pub mod prefix_int;
pub mod prefix_string;
mod static_table;
pub mod stream;

use bytes::Bytes;

/// A single decompressed or to-be-compressed header name/value pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub(crate) fn mem_size(&self) -> usize {
        // RFC 9204 section 3.2.1: each entry's size is name + value octets, plus 32
        // bytes of accounting overhead.
        self.name.len() + self.value.len() + 32
    }
}

/// A fully decoded field section, in wire order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    pub fields: Vec<HeaderField>,
}

/// Sum of each field's accounted size (RFC 9204 section 3.2.1), used to enforce
/// `SETTINGS_MAX_FIELD_SECTION_SIZE` without involving the dynamic table.
pub fn field_section_mem_size<'f>(fields: impl IntoIterator<Item = &'f HeaderField>) -> u64 {
    fields.into_iter().map(|f| f.mem_size() as u64).sum()
}
