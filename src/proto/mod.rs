pub mod coding;
pub mod frame;
pub mod headers;
pub mod stream;
pub mod varint;
