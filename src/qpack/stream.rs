//! Instruction wire formats carried on the QPACK encoder and decoder streams
//! (RFC 9204 sections 4.3 and 4.4).

use bytes::{Buf, BufMut, Bytes};

use super::{prefix_int, prefix_string};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamInstructionError {
    UnexpectedEnd,
    Overflow,
    HuffmanUnsupported,
}

impl From<prefix_int::Error> for StreamInstructionError {
    fn from(e: prefix_int::Error) -> Self {
        match e {
            prefix_int::Error::UnexpectedEnd => StreamInstructionError::UnexpectedEnd,
            prefix_int::Error::Overflow => StreamInstructionError::Overflow,
        }
    }
}

impl From<prefix_string::Error> for StreamInstructionError {
    fn from(e: prefix_string::Error) -> Self {
        match e {
            prefix_string::Error::UnexpectedEnd => StreamInstructionError::UnexpectedEnd,
            prefix_string::Error::Overflow => StreamInstructionError::Overflow,
            prefix_string::Error::HuffmanUnsupported => StreamInstructionError::HuffmanUnsupported,
        }
    }
}

impl std::fmt::Display for StreamInstructionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for StreamInstructionError {}

fn decode_value<B: Buf>(buf: &mut B) -> Result<Bytes, StreamInstructionError> {
    if !buf.has_remaining() {
        return Err(StreamInstructionError::UnexpectedEnd);
    }
    let first = buf.get_u8();
    Ok(prefix_string::decode(7, 0x80, first, buf)?)
}

/// An instruction sent by the encoder to keep the decoder's dynamic table in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderInstruction {
    SetDynamicTableCapacity(u64),
    InsertWithNameRef { dynamic: bool, index: u64, value: Bytes },
    InsertWithLiteralName { name: Bytes, value: Bytes },
    Duplicate(u64),
}

impl EncoderInstruction {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            EncoderInstruction::SetDynamicTableCapacity(capacity) => {
                prefix_int::encode(5, 0x20, *capacity, buf);
            }
            EncoderInstruction::InsertWithNameRef { dynamic, index, value } => {
                let flags = 0x80 | if *dynamic { 0x00 } else { 0x40 };
                prefix_int::encode(6, flags, *index, buf);
                prefix_string::encode(7, 0x00, value, buf);
            }
            EncoderInstruction::InsertWithLiteralName { name, value } => {
                prefix_string::encode(5, 0x40, name, buf);
                prefix_string::encode(7, 0x00, value, buf);
            }
            EncoderInstruction::Duplicate(index) => {
                prefix_int::encode(5, 0x00, *index, buf);
            }
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, StreamInstructionError> {
        if !buf.has_remaining() {
            return Err(StreamInstructionError::UnexpectedEnd);
        }
        let first = buf.get_u8();

        if first & 0x80 != 0 {
            let dynamic = first & 0x40 == 0;
            let index = prefix_int::decode(6, first, buf)?;
            let value = decode_value(buf)?;
            return Ok(EncoderInstruction::InsertWithNameRef { dynamic, index, value });
        }
        if first & 0x40 != 0 {
            let name = prefix_string::decode(5, 0x20, first, buf)?;
            let value = decode_value(buf)?;
            return Ok(EncoderInstruction::InsertWithLiteralName { name, value });
        }
        if first & 0x20 != 0 {
            let capacity = prefix_int::decode(5, first, buf)?;
            return Ok(EncoderInstruction::SetDynamicTableCapacity(capacity));
        }
        let index = prefix_int::decode(5, first, buf)?;
        Ok(EncoderInstruction::Duplicate(index))
    }
}

/// An instruction sent by the decoder back to the encoder, acknowledging progress
/// or cancelling interest in a stream's blocked header block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DecoderInstruction {
    HeaderAck(u64),
    StreamCancel(u64),
    InsertCountIncrement(u64),
}

impl DecoderInstruction {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            DecoderInstruction::HeaderAck(id) => prefix_int::encode(7, 0x80, *id, buf),
            DecoderInstruction::StreamCancel(id) => prefix_int::encode(6, 0x40, *id, buf),
            DecoderInstruction::InsertCountIncrement(inc) => prefix_int::encode(6, 0x00, *inc, buf),
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, StreamInstructionError> {
        if !buf.has_remaining() {
            return Err(StreamInstructionError::UnexpectedEnd);
        }
        let first = buf.get_u8();
        if first & 0x80 != 0 {
            return Ok(DecoderInstruction::HeaderAck(prefix_int::decode(7, first, buf)?));
        }
        if first & 0x40 != 0 {
            return Ok(DecoderInstruction::StreamCancel(prefix_int::decode(6, first, buf)?));
        }
        Ok(DecoderInstruction::InsertCountIncrement(prefix_int::decode(6, first, buf)?))
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn set_capacity_roundtrip() {
        let instr = EncoderInstruction::SetDynamicTableCapacity(220);
        let mut buf = BytesMut::new();
        instr.encode(&mut buf);
        assert_eq!(EncoderInstruction::decode(&mut buf.freeze()).unwrap(), instr);
    }

    #[test]
    fn insert_with_static_name_ref_roundtrip() {
        let instr = EncoderInstruction::InsertWithNameRef {
            dynamic: false,
            index: 23,
            value: Bytes::from_static(b"application/json"),
        };
        let mut buf = BytesMut::new();
        instr.encode(&mut buf);
        assert_eq!(EncoderInstruction::decode(&mut buf.freeze()).unwrap(), instr);
    }

    #[test]
    fn insert_with_literal_name_roundtrip() {
        let instr = EncoderInstruction::InsertWithLiteralName {
            name: Bytes::from_static(b"x-custom"),
            value: Bytes::from_static(b"value"),
        };
        let mut buf = BytesMut::new();
        instr.encode(&mut buf);
        assert_eq!(EncoderInstruction::decode(&mut buf.freeze()).unwrap(), instr);
    }

    #[test]
    fn duplicate_roundtrip() {
        let instr = EncoderInstruction::Duplicate(42);
        let mut buf = BytesMut::new();
        instr.encode(&mut buf);
        assert_eq!(EncoderInstruction::decode(&mut buf.freeze()).unwrap(), instr);
    }

    #[test]
    fn decoder_instructions_roundtrip() {
        for instr in [
            DecoderInstruction::HeaderAck(5),
            DecoderInstruction::StreamCancel(5),
            DecoderInstruction::InsertCountIncrement(5),
        ] {
            let mut buf = BytesMut::new();
            instr.encode(&mut buf);
            assert_eq!(DecoderInstruction::decode(&mut buf.freeze()).unwrap(), instr);
        }
    }
}
