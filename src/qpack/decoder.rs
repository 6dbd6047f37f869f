//! The QPACK decoder: applies encoder-stream instructions to a mirrored dynamic
//! table and decodes field sections once their required insert count is satisfied.

use bytes::Buf;

use super::block::{BlockError, FieldLine, HeaderPrefix};
use super::dynamic::{DynamicTable, InsertionBlocked};
use super::stream::{DecoderInstruction, EncoderInstruction, StreamInstructionError};
use super::{static_table, Decoded, HeaderField};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DecoderError {
    Block(BlockError),
    Instruction(StreamInstructionError),
    InsertionBlocked,
    UnknownStaticIndex(u64),
    UnknownDynamicIndex,
}

impl From<BlockError> for DecoderError {
    fn from(e: BlockError) -> Self {
        DecoderError::Block(e)
    }
}

impl From<StreamInstructionError> for DecoderError {
    fn from(e: StreamInstructionError) -> Self {
        DecoderError::Instruction(e)
    }
}

impl From<InsertionBlocked> for DecoderError {
    fn from(_: InsertionBlocked) -> Self {
        DecoderError::InsertionBlocked
    }
}

impl std::fmt::Display for DecoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for DecoderError {}

/// Result of attempting to decode one field section.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// The section references an insert count the decoder's table hasn't reached yet;
    /// the stream is parked until `on_encoder_instruction` advances the table far enough.
    Blocked { required_insert_count: u64 },
    Done(Decoded),
}

/// The per-connection QPACK decoder state: one dynamic table mirroring the peer
/// encoder's, fed by the instructions the encoder sends on its unidirectional stream.
pub struct Decoder {
    table: DynamicTable,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            table: DynamicTable::new(),
        }
    }

    pub fn known_insert_count(&self) -> u64 {
        self.table.insert_count()
    }

    /// Apply one instruction read off the encoder stream. Returns the decoder-stream
    /// instruction to send back in acknowledgement, if any.
    pub fn on_encoder_instruction(
        &mut self,
        instr: EncoderInstruction,
    ) -> Result<Option<DecoderInstruction>, DecoderError> {
        match instr {
            EncoderInstruction::SetDynamicTableCapacity(capacity) => {
                self.table.set_capacity(capacity as usize)?;
                Ok(None)
            }
            EncoderInstruction::InsertWithNameRef { dynamic, index, value } => {
                let name = if dynamic {
                    let absolute = self.resolve_relative_to_newest(index)?;
                    self.table
                        .get(absolute)
                        .ok_or(DecoderError::UnknownDynamicIndex)?
                        .name
                        .clone()
                } else {
                    static_table::get(index as usize)
                        .ok_or(DecoderError::UnknownStaticIndex(index))?
                        .0
                        .to_vec()
                        .into()
                };
                self.table.insert(HeaderField { name, value })?;
                Ok(Some(DecoderInstruction::InsertCountIncrement(1)))
            }
            EncoderInstruction::InsertWithLiteralName { name, value } => {
                self.table.insert(HeaderField::new(name, value))?;
                Ok(Some(DecoderInstruction::InsertCountIncrement(1)))
            }
            EncoderInstruction::Duplicate(index) => {
                let absolute = self.resolve_relative_to_newest(index)?;
                self.table.duplicate(absolute)?;
                Ok(Some(DecoderInstruction::InsertCountIncrement(1)))
            }
        }
    }

    /// `Duplicate` and name-only `InsertWithNameRef` index relative to the most
    /// recently inserted entry, not to a field section's `Base`.
    fn resolve_relative_to_newest(&self, relative: u64) -> Result<u64, DecoderError> {
        let count = self.table.insert_count();
        count
            .checked_sub(1)
            .and_then(|newest| newest.checked_sub(relative))
            .ok_or(DecoderError::UnknownDynamicIndex)
    }

    /// Decode a complete field section, or report that it's blocked on more inserts.
    pub fn decode_field_section<B: Buf>(&mut self, buf: &mut B) -> Result<DecodeOutcome, DecoderError> {
        let prefix = HeaderPrefix::decode(buf)?;
        if prefix.required_insert_count > self.table.insert_count() {
            return Ok(DecodeOutcome::Blocked {
                required_insert_count: prefix.required_insert_count,
            });
        }

        let mut fields = Vec::new();
        while buf.has_remaining() {
            let line = FieldLine::decode(buf)?;
            fields.push(self.resolve_field_line(line, prefix.base)?);
        }
        Ok(DecodeOutcome::Done(Decoded { fields }))
    }

    fn resolve_field_line(&self, line: FieldLine, base: u64) -> Result<HeaderField, DecoderError> {
        match line {
            FieldLine::Indexed { dynamic: false, index } => {
                let (name, value) = static_table::get(index as usize)
                    .ok_or(DecoderError::UnknownStaticIndex(index))?;
                Ok(HeaderField::new(name.to_vec(), value.to_vec()))
            }
            FieldLine::Indexed { dynamic: true, index } => {
                let absolute = base
                    .checked_sub(index + 1)
                    .ok_or(DecoderError::UnknownDynamicIndex)?;
                self.table
                    .get(absolute)
                    .cloned()
                    .ok_or(DecoderError::UnknownDynamicIndex)
            }
            FieldLine::LiteralWithNameRef { dynamic: false, index, value, .. } => {
                let (name, _) = static_table::get(index as usize)
                    .ok_or(DecoderError::UnknownStaticIndex(index))?;
                Ok(HeaderField::new(name.to_vec(), value))
            }
            FieldLine::LiteralWithNameRef { dynamic: true, index, value, .. } => {
                let absolute = base
                    .checked_sub(index + 1)
                    .ok_or(DecoderError::UnknownDynamicIndex)?;
                let name = self
                    .table
                    .get(absolute)
                    .ok_or(DecoderError::UnknownDynamicIndex)?
                    .name
                    .clone();
                Ok(HeaderField { name, value })
            }
            FieldLine::LiteralWithLiteralName { name, value, .. } => Ok(HeaderField { name, value }),
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a field section encoded with [`super::encoder::encode_stateless`]: no
/// dynamic-table entries are expected, so an empty table is enough.
pub fn decode_stateless<B: Buf>(buf: &mut B) -> Result<Decoded, DecoderError> {
    match Decoder::new().decode_field_section(buf)? {
        DecodeOutcome::Done(decoded) => Ok(decoded),
        DecodeOutcome::Blocked { .. } => Err(DecoderError::InsertionBlocked),
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::*;

    #[test]
    fn insert_then_decode_dynamic_reference() {
        let mut decoder = Decoder::new();
        decoder
            .on_encoder_instruction(EncoderInstruction::SetDynamicTableCapacity(4096))
            .unwrap();
        decoder
            .on_encoder_instruction(EncoderInstruction::InsertWithLiteralName {
                name: Bytes::from_static(b"x-custom"),
                value: Bytes::from_static(b"value"),
            })
            .unwrap();
        assert_eq!(decoder.known_insert_count(), 1);

        let mut buf = BytesMut::new();
        HeaderPrefix { required_insert_count: 1, base: 1 }.encode(&mut buf);
        FieldLine::Indexed { dynamic: true, index: 0 }.encode(&mut buf);

        match decoder.decode_field_section(&mut buf.freeze()).unwrap() {
            DecodeOutcome::Done(decoded) => {
                assert_eq!(decoded.fields, vec![HeaderField::new("x-custom", "value")]);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn decode_blocks_on_missing_inserts() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        HeaderPrefix { required_insert_count: 3, base: 3 }.encode(&mut buf);
        match decoder.decode_field_section(&mut buf.freeze()).unwrap() {
            DecodeOutcome::Blocked { required_insert_count } => assert_eq!(required_insert_count, 3),
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[test]
    fn decode_stateless_roundtrips_with_encode_stateless() {
        use super::super::encoder::encode_stateless;

        let fields = vec![HeaderField::new(":method", "GET"), HeaderField::new("x-trailer", "1")];
        let mut block = BytesMut::new();
        encode_stateless(&mut block, fields.iter());
        let decoded = decode_stateless(&mut block.freeze()).unwrap();
        assert_eq!(decoded.fields, fields);
    }

    #[test]
    fn static_indexed_field_decodes_without_table() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        HeaderPrefix { required_insert_count: 0, base: 0 }.encode(&mut buf);
        FieldLine::Indexed { dynamic: false, index: 0 }.encode(&mut buf);
        match decoder.decode_field_section(&mut buf.freeze()).unwrap() {
            DecodeOutcome::Done(decoded) => assert_eq!(decoded.fields.len(), 1),
            other => panic!("expected Done, got {other:?}"),
        }
    }
}
