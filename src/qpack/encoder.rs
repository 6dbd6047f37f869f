//! The QPACK encoder: turns header fields into a field-section byte block,
//! opportunistically indexing into the static table or inserting into (and
//! referencing) the dynamic table.

use bytes::BufMut;

use super::block::{FieldLine, HeaderPrefix};
use super::dynamic::DynamicTable;
use super::stream::EncoderInstruction;
use super::{static_table, HeaderField};

pub struct Encoder {
    table: DynamicTable,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            table: DynamicTable::new(),
        }
    }

    pub fn set_capacity<W: BufMut>(&mut self, capacity: usize, encoder_stream: &mut W) {
        // Growing never evicts; shrinking below what's referenced simply fails
        // quietly here, the same as any other insertion that can't evict yet.
        let _ = self.table.set_capacity(capacity);
        EncoderInstruction::SetDynamicTableCapacity(capacity as u64).encode(encoder_stream);
    }

    /// Encode one field section. Returns the absolute dynamic-table indices this
    /// block references; the caller must hold them until the decoder acknowledges
    /// the block (or the stream is reset) and then call [`Encoder::release`].
    pub fn encode<'f, W: BufMut>(
        &mut self,
        block: &mut W,
        encoder_stream: &mut W,
        fields: impl IntoIterator<Item = &'f HeaderField>,
    ) -> Vec<u64> {
        let base = self.table.insert_count();
        let mut lines = Vec::new();
        let mut referenced = Vec::new();
        let mut required_insert_count = 0u64;

        for field in fields {
            let (line, reference) = self.encode_field(field, base, encoder_stream);
            if let Some(absolute) = reference {
                required_insert_count = required_insert_count.max(absolute + 1);
                referenced.push(absolute);
            }
            lines.push(line);
        }
        for &absolute in &referenced {
            self.table.add_ref(absolute);
        }

        HeaderPrefix { required_insert_count, base }.encode(block);
        for line in &lines {
            line.encode(block);
        }
        referenced
    }

    /// Drop the references a now-acknowledged or cancelled header block was holding.
    pub fn release(&mut self, indices: &[u64]) {
        for &absolute in indices {
            self.table.remove_ref(absolute);
        }
    }

    fn encode_field<W: BufMut>(
        &mut self,
        field: &HeaderField,
        base: u64,
        encoder_stream: &mut W,
    ) -> (FieldLine, Option<u64>) {
        if let Some(index) = static_table::find_with_value(&field.name, &field.value) {
            return (FieldLine::Indexed { dynamic: false, index: index as u64 }, None);
        }

        if let Some((absolute, true)) = self.table.find(&field.name, &field.value) {
            let index = base - absolute - 1;
            return (FieldLine::Indexed { dynamic: true, index }, Some(absolute));
        }

        let static_name_index = static_table::find_name(&field.name);
        let dynamic_name_absolute = self.table.find(&field.name, &field.value).map(|(abs, _)| abs);
        let dynamic_name_relative = dynamic_name_absolute.map(|abs| self.table.insert_count() - 1 - abs);

        if let Ok(absolute) = self.table.insert(field.clone()) {
            if let Some(index) = static_name_index {
                EncoderInstruction::InsertWithNameRef {
                    dynamic: false,
                    index: index as u64,
                    value: field.value.clone(),
                }
                .encode(encoder_stream);
            } else if let Some(index) = dynamic_name_relative {
                EncoderInstruction::InsertWithNameRef {
                    dynamic: true,
                    index,
                    value: field.value.clone(),
                }
                .encode(encoder_stream);
            } else {
                EncoderInstruction::InsertWithLiteralName {
                    name: field.name.clone(),
                    value: field.value.clone(),
                }
                .encode(encoder_stream);
            }
            let index = base - absolute - 1;
            return (FieldLine::Indexed { dynamic: true, index }, Some(absolute));
        }

        if let Some(index) = static_name_index {
            return (
                FieldLine::LiteralWithNameRef {
                    dynamic: false,
                    never_indexed: false,
                    index: index as u64,
                    value: field.value.clone(),
                },
                None,
            );
        }
        if let Some(absolute) = dynamic_name_absolute {
            let index = base - absolute - 1;
            return (
                FieldLine::LiteralWithNameRef {
                    dynamic: true,
                    never_indexed: false,
                    index,
                    value: field.value.clone(),
                },
                Some(absolute),
            );
        }
        (
            FieldLine::LiteralWithLiteralName {
                never_indexed: false,
                name: field.name.clone(),
                value: field.value.clone(),
            },
            None,
        )
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a field section with no dynamic-table participation: every field either
/// hits the static table or is sent as a literal. Used for trailers and other
/// one-off sections not worth growing the dynamic table for.
pub fn encode_stateless<'f, W: BufMut>(block: &mut W, fields: impl IntoIterator<Item = &'f HeaderField>) {
    HeaderPrefix { required_insert_count: 0, base: 0 }.encode(block);
    for field in fields {
        let line = if let Some(index) = static_table::find_with_value(&field.name, &field.value) {
            FieldLine::Indexed { dynamic: false, index: index as u64 }
        } else if let Some(index) = static_table::find_name(&field.name) {
            FieldLine::LiteralWithNameRef {
                dynamic: false,
                never_indexed: false,
                index: index as u64,
                value: field.value.clone(),
            }
        } else {
            FieldLine::LiteralWithLiteralName {
                never_indexed: false,
                name: field.name.clone(),
                value: field.value.clone(),
            }
        };
        line.encode(block);
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::super::decoder::{DecodeOutcome, Decoder};
    use super::*;

    #[test]
    fn static_hit_needs_no_dynamic_table() {
        let mut encoder = Encoder::new();
        let mut block = BytesMut::new();
        let mut encoder_stream = BytesMut::new();
        let fields = vec![HeaderField::new(":method", "GET")];
        let referenced = encoder.encode(&mut block, &mut encoder_stream, fields.iter());
        assert!(referenced.is_empty());
        assert!(encoder_stream.is_empty());
    }

    #[test]
    fn unknown_field_round_trips_through_decoder() {
        use bytes::Buf;

        let mut encoder = Encoder::new();
        encoder.set_capacity(4096, &mut BytesMut::new());
        let mut block = BytesMut::new();
        let mut encoder_stream = BytesMut::new();
        let fields = vec![HeaderField::new("x-custom", "value")];
        encoder.encode(&mut block, &mut encoder_stream, fields.iter());

        let mut decoder = Decoder::new();
        let mut encoder_stream = encoder_stream.freeze();
        while encoder_stream.has_remaining() {
            let instr = super::EncoderInstruction::decode(&mut encoder_stream).unwrap();
            decoder.on_encoder_instruction(instr).unwrap();
        }

        match decoder.decode_field_section(&mut block.freeze()).unwrap() {
            DecodeOutcome::Done(decoded) => assert_eq!(decoded.fields, fields),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn stateless_encode_uses_only_static_and_literal() {
        let mut block = BytesMut::new();
        let fields = vec![HeaderField::new(":method", "GET"), HeaderField::new("x-trailer", "1")];
        encode_stateless(&mut block, fields.iter());
        let mut frozen = block.freeze();
        let prefix = HeaderPrefix::decode(&mut frozen).unwrap();
        assert_eq!(prefix.required_insert_count, 0);
    }
}
