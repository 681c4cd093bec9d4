//! Row descriptors and row value encoding.
//!
//! Two row formats exist:
//!
//! ```text
//! null indicators (protocol 10-12):
//!   for each field: value | int32 indicator (-1 = null)
//!
//! null bitmap (protocol 13+):
//!   bitmap, one bit per field (LSB first, set = null), padded to 4 bytes
//!   for each non-null field: value
//! ```
//!
//! Value layout depends on the field's [`IoLength`].

use crate::consts::*;
use crate::error::ProtocolError;
use crate::xdr::{padding_for, XdrReader, XdrWriter};
use bytes::Bytes;
use std::io::{Read, Write};

/// A row as a list of raw field values, `None` for SQL NULL.
pub type RowValue = Vec<Option<Bytes>>;

/// How a field value is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoLength {
    /// Length-prefixed, padded buffer (VARCHAR).
    Variable,
    /// Exactly this many bytes, already aligned.
    Fixed(usize),
    /// This many bytes (blank filled) followed by alignment padding.
    Padded(usize),
}

/// Metadata of one field or parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// SQL type; the low bit marks a nullable field.
    pub field_type: i32,
    pub sub_type: i32,
    pub scale: i32,
    pub length: i32,
    pub field_name: String,
    pub relation_name: String,
    pub owner_name: String,
    pub alias: String,
}

impl FieldDescriptor {
    pub fn new(field_type: i32, length: i32) -> Self {
        Self {
            field_type,
            length,
            ..Default::default()
        }
    }

    pub fn with_sub_type(mut self, sub_type: i32) -> Self {
        self.sub_type = sub_type;
        self
    }

    pub fn with_scale(mut self, scale: i32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.field_name = name.into();
        self
    }

    /// SQL type without the nullable bit.
    pub fn base_type(&self) -> i32 {
        self.field_type & !1
    }

    pub fn is_nullable(&self) -> bool {
        self.field_type & 1 == 1
    }

    pub fn io_length(&self) -> Result<IoLength, ProtocolError> {
        let io_length = match self.base_type() {
            SQL_TEXT | SQL_NULL => IoLength::Padded(self.length.max(0) as usize),
            SQL_VARYING => IoLength::Variable,
            SQL_SHORT | SQL_LONG | SQL_FLOAT | SQL_TYPE_TIME | SQL_TYPE_DATE => IoLength::Fixed(4),
            SQL_DOUBLE | SQL_D_FLOAT | SQL_TIMESTAMP | SQL_BLOB | SQL_ARRAY | SQL_QUAD
            | SQL_INT64 | SQL_DEC16 | SQL_TIME_TZ => IoLength::Fixed(8),
            SQL_TIMESTAMP_TZ => IoLength::Fixed(12),
            SQL_DEC34 | SQL_INT128 => IoLength::Fixed(16),
            SQL_BOOLEAN => IoLength::Padded(1),
            other => {
                return Err(ProtocolError::malformed(
                    "field descriptor",
                    format!("unsupported SQL type {}", other),
                ))
            }
        };
        Ok(io_length)
    }
}

/// Ordered field metadata of a statement's input or output message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowDescriptor {
    fields: Vec<FieldDescriptor>,
}

impl RowDescriptor {
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Row encoding strategy selected by the negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCodec {
    NullIndicators,
    NullBitmap,
}

impl RowCodec {
    pub fn write_row<W: Write>(
        &self,
        out: &mut XdrWriter<W>,
        descriptor: &RowDescriptor,
        row: &[Option<Bytes>],
    ) -> Result<(), ProtocolError> {
        if row.len() != descriptor.len() {
            return Err(ProtocolError::malformed(
                "row",
                format!("{} values for {} fields", row.len(), descriptor.len()),
            ));
        }
        match self {
            RowCodec::NullIndicators => {
                for (field, value) in descriptor.fields().iter().zip(row) {
                    match value {
                        Some(value) => {
                            write_value(out, field, value)?;
                            out.write_i32(0);
                        }
                        None => {
                            write_null_value(out, field)?;
                            out.write_i32(-1);
                        }
                    }
                }
            }
            RowCodec::NullBitmap => {
                let mut bitmap = vec![0u8; (row.len() + 7) / 8];
                for (index, value) in row.iter().enumerate() {
                    if value.is_none() {
                        bitmap[index / 8] |= 1 << (index % 8);
                    }
                }
                out.write_raw(&bitmap);
                out.write_padding(padding_for(bitmap.len()), 0);
                for (field, value) in descriptor.fields().iter().zip(row) {
                    if let Some(value) = value {
                        write_value(out, field, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn read_row<R: Read>(
        &self,
        input: &mut XdrReader<R>,
        descriptor: &RowDescriptor,
    ) -> Result<RowValue, ProtocolError> {
        let mut row = Vec::with_capacity(descriptor.len());
        match self {
            RowCodec::NullIndicators => {
                for field in descriptor.fields() {
                    let value = read_value(input, field)?;
                    let indicator = input.read_i32()?;
                    row.push(if indicator == -1 { None } else { Some(value) });
                }
            }
            RowCodec::NullBitmap => {
                let len = (descriptor.len() + 7) / 8;
                let bitmap = input.read_raw(len)?;
                input.skip_padding(len)?;
                for (index, field) in descriptor.fields().iter().enumerate() {
                    if bitmap[index / 8] & (1 << (index % 8)) != 0 {
                        row.push(None);
                    } else {
                        row.push(Some(read_value(input, field)?));
                    }
                }
            }
        }
        Ok(row)
    }
}

fn write_value<W: Write>(
    out: &mut XdrWriter<W>,
    field: &FieldDescriptor,
    value: &[u8],
) -> Result<(), ProtocolError> {
    match field.io_length()? {
        IoLength::Variable => out.write_buffer(value),
        IoLength::Fixed(len) => {
            if value.len() != len {
                return Err(ProtocolError::malformed(
                    "row",
                    format!("field '{}' needs {} bytes, got {}", field.field_name, len, value.len()),
                ));
            }
            out.write_raw(value);
        }
        IoLength::Padded(len) => {
            if value.len() > len {
                return Err(ProtocolError::malformed(
                    "row",
                    format!("field '{}' holds at most {} bytes, got {}", field.field_name, len, value.len()),
                ));
            }
            out.write_raw(value);
            out.write_padding(len - value.len(), b' ');
            out.write_padding(padding_for(len), 0);
        }
    }
    Ok(())
}

fn write_null_value<W: Write>(out: &mut XdrWriter<W>, field: &FieldDescriptor) -> Result<(), ProtocolError> {
    match field.io_length()? {
        IoLength::Variable => out.write_i32(0),
        IoLength::Fixed(len) => out.write_padding(len, 0),
        IoLength::Padded(len) => {
            out.write_padding(len, b' ');
            out.write_padding(padding_for(len), 0);
        }
    }
    Ok(())
}

fn read_value<R: Read>(input: &mut XdrReader<R>, field: &FieldDescriptor) -> Result<Bytes, ProtocolError> {
    match field.io_length()? {
        IoLength::Variable => input.read_buffer(),
        IoLength::Fixed(len) => input.read_raw(len),
        IoLength::Padded(len) => {
            let value = input.read_raw(len)?;
            input.skip_padding(len)?;
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn descriptor() -> RowDescriptor {
        RowDescriptor::new(vec![
            FieldDescriptor::new(SQL_LONG | 1, 4).with_name("ID"),
            FieldDescriptor::new(SQL_VARYING | 1, 20).with_name("NAME"),
            FieldDescriptor::new(SQL_TEXT | 1, 3).with_name("CODE"),
            FieldDescriptor::new(SQL_BOOLEAN | 1, 1).with_name("FLAG"),
        ])
    }

    fn encode(codec: RowCodec, row: &[Option<Bytes>]) -> Vec<u8> {
        let mut writer = XdrWriter::new(Vec::new());
        codec.write_row(&mut writer, &descriptor(), row).unwrap();
        writer.flush().unwrap();
        writer.get_ref().clone()
    }

    #[test]
    fn test_null_bitmap_layout() {
        let row = vec![
            Some(Bytes::from_static(&[0, 0, 0, 7])),
            None,
            None,
            Some(Bytes::from_static(&[1])),
        ];
        let bytes = encode(RowCodec::NullBitmap, &row);
        // bitmap 0b0110 padded to 4 bytes, then ID (4) and FLAG (1 + 3 pad)
        assert_eq!(bytes, vec![0x06, 0, 0, 0, 0, 0, 0, 7, 1, 0, 0, 0]);
    }

    #[test]
    fn test_null_indicator_layout() {
        let row = vec![Some(Bytes::from_static(&[0, 0, 0, 7])), None, None, None];
        let bytes = encode(RowCodec::NullIndicators, &row);
        let expected: Vec<u8> = [
            // ID, indicator 0
            &[0u8, 0, 0, 7, 0, 0, 0, 0][..],
            // NAME: empty buffer, null
            &[0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF][..],
            // CODE: blanks, null
            &[b' ', b' ', b' ', 0, 0xFF, 0xFF, 0xFF, 0xFF][..],
            // FLAG: blank, null
            &[b' ', 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF][..],
        ]
        .concat();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_text_is_blank_filled() {
        let row = vec![
            Some(Bytes::from_static(&[0, 0, 0, 1])),
            Some(Bytes::from_static(b"ab")),
            Some(Bytes::from_static(b"x")),
            None,
        ];
        let bytes = encode(RowCodec::NullBitmap, &row);
        let mut reader = XdrReader::new(Cursor::new(bytes));
        let decoded = RowCodec::NullBitmap.read_row(&mut reader, &descriptor()).unwrap();
        assert_eq!(decoded[2].as_deref(), Some(&b"x  "[..]));
    }

    #[test]
    fn test_value_count_mismatch() {
        let mut writer = XdrWriter::new(Vec::new());
        let result = RowCodec::NullBitmap.write_row(&mut writer, &descriptor(), &[None]);
        assert!(result.is_err());
    }

    #[test]
    fn test_fixed_length_mismatch() {
        let mut writer = XdrWriter::new(Vec::new());
        let row = vec![Some(Bytes::from_static(&[1, 2])), None, None, None];
        assert!(RowCodec::NullIndicators
            .write_row(&mut writer, &descriptor(), &row)
            .is_err());
    }

    fn arb_row() -> impl Strategy<Value = Vec<Option<Bytes>>> {
        (
            proptest::option::of(any::<[u8; 4]>()),
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..20)),
            proptest::option::of(any::<[u8; 3]>()),
            proptest::option::of(any::<bool>()),
        )
            .prop_map(|(id, name, code, flag)| {
                vec![
                    id.map(|v| Bytes::copy_from_slice(&v)),
                    name.map(Bytes::from),
                    code.map(|v| Bytes::copy_from_slice(&v)),
                    flag.map(|b| Bytes::copy_from_slice(&[b as u8])),
                ]
            })
    }

    proptest! {
        #[test]
        fn prop_rows_survive_both_codecs(row in arb_row()) {
            for codec in [RowCodec::NullIndicators, RowCodec::NullBitmap] {
                let bytes = encode(codec, &row);
                prop_assert_eq!(bytes.len() % 4, 0);
                let mut reader = XdrReader::new(Cursor::new(bytes));
                let decoded = codec.read_row(&mut reader, &descriptor()).unwrap();
                prop_assert_eq!(&decoded, &row);
            }
        }
    }
}
