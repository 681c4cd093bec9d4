//! BLR message descriptions.
//!
//! Execute and fetch requests describe the layout of their input or output
//! message in BLR:
//!
//! ```text
//! blr_version5 blr_begin blr_message 0 <count * 2 as u16 LE>
//!   <field type description> blr_short 0   (per field: value + null flag)
//! blr_end blr_eoc
//! ```

use crate::consts::*;
use crate::error::ProtocolError;
use crate::row::RowDescriptor;

/// Builds the BLR description of a message, or `None` for an empty one.
pub fn message_blr(descriptor: &RowDescriptor) -> Result<Option<Vec<u8>>, ProtocolError> {
    if descriptor.is_empty() {
        return Ok(None);
    }
    let parameter_count = descriptor.len() * 2;
    if parameter_count > u16::MAX as usize {
        return Err(ProtocolError::malformed(
            "message",
            format!("too many fields: {}", descriptor.len()),
        ));
    }

    let mut blr = Vec::with_capacity(8 + descriptor.len() * 8);
    blr.extend_from_slice(&[BLR_VERSION5, BLR_BEGIN, BLR_MESSAGE, 0]);
    blr.extend_from_slice(&(parameter_count as u16).to_le_bytes());

    for field in descriptor.fields() {
        let length = field.length as u16;
        let sub_type = field.sub_type as u16;
        let scale = field.scale as i8 as u8;
        match field.base_type() {
            SQL_VARYING => {
                blr.push(BLR_VARYING2);
                blr.extend_from_slice(&sub_type.to_le_bytes());
                blr.extend_from_slice(&length.to_le_bytes());
            }
            SQL_TEXT => {
                blr.push(BLR_TEXT2);
                blr.extend_from_slice(&sub_type.to_le_bytes());
                blr.extend_from_slice(&length.to_le_bytes());
            }
            SQL_NULL => {
                blr.push(BLR_TEXT);
                blr.extend_from_slice(&0u16.to_le_bytes());
            }
            SQL_DOUBLE => blr.push(BLR_DOUBLE),
            SQL_FLOAT => blr.push(BLR_FLOAT),
            SQL_D_FLOAT => blr.push(BLR_D_FLOAT),
            SQL_TYPE_DATE => blr.push(BLR_SQL_DATE),
            SQL_TYPE_TIME => blr.push(BLR_SQL_TIME),
            SQL_TIMESTAMP => blr.push(BLR_TIMESTAMP),
            SQL_TIME_TZ => blr.push(BLR_SQL_TIME_TZ),
            SQL_TIMESTAMP_TZ => blr.push(BLR_TIMESTAMP_TZ),
            SQL_BLOB | SQL_ARRAY => blr.extend_from_slice(&[BLR_QUAD, 0]),
            SQL_QUAD => blr.extend_from_slice(&[BLR_QUAD, scale]),
            SQL_LONG => blr.extend_from_slice(&[BLR_LONG, scale]),
            SQL_SHORT => blr.extend_from_slice(&[BLR_SHORT, scale]),
            SQL_INT64 => blr.extend_from_slice(&[BLR_INT64, scale]),
            SQL_INT128 => blr.extend_from_slice(&[BLR_INT128, scale]),
            SQL_DEC16 => blr.push(BLR_DEC64),
            SQL_DEC34 => blr.push(BLR_DEC128),
            SQL_BOOLEAN => blr.push(BLR_BOOL),
            other => {
                return Err(ProtocolError::malformed(
                    "message",
                    format!("no BLR for SQL type {}", other),
                ))
            }
        }
        blr.extend_from_slice(&[BLR_SHORT, 0]);
    }

    blr.extend_from_slice(&[BLR_END, BLR_EOC]);
    Ok(Some(blr))
}
