//! Parsing of statement and blob info responses.
//!
//! Statement info is not a flat item list: `isc_info_sql_select`,
//! `isc_info_sql_bind` and `isc_info_sql_describe_end` are bare markers
//! without a length, everything else carries a 2-byte length.

use crate::error::Error;
use fbwire_protocol::clumplet::{vax_integer, InfoItem, InfoReader};
use fbwire_protocol::consts::*;
use fbwire_protocol::{FieldDescriptor, RowDescriptor};
use std::collections::BTreeMap;

/// Items requested when preparing a statement.
pub(crate) const STATEMENT_INFO_ITEMS: &[u8] = &[
    ISC_INFO_SQL_STMT_TYPE,
    ISC_INFO_SQL_SELECT,
    ISC_INFO_SQL_DESCRIBE_VARS,
    ISC_INFO_SQL_SQLDA_SEQ,
    ISC_INFO_SQL_TYPE,
    ISC_INFO_SQL_SUB_TYPE,
    ISC_INFO_SQL_SCALE,
    ISC_INFO_SQL_LENGTH,
    ISC_INFO_SQL_FIELD,
    ISC_INFO_SQL_ALIAS,
    ISC_INFO_SQL_RELATION,
    ISC_INFO_SQL_OWNER,
    ISC_INFO_SQL_DESCRIBE_END,
    ISC_INFO_SQL_BIND,
    ISC_INFO_SQL_DESCRIBE_VARS,
    ISC_INFO_SQL_SQLDA_SEQ,
    ISC_INFO_SQL_TYPE,
    ISC_INFO_SQL_SUB_TYPE,
    ISC_INFO_SQL_SCALE,
    ISC_INFO_SQL_LENGTH,
    ISC_INFO_SQL_DESCRIBE_END,
];

/// Upper bound of `sqld`, a signed 16-bit count on the server.
const MAX_DESCRIBE_VARS: i64 = i16::MAX as i64;

/// What a prepare reports about a statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementInfo {
    pub statement_type: i32,
    /// Output columns.
    pub fields: RowDescriptor,
    /// Input parameters.
    pub parameters: RowDescriptor,
}

fn malformed(detail: impl Into<String>) -> Error {
    Error::protocol(format!("malformed statement info: {}", detail.into()))
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Parses the response to [`STATEMENT_INFO_ITEMS`].
pub fn parse_statement_info(data: &[u8]) -> Result<StatementInfo, Error> {
    let mut info = StatementInfo::default();
    let mut reader = InfoReader::new(data);
    while let Some(item) = reader.next_byte() {
        match item {
            ISC_INFO_END => return Ok(info),
            ISC_INFO_TRUNCATED => {
                return Err(malformed("response truncated, info buffer too small"))
            }
            ISC_INFO_ERROR => return Err(malformed("server reported an info error")),
            ISC_INFO_SQL_STMT_TYPE => info.statement_type = reader.read_int()? as i32,
            ISC_INFO_SQL_SELECT => info.fields = parse_descriptor(&mut reader)?,
            ISC_INFO_SQL_BIND => info.parameters = parse_descriptor(&mut reader)?,
            other => return Err(malformed(format!("unexpected item {}", other))),
        }
    }
    Err(malformed("missing isc_info_end"))
}

fn parse_descriptor(reader: &mut InfoReader<'_>) -> Result<RowDescriptor, Error> {
    if reader.next_byte() != Some(ISC_INFO_SQL_DESCRIBE_VARS) {
        return Err(malformed("expected isc_info_sql_describe_vars"));
    }
    let count = reader.read_int()?;
    if !(0..=MAX_DESCRIBE_VARS).contains(&count) {
        return Err(malformed(format!("variable count {} out of range", count)));
    }
    let count = count as usize;
    let mut fields: Vec<FieldDescriptor> = Vec::new();
    let mut index = 0usize;
    loop {
        match reader.peek_byte() {
            None => return Err(malformed("descriptor not terminated")),
            Some(
                ISC_INFO_END
                | ISC_INFO_TRUNCATED
                | ISC_INFO_SQL_SELECT
                | ISC_INFO_SQL_BIND
                | ISC_INFO_SQL_STMT_TYPE,
            ) => break,
            Some(_) => {}
        }
        let Some(item) = reader.next_byte() else {
            break;
        };
        match item {
            ISC_INFO_SQL_DESCRIBE_END => continue,
            ISC_INFO_SQL_SQLDA_SEQ => {
                let seq = reader.read_int()?;
                if seq < 1 || seq as usize > count {
                    return Err(malformed(format!("variable index {} out of range", seq)));
                }
                index = seq as usize;
                if index > fields.len() {
                    fields.resize(index, FieldDescriptor::default());
                }
                continue;
            }
            _ => {}
        }
        let Some(field) = index.checked_sub(1).and_then(|i| fields.get_mut(i)) else {
            return Err(malformed(format!("item {} before isc_info_sql_sqlda_seq", item)));
        };
        match item {
            ISC_INFO_SQL_TYPE => field.field_type = reader.read_int()? as i32,
            ISC_INFO_SQL_SUB_TYPE => field.sub_type = reader.read_int()? as i32,
            ISC_INFO_SQL_SCALE => field.scale = reader.read_int()? as i32,
            ISC_INFO_SQL_LENGTH => field.length = reader.read_int()? as i32,
            ISC_INFO_SQL_FIELD => field.field_name = text(reader.read_value()?),
            ISC_INFO_SQL_ALIAS => field.alias = text(reader.read_value()?),
            ISC_INFO_SQL_RELATION => field.relation_name = text(reader.read_value()?),
            ISC_INFO_SQL_OWNER => field.owner_name = text(reader.read_value()?),
            ISC_INFO_SQL_NULL_IND | ISC_INFO_SQL_MESSAGE_SEQ => {
                reader.read_value()?;
            }
            other => return Err(malformed(format!("unexpected descriptor item {}", other))),
        }
    }
    fields.resize(count, FieldDescriptor::default());
    Ok(RowDescriptor::new(fields))
}

/// Rows affected by the last execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub inserted: i64,
    pub updated: i64,
    pub deleted: i64,
    pub selected: i64,
}

/// Parses the response to `isc_info_sql_records`.
pub fn parse_row_counts(data: &[u8]) -> Result<RowCounts, Error> {
    let mut counts = RowCounts::default();
    for item in InfoReader::new(data) {
        let InfoItem::Value { item, data } = item? else {
            return Err(malformed("record counts truncated"));
        };
        if item != ISC_INFO_SQL_RECORDS {
            continue;
        }
        for count in InfoReader::new(data) {
            let InfoItem::Value { item, data } = count? else {
                return Err(malformed("record counts truncated"));
            };
            let value = vax_integer(data);
            match item {
                ISC_INFO_REQ_INSERT_COUNT => counts.inserted = value,
                ISC_INFO_REQ_UPDATE_COUNT => counts.updated = value,
                ISC_INFO_REQ_DELETE_COUNT => counts.deleted = value,
                ISC_INFO_REQ_SELECT_COUNT => counts.selected = value,
                _ => {}
            }
        }
    }
    Ok(counts)
}

/// Flat info items keyed by item code, as returned for blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoItems {
    items: BTreeMap<u8, Vec<u8>>,
    truncated: bool,
}

impl InfoItems {
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut parsed = InfoItems::default();
        for item in InfoReader::new(data) {
            match item? {
                InfoItem::Value { item, data } => {
                    parsed.items.insert(item, data.to_vec());
                }
                InfoItem::Truncated => parsed.truncated = true,
            }
        }
        Ok(parsed)
    }

    pub fn get(&self, item: u8) -> Option<&[u8]> {
        self.items.get(&item).map(Vec::as_slice)
    }

    pub fn get_int(&self, item: u8) -> Option<i64> {
        self.get(item).map(vax_integer)
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn contains_all(&self, items: &[u8]) -> bool {
        items.iter().all(|item| self.items.contains_key(item))
    }

    /// Rebuilds a response for `items`, in the requested order.
    pub fn encode(&self, items: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for item in items {
            if let Some(value) = self.items.get(item) {
                out.push(*item);
                out.extend_from_slice(&(value.len() as u16).to_le_bytes());
                out.extend_from_slice(value);
            }
        }
        out.push(ISC_INFO_END);
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn int_item(out: &mut Vec<u8>, item: u8, value: i32) {
        out.push(item);
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn text_item(out: &mut Vec<u8>, item: u8, value: &str) {
        out.push(item);
        out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        out.extend_from_slice(value.as_bytes());
    }

    /// Builds a statement info response with the given output and input
    /// fields as `(type, length, name)`.
    pub(crate) fn statement_info(
        statement_type: i32,
        fields: &[(i32, i32, &str)],
        parameters: &[(i32, i32, &str)],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        int_item(&mut out, ISC_INFO_SQL_STMT_TYPE, statement_type);
        for (marker, vars) in [(ISC_INFO_SQL_SELECT, fields), (ISC_INFO_SQL_BIND, parameters)] {
            out.push(marker);
            int_item(&mut out, ISC_INFO_SQL_DESCRIBE_VARS, vars.len() as i32);
            for (index, (field_type, length, name)) in vars.iter().enumerate() {
                int_item(&mut out, ISC_INFO_SQL_SQLDA_SEQ, index as i32 + 1);
                int_item(&mut out, ISC_INFO_SQL_TYPE, *field_type);
                int_item(&mut out, ISC_INFO_SQL_SUB_TYPE, 0);
                int_item(&mut out, ISC_INFO_SQL_SCALE, 0);
                int_item(&mut out, ISC_INFO_SQL_LENGTH, *length);
                text_item(&mut out, ISC_INFO_SQL_FIELD, name);
                text_item(&mut out, ISC_INFO_SQL_ALIAS, name);
                out.push(ISC_INFO_SQL_DESCRIBE_END);
            }
        }
        out.push(ISC_INFO_END);
        out
    }

    #[test]
    fn test_parse_select_info() {
        let data = statement_info(
            ISC_INFO_SQL_STMT_SELECT,
            &[(SQL_LONG + 1, 4, "ID"), (SQL_VARYING, 20, "NAME")],
            &[(SQL_LONG, 4, "")],
        );
        let info = parse_statement_info(&data).unwrap();
        assert_eq!(info.statement_type, ISC_INFO_SQL_STMT_SELECT);
        assert_eq!(info.fields.len(), 2);
        let id = &info.fields.fields()[0];
        assert_eq!(id.base_type(), SQL_LONG);
        assert!(id.is_nullable());
        assert_eq!(id.field_name, "ID");
        assert_eq!(info.fields.fields()[1].length, 20);
        assert_eq!(info.parameters.len(), 1);
    }

    #[test]
    fn test_parse_info_without_columns() {
        let data = statement_info(4, &[], &[]);
        let info = parse_statement_info(&data).unwrap();
        assert!(info.fields.is_empty());
        assert!(info.parameters.is_empty());
    }

    #[test]
    fn test_truncated_statement_info_is_an_error() {
        let mut data = Vec::new();
        int_item(&mut data, ISC_INFO_SQL_STMT_TYPE, ISC_INFO_SQL_STMT_SELECT);
        data.push(ISC_INFO_SQL_SELECT);
        int_item(&mut data, ISC_INFO_SQL_DESCRIBE_VARS, 1);
        int_item(&mut data, ISC_INFO_SQL_SQLDA_SEQ, 1);
        data.push(ISC_INFO_TRUNCATED);
        assert!(matches!(parse_statement_info(&data), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_oversized_variable_count_is_rejected() {
        let mut data = vec![ISC_INFO_SQL_STMT_TYPE, 4, 0, 1, 0, 0, 0, ISC_INFO_SQL_SELECT];
        data.extend_from_slice(&[ISC_INFO_SQL_DESCRIBE_VARS, 8, 0]);
        data.extend_from_slice(&i64::MAX.to_le_bytes());
        data.push(ISC_INFO_END);
        assert!(matches!(parse_statement_info(&data), Err(Error::Protocol(_))));

        let mut data = Vec::new();
        data.push(ISC_INFO_SQL_SELECT);
        int_item(&mut data, ISC_INFO_SQL_DESCRIBE_VARS, 0x7FFF_FFFF);
        data.push(ISC_INFO_END);
        assert!(matches!(parse_statement_info(&data), Err(Error::Protocol(_))));

        let mut data = Vec::new();
        data.push(ISC_INFO_SQL_SELECT);
        int_item(&mut data, ISC_INFO_SQL_DESCRIBE_VARS, -1);
        data.push(ISC_INFO_END);
        assert!(matches!(parse_statement_info(&data), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_variables_beyond_declared_count_are_rejected() {
        let mut data = Vec::new();
        data.push(ISC_INFO_SQL_SELECT);
        int_item(&mut data, ISC_INFO_SQL_DESCRIBE_VARS, 1);
        int_item(&mut data, ISC_INFO_SQL_SQLDA_SEQ, 2);
        data.push(ISC_INFO_END);
        assert!(matches!(parse_statement_info(&data), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_parse_row_counts() {
        let mut records = Vec::new();
        int_item(&mut records, ISC_INFO_REQ_SELECT_COUNT, 0);
        int_item(&mut records, ISC_INFO_REQ_INSERT_COUNT, 3);
        int_item(&mut records, ISC_INFO_REQ_UPDATE_COUNT, 2);
        int_item(&mut records, ISC_INFO_REQ_DELETE_COUNT, 1);
        records.push(ISC_INFO_END);

        let mut data = vec![ISC_INFO_SQL_RECORDS];
        data.extend_from_slice(&(records.len() as u16).to_le_bytes());
        data.extend(records);
        data.push(ISC_INFO_END);

        let counts = parse_row_counts(&data).unwrap();
        assert_eq!(
            counts,
            RowCounts {
                inserted: 3,
                updated: 2,
                deleted: 1,
                selected: 0
            }
        );
    }

    #[test]
    fn test_info_items_cache() {
        let mut data = Vec::new();
        int_item(&mut data, ISC_INFO_BLOB_TOTAL_LENGTH, 1000);
        int_item(&mut data, ISC_INFO_BLOB_NUM_SEGMENTS, 3);
        data.push(ISC_INFO_END);

        let items = InfoItems::parse(&data).unwrap();
        assert_eq!(items.get_int(ISC_INFO_BLOB_TOTAL_LENGTH), Some(1000));
        assert!(items.contains_all(&[ISC_INFO_BLOB_NUM_SEGMENTS]));
        assert!(!items.contains_all(&[ISC_INFO_BLOB_TYPE]));

        let subset = items.encode(&[ISC_INFO_BLOB_NUM_SEGMENTS]);
        assert_eq!(subset, vec![ISC_INFO_BLOB_NUM_SEGMENTS, 4, 0, 3, 0, 0, 0, ISC_INFO_END]);
    }
}
