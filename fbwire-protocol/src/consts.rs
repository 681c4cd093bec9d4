//! Operation codes, protocol versions and parameter buffer tags.
//!
//! Values are fixed by the server implementation and must never change.

// Operations

pub const OP_CONNECT: i32 = 1;
pub const OP_ACCEPT: i32 = 3;
pub const OP_REJECT: i32 = 4;
pub const OP_DISCONNECT: i32 = 6;
pub const OP_RESPONSE: i32 = 9;
pub const OP_ATTACH: i32 = 19;
pub const OP_CREATE: i32 = 20;
pub const OP_DETACH: i32 = 21;
pub const OP_TRANSACTION: i32 = 29;
pub const OP_COMMIT: i32 = 30;
pub const OP_ROLLBACK: i32 = 31;
pub const OP_PREPARE: i32 = 32;
pub const OP_RECONNECT: i32 = 33;
pub const OP_CREATE_BLOB: i32 = 34;
pub const OP_OPEN_BLOB: i32 = 35;
pub const OP_GET_SEGMENT: i32 = 36;
pub const OP_PUT_SEGMENT: i32 = 37;
pub const OP_CANCEL_BLOB: i32 = 38;
pub const OP_CLOSE_BLOB: i32 = 39;
pub const OP_INFO_DATABASE: i32 = 40;
pub const OP_INFO_TRANSACTION: i32 = 42;
pub const OP_INFO_BLOB: i32 = 43;
pub const OP_COMMIT_RETAINING: i32 = 50;
pub const OP_PREPARE2: i32 = 51;
pub const OP_OPEN_BLOB2: i32 = 56;
pub const OP_CREATE_BLOB2: i32 = 57;
pub const OP_SEEK_BLOB: i32 = 61;
pub const OP_ALLOCATE_STATEMENT: i32 = 62;
pub const OP_EXECUTE: i32 = 63;
pub const OP_EXEC_IMMEDIATE: i32 = 64;
pub const OP_FETCH: i32 = 65;
pub const OP_FETCH_RESPONSE: i32 = 66;
pub const OP_FREE_STATEMENT: i32 = 67;
pub const OP_PREPARE_STATEMENT: i32 = 68;
pub const OP_INFO_SQL: i32 = 70;
pub const OP_DUMMY: i32 = 71;
pub const OP_EXECUTE2: i32 = 76;
pub const OP_SQL_RESPONSE: i32 = 78;
pub const OP_DROP_DATABASE: i32 = 81;
pub const OP_ROLLBACK_RETAINING: i32 = 86;
pub const OP_TRUSTED_AUTH: i32 = 90;
pub const OP_CANCEL: i32 = 91;
pub const OP_CONT_AUTH: i32 = 92;
pub const OP_PING: i32 = 93;
pub const OP_ACCEPT_DATA: i32 = 94;
pub const OP_CRYPT: i32 = 96;
pub const OP_CRYPT_KEY_CALLBACK: i32 = 97;
pub const OP_COND_ACCEPT: i32 = 98;

/// Returns a printable name for an operation code.
pub fn operation_name(op: i32) -> &'static str {
    match op {
        OP_CONNECT => "op_connect",
        OP_ACCEPT => "op_accept",
        OP_REJECT => "op_reject",
        OP_DISCONNECT => "op_disconnect",
        OP_RESPONSE => "op_response",
        OP_FETCH_RESPONSE => "op_fetch_response",
        OP_SQL_RESPONSE => "op_sql_response",
        OP_TRUSTED_AUTH => "op_trusted_auth",
        OP_CONT_AUTH => "op_cont_auth",
        OP_ACCEPT_DATA => "op_accept_data",
        OP_CRYPT => "op_crypt",
        OP_CRYPT_KEY_CALLBACK => "op_crypt_key_callback",
        OP_COND_ACCEPT => "op_cond_accept",
        OP_DUMMY => "op_dummy",
        _ => "unknown operation",
    }
}

// Connection handshake

pub const CONNECT_VERSION3: i32 = 3;
pub const ARCH_GENERIC: i32 = 1;

pub const PTYPE_RPC: i32 = 2;
pub const PTYPE_BATCH_SEND: i32 = 3;
pub const PTYPE_OUT_OF_BAND: i32 = 4;
pub const PTYPE_LAZY_SEND: i32 = 5;
pub const PTYPE_MASK: i32 = 0xFF;
pub const PFLAG_COMPRESS: i32 = 0x100;

pub const FB_PROTOCOL_FLAG: i32 = 0x8000;
pub const FB_PROTOCOL_MASK: i32 = 0x7FFF;

pub const PROTOCOL_VERSION10: i32 = 10;
pub const PROTOCOL_VERSION11: i32 = FB_PROTOCOL_FLAG | 11;
pub const PROTOCOL_VERSION12: i32 = FB_PROTOCOL_FLAG | 12;
pub const PROTOCOL_VERSION13: i32 = FB_PROTOCOL_FLAG | 13;
pub const PROTOCOL_VERSION15: i32 = FB_PROTOCOL_FLAG | 15;
pub const PROTOCOL_VERSION16: i32 = FB_PROTOCOL_FLAG | 16;

/// Converts a plain version number (10, 11, ...) into its wire value.
pub fn wire_protocol_version(version: u32) -> i32 {
    if version <= 10 {
        version as i32
    } else {
        FB_PROTOCOL_FLAG | version as i32
    }
}

/// Converts a wire version value back into a plain version number.
///
/// Servers may send the flagged value sign-extended, so negative values are
/// folded back into the flagged range first.
pub fn plain_protocol_version(wire: i32) -> u32 {
    let wire = if wire < 0 {
        (wire & FB_PROTOCOL_MASK) | FB_PROTOCOL_FLAG
    } else {
        wire
    };
    (wire & FB_PROTOCOL_MASK) as u32
}

// User identification block (op_connect)

pub const CNCT_USER: u8 = 1;
pub const CNCT_PASSWD: u8 = 2;
pub const CNCT_HOST: u8 = 4;
pub const CNCT_GROUP: u8 = 5;
pub const CNCT_USER_VERIFICATION: u8 = 6;
pub const CNCT_SPECIFIC_DATA: u8 = 7;
pub const CNCT_PLUGIN_NAME: u8 = 8;
pub const CNCT_LOGIN: u8 = 9;
pub const CNCT_PLUGIN_LIST: u8 = 10;
pub const CNCT_CLIENT_CRYPT: u8 = 11;

pub const WIRE_CRYPT_DISABLED: i32 = 0;
pub const WIRE_CRYPT_ENABLED: i32 = 1;
pub const WIRE_CRYPT_REQUIRED: i32 = 2;

// Server key clumplets (accept and response data)

pub const TAG_KEY_TYPE: u8 = 0;
pub const TAG_KEY_PLUGINS: u8 = 1;
pub const TAG_KNOWN_PLUGINS: u8 = 2;
pub const TAG_PLUGIN_SPECIFIC: u8 = 3;

// Cancel kinds

pub const FB_CANCEL_DISABLE: i32 = 1;
pub const FB_CANCEL_ENABLE: i32 = 2;
pub const FB_CANCEL_RAISE: i32 = 3;
pub const FB_CANCEL_ABORT: i32 = 4;

// Status vector arguments

pub const ISC_ARG_END: i32 = 0;
pub const ISC_ARG_GDS: i32 = 1;
pub const ISC_ARG_STRING: i32 = 2;
pub const ISC_ARG_CSTRING: i32 = 3;
pub const ISC_ARG_NUMBER: i32 = 4;
pub const ISC_ARG_INTERPRETED: i32 = 5;
pub const ISC_ARG_WARNING: i32 = 18;
pub const ISC_ARG_SQL_STATE: i32 = 19;

// Well-known error codes

pub const ISC_LOGIN: i32 = 335544472;
pub const ISC_NETWORK_ERROR: i32 = 335544721;
pub const ISC_SEGMENT: i32 = 335544366;
pub const ISC_SEGSTR_EOF: i32 = 335544367;
pub const ISC_WIRECRYPT_INCOMPATIBLE: i32 = 335545064;

// Parameter buffer versions and tags

pub const ISC_DPB_VERSION1: u8 = 1;
pub const ISC_DPB_PAGE_SIZE: u8 = 4;
pub const ISC_DPB_USER_NAME: u8 = 28;
pub const ISC_DPB_PASSWORD: u8 = 29;
pub const ISC_DPB_LC_CTYPE: u8 = 48;
pub const ISC_DPB_CONNECT_TIMEOUT: u8 = 57;
pub const ISC_DPB_SQL_ROLE_NAME: u8 = 60;
pub const ISC_DPB_SQL_DIALECT: u8 = 63;
pub const ISC_DPB_PROCESS_ID: u8 = 71;
pub const ISC_DPB_PROCESS_NAME: u8 = 74;
pub const ISC_DPB_UTF8_FILENAME: u8 = 77;
pub const ISC_DPB_CLIENT_VERSION: u8 = 80;
pub const ISC_DPB_SPECIFIC_AUTH_DATA: u8 = 84;
pub const ISC_DPB_AUTH_PLUGIN_LIST: u8 = 85;
pub const ISC_DPB_AUTH_PLUGIN_NAME: u8 = 86;

pub const ISC_TPB_VERSION3: u8 = 3;
pub const ISC_TPB_CONCURRENCY: u8 = 2;
pub const ISC_TPB_WAIT: u8 = 6;
pub const ISC_TPB_WRITE: u8 = 9;
pub const ISC_TPB_READ_COMMITTED: u8 = 15;
pub const ISC_TPB_REC_VERSION: u8 = 17;

pub const ISC_BPB_VERSION1: u8 = 1;
pub const ISC_BPB_SOURCE_TYPE: u8 = 1;
pub const ISC_BPB_TARGET_TYPE: u8 = 2;
pub const ISC_BPB_TYPE: u8 = 3;
pub const ISC_BPB_TYPE_SEGMENTED: u8 = 0;
pub const ISC_BPB_TYPE_STREAM: u8 = 1;

// Statements

pub const DSQL_CLOSE: i32 = 1;
pub const DSQL_DROP: i32 = 2;

/// Handle placeholder referring to the object created by the previous
/// pipelined request.
pub const INVALID_OBJECT: i32 = 0xFFFF;

pub const FETCH_OK: i32 = 0;
pub const FETCH_NO_MORE_ROWS: i32 = 100;

// Info items

pub const ISC_INFO_END: u8 = 1;
pub const ISC_INFO_TRUNCATED: u8 = 2;
pub const ISC_INFO_ERROR: u8 = 3;

pub const ISC_INFO_SQL_SELECT: u8 = 4;
pub const ISC_INFO_SQL_BIND: u8 = 5;
pub const ISC_INFO_SQL_NUM_VARIABLES: u8 = 6;
pub const ISC_INFO_SQL_DESCRIBE_VARS: u8 = 7;
pub const ISC_INFO_SQL_DESCRIBE_END: u8 = 8;
pub const ISC_INFO_SQL_SQLDA_SEQ: u8 = 9;
pub const ISC_INFO_SQL_MESSAGE_SEQ: u8 = 10;
pub const ISC_INFO_SQL_TYPE: u8 = 11;
pub const ISC_INFO_SQL_SUB_TYPE: u8 = 12;
pub const ISC_INFO_SQL_SCALE: u8 = 13;
pub const ISC_INFO_SQL_LENGTH: u8 = 14;
pub const ISC_INFO_SQL_NULL_IND: u8 = 15;
pub const ISC_INFO_SQL_FIELD: u8 = 16;
pub const ISC_INFO_SQL_RELATION: u8 = 17;
pub const ISC_INFO_SQL_OWNER: u8 = 18;
pub const ISC_INFO_SQL_ALIAS: u8 = 19;
pub const ISC_INFO_SQL_STMT_TYPE: u8 = 21;
pub const ISC_INFO_SQL_RECORDS: u8 = 23;

pub const ISC_INFO_REQ_INSERT_COUNT: u8 = 13;
pub const ISC_INFO_REQ_UPDATE_COUNT: u8 = 14;
pub const ISC_INFO_REQ_DELETE_COUNT: u8 = 15;
pub const ISC_INFO_REQ_SELECT_COUNT: u8 = 16;

pub const ISC_INFO_SQL_STMT_SELECT: i32 = 1;
pub const ISC_INFO_SQL_STMT_EXEC_PROCEDURE: i32 = 8;
pub const ISC_INFO_SQL_STMT_SELECT_FOR_UPD: i32 = 12;

pub const ISC_INFO_BLOB_NUM_SEGMENTS: u8 = 4;
pub const ISC_INFO_BLOB_MAX_SEGMENT: u8 = 5;
pub const ISC_INFO_BLOB_TOTAL_LENGTH: u8 = 6;
pub const ISC_INFO_BLOB_TYPE: u8 = 7;

pub const ISC_INFO_DB_ID: u8 = 4;
pub const ISC_INFO_ODS_VERSION: u8 = 32;
pub const ISC_INFO_ODS_MINOR_VERSION: u8 = 33;
pub const ISC_INFO_FIREBIRD_VERSION: u8 = 103;

pub const ISC_INFO_TRA_ID: u8 = 4;

// SQL data types

pub const SQL_VARYING: i32 = 448;
pub const SQL_TEXT: i32 = 452;
pub const SQL_DOUBLE: i32 = 480;
pub const SQL_FLOAT: i32 = 482;
pub const SQL_LONG: i32 = 496;
pub const SQL_SHORT: i32 = 500;
pub const SQL_TIMESTAMP: i32 = 510;
pub const SQL_BLOB: i32 = 520;
pub const SQL_D_FLOAT: i32 = 530;
pub const SQL_ARRAY: i32 = 540;
pub const SQL_QUAD: i32 = 550;
pub const SQL_TYPE_TIME: i32 = 560;
pub const SQL_TYPE_DATE: i32 = 570;
pub const SQL_INT64: i32 = 580;
pub const SQL_INT128: i32 = 32752;
pub const SQL_TIMESTAMP_TZ: i32 = 32754;
pub const SQL_TIME_TZ: i32 = 32756;
pub const SQL_DEC16: i32 = 32760;
pub const SQL_DEC34: i32 = 32762;
pub const SQL_BOOLEAN: i32 = 32764;
pub const SQL_NULL: i32 = 32766;

// BLR

pub const BLR_VERSION5: u8 = 5;
pub const BLR_BEGIN: u8 = 2;
pub const BLR_MESSAGE: u8 = 4;
pub const BLR_SHORT: u8 = 7;
pub const BLR_LONG: u8 = 8;
pub const BLR_QUAD: u8 = 9;
pub const BLR_FLOAT: u8 = 10;
pub const BLR_D_FLOAT: u8 = 11;
pub const BLR_SQL_DATE: u8 = 12;
pub const BLR_SQL_TIME: u8 = 13;
pub const BLR_TEXT: u8 = 14;
pub const BLR_TEXT2: u8 = 15;
pub const BLR_INT64: u8 = 16;
pub const BLR_BOOL: u8 = 23;
pub const BLR_DEC64: u8 = 24;
pub const BLR_DEC128: u8 = 25;
pub const BLR_INT128: u8 = 26;
pub const BLR_DOUBLE: u8 = 27;
pub const BLR_SQL_TIME_TZ: u8 = 28;
pub const BLR_TIMESTAMP_TZ: u8 = 29;
pub const BLR_TIMESTAMP: u8 = 35;
pub const BLR_VARYING2: u8 = 38;
pub const BLR_END: u8 = 255;
pub const BLR_EOC: u8 = 76;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_protocol_version() {
        assert_eq!(wire_protocol_version(10), PROTOCOL_VERSION10);
        assert_eq!(wire_protocol_version(13), PROTOCOL_VERSION13);
        assert_eq!(wire_protocol_version(16), 0x8010);
    }

    #[test]
    fn test_plain_protocol_version() {
        assert_eq!(plain_protocol_version(PROTOCOL_VERSION10), 10);
        assert_eq!(plain_protocol_version(PROTOCOL_VERSION12), 12);
        // Sign-extended flag as sent by some servers
        assert_eq!(plain_protocol_version(0xFFFF_800Du32 as i32), 13);
    }

    #[test]
    fn test_operation_name() {
        assert_eq!(operation_name(OP_COND_ACCEPT), "op_cond_accept");
        assert_eq!(operation_name(12345), "unknown operation");
    }
}
