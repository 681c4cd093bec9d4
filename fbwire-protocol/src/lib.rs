//! # fbwire-protocol
//!
//! Building blocks of the Firebird wire protocol, independent of any socket.
//!
//! This crate provides:
//! - XDR framing (big-endian integers, 4-byte aligned buffers and strings)
//! - Operation codes, protocol versions and parameter buffer tags
//! - Clumplet parsing and parameter buffer construction (DPB, TPB, BPB)
//! - Decoding of generic, fetch and SQL responses including status vectors
//! - BLR message descriptions and row value encoding for every row format

pub mod blr;
pub mod clumplet;
pub mod consts;
pub mod error;
pub mod response;
pub mod row;
pub mod xdr;

pub use clumplet::{ClumpletReader, ParameterBuffer};
pub use error::ProtocolError;
pub use response::{
    FetchResponse, GenericResponse, Response, SqlResponse, StatusArgument, StatusVector,
};
pub use row::{FieldDescriptor, RowCodec, RowDescriptor, RowValue};
pub use xdr::{Encoding, WireCipher, XdrReader, XdrWriter};

/// Default port of a Firebird server.
pub const DEFAULT_PORT: u16 = 3050;

/// Largest buffer accepted from the wire (256 MiB).
pub const MAX_BUFFER_SIZE: usize = 256 * 1024 * 1024;
