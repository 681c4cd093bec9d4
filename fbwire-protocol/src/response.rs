//! Server responses and status vectors.
//!
//! ```text
//! op_response       : object handle | blob id (8) | data buffer | status vector
//! op_fetch_response : status | count
//! op_sql_response   : count
//! ```
//!
//! A status vector is a sequence of `(argument type, value)` pairs ending
//! with `isc_arg_end`.

use crate::consts::*;
use crate::error::ProtocolError;
use crate::xdr::XdrReader;
use bytes::Bytes;
use std::io::Read;

/// One argument of a status vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusArgument {
    Gds(i32),
    Warning(i32),
    String(String),
    Interpreted(String),
    Number(i32),
    SqlState(String),
}

/// An error or warning assembled from a status vector segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub code: i32,
    pub warning: bool,
    pub parameters: Vec<String>,
    pub sql_state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusVector {
    pub arguments: Vec<StatusArgument>,
}

impl StatusVector {
    pub fn read<R: Read>(reader: &mut XdrReader<R>) -> Result<Self, ProtocolError> {
        let mut arguments = Vec::new();
        loop {
            let arg = reader.read_i32()?;
            match arg {
                ISC_ARG_END => break,
                ISC_ARG_GDS => {
                    let code = reader.read_i32()?;
                    if code != 0 {
                        arguments.push(StatusArgument::Gds(code));
                    }
                }
                ISC_ARG_WARNING => {
                    let code = reader.read_i32()?;
                    if code != 0 {
                        arguments.push(StatusArgument::Warning(code));
                    }
                }
                ISC_ARG_STRING | ISC_ARG_CSTRING => {
                    arguments.push(StatusArgument::String(reader.read_string()?))
                }
                ISC_ARG_INTERPRETED => {
                    arguments.push(StatusArgument::Interpreted(reader.read_string()?))
                }
                ISC_ARG_SQL_STATE => arguments.push(StatusArgument::SqlState(reader.read_string()?)),
                ISC_ARG_NUMBER => arguments.push(StatusArgument::Number(reader.read_i32()?)),
                other => {
                    return Err(ProtocolError::malformed(
                        "status vector",
                        format!("unknown argument type {}", other),
                    ))
                }
            }
        }
        Ok(Self { arguments })
    }

    /// Splits the vector into entries, one per error or warning code.
    pub fn entries(&self) -> Vec<StatusEntry> {
        let mut entries: Vec<StatusEntry> = Vec::new();
        for argument in &self.arguments {
            match argument {
                StatusArgument::Gds(code) => entries.push(StatusEntry {
                    code: *code,
                    warning: false,
                    parameters: Vec::new(),
                    sql_state: None,
                }),
                StatusArgument::Warning(code) => entries.push(StatusEntry {
                    code: *code,
                    warning: true,
                    parameters: Vec::new(),
                    sql_state: None,
                }),
                StatusArgument::String(s) | StatusArgument::Interpreted(s) => {
                    if let Some(entry) = entries.last_mut() {
                        entry.parameters.push(s.clone());
                    }
                }
                StatusArgument::Number(n) => {
                    if let Some(entry) = entries.last_mut() {
                        entry.parameters.push(n.to_string());
                    }
                }
                StatusArgument::SqlState(state) => {
                    if let Some(entry) = entries.last_mut() {
                        entry.sql_state = Some(state.clone());
                    }
                }
            }
        }
        entries
    }

    pub fn is_error(&self) -> bool {
        self.arguments
            .iter()
            .any(|a| matches!(a, StatusArgument::Gds(_)))
    }

    /// Error entries; the first one is the primary error.
    pub fn errors(&self) -> Vec<StatusEntry> {
        self.entries().into_iter().filter(|e| !e.warning).collect()
    }

    pub fn warnings(&self) -> Vec<StatusEntry> {
        self.entries().into_iter().filter(|e| e.warning).collect()
    }

    pub fn sql_state(&self) -> Option<&str> {
        self.arguments.iter().find_map(|a| match a {
            StatusArgument::SqlState(s) => Some(s.as_str()),
            _ => None,
        })
    }
}

/// Body of `op_response`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenericResponse {
    pub object_handle: i32,
    pub blob_id: i64,
    pub data: Bytes,
    pub status: StatusVector,
}

impl GenericResponse {
    pub fn read<R: Read>(reader: &mut XdrReader<R>) -> Result<Self, ProtocolError> {
        Ok(Self {
            object_handle: reader.read_i32()?,
            blob_id: reader.read_i64()?,
            data: reader.read_buffer()?,
            status: StatusVector::read(reader)?,
        })
    }
}

/// Body of `op_fetch_response`; a row follows when `count > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: i32,
    pub count: i32,
}

/// Body of `op_sql_response`; a row follows when `count > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlResponse {
    pub count: i32,
}

/// A decoded server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Generic(GenericResponse),
    Fetch(FetchResponse),
    Sql(SqlResponse),
}

impl Response {
    /// Reads the body of a response whose operation code was already read.
    pub fn read_body<R: Read>(operation: i32, reader: &mut XdrReader<R>) -> Result<Self, ProtocolError> {
        match operation {
            OP_RESPONSE => Ok(Response::Generic(GenericResponse::read(reader)?)),
            OP_FETCH_RESPONSE => Ok(Response::Fetch(FetchResponse {
                status: reader.read_i32()?,
                count: reader.read_i32()?,
            })),
            OP_SQL_RESPONSE => Ok(Response::Sql(SqlResponse {
                count: reader.read_i32()?,
            })),
            actual => Err(ProtocolError::UnexpectedOperation {
                expected: "a response",
                actual,
            }),
        }
    }

    /// Reads the next operation code and the response that follows it.
    pub fn read<R: Read>(reader: &mut XdrReader<R>) -> Result<Self, ProtocolError> {
        let operation = reader.read_operation()?;
        Self::read_body(operation, reader)
    }

    pub fn status(&self) -> Option<&StatusVector> {
        match self {
            Response::Generic(r) => Some(&r.status),
            _ => None,
        }
    }
}
