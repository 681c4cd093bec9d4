//! Client error types.

use crate::config::ConfigError;
use fbwire_protocol::response::StatusEntry;
use fbwire_protocol::{ProtocolError, StatusVector};
use std::fmt;
use thiserror::Error;

/// An error or warning reported by the server in a status vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Primary error code.
    pub code: i32,
    pub sql_state: Option<String>,
    /// Message parameters of the primary error.
    pub parameters: Vec<String>,
    /// Codes of the secondary errors, in server order.
    pub chained: Vec<i32>,
}

impl ServerError {
    /// Builds the error of a status vector, if it reports one.
    pub fn from_status(status: &StatusVector) -> Option<Self> {
        let mut errors = status.errors().into_iter();
        let primary = errors.next()?;
        Some(Self {
            code: primary.code,
            sql_state: status.sql_state().map(str::to_owned),
            parameters: primary.parameters,
            chained: errors.map(|e| e.code).collect(),
        })
    }

    pub(crate) fn from_warning(entry: StatusEntry) -> Self {
        Self {
            code: entry.code,
            sql_state: entry.sql_state,
            parameters: entry.parameters,
            chained: Vec::new(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error {}", self.code)?;
        if let Some(ref state) = self.sql_state {
            write!(f, " [SQLSTATE {}]", state)?;
        }
        if !self.parameters.is_empty() {
            write!(f, ": {}", self.parameters.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

/// Client errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("write error: {0}")]
    Write(#[source] std::io::Error),

    #[error("read error: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication failed: {}", .causes.join("; "))]
    AuthenticationFailed { causes: Vec<String> },

    #[error("wire encryption unavailable: {}", .causes.join("; "))]
    EncryptionUnavailable { causes: Vec<String> },

    #[error("invalid handle state: {0}")]
    HandleState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{what} is not supported by protocol version {version}")]
    NotSupported { what: &'static str, version: u32 },

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("connection is broken: {0}")]
    ConnectionBroken(String),

    #[error("connection is closed")]
    NotConnected,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Write(e) => Error::Write(e),
            ProtocolError::Read(e) => Error::Read(e),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    pub(crate) fn handle_state(message: impl Into<String>) -> Self {
        Error::HandleState(message.into())
    }

    /// Returns whether this error came from socket I/O.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Write(_) | Error::Read(_) | Error::Connect { .. })
    }

    /// Returns whether the connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Write(_)
                | Error::Read(_)
                | Error::Protocol(_)
                | Error::ConnectionBroken(_)
                | Error::AuthenticationFailed { .. }
                | Error::EncryptionUnavailable { .. }
        )
    }

    /// Returns the server error code, if the server reported this error.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Error::Server(e) => Some(e.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbwire_protocol::response::StatusArgument;

    #[test]
    fn test_protocol_error_conversion() {
        let err: Error = ProtocolError::Write(std::io::ErrorKind::BrokenPipe.into()).into();
        assert!(matches!(err, Error::Write(_)));
        assert!(err.is_io());

        let err: Error = ProtocolError::Read(std::io::ErrorKind::UnexpectedEof.into()).into();
        assert!(matches!(err, Error::Read(_)));

        let err: Error = ProtocolError::InvalidUtf8.into();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.is_fatal());
        assert!(!err.is_io());
    }

    #[test]
    fn test_server_error_from_status() {
        let status = StatusVector {
            arguments: vec![
                StatusArgument::Gds(335544472),
                StatusArgument::String("SYSDBA".into()),
                StatusArgument::Gds(335544382),
                StatusArgument::SqlState("28000".into()),
            ],
        };
        let err = ServerError::from_status(&status).unwrap();
        assert_eq!(err.code, 335544472);
        assert_eq!(err.chained, vec![335544382]);
        assert_eq!(err.sql_state.as_deref(), Some("28000"));
        let msg = err.to_string();
        assert!(msg.contains("335544472"));
        assert!(msg.contains("28000"));
        assert!(msg.contains("SYSDBA"));

        assert!(ServerError::from_status(&StatusVector::default()).is_none());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(!Error::Server(ServerError {
            code: 1,
            sql_state: None,
            parameters: vec![],
            chained: vec![],
        })
        .is_fatal());
        assert!(!Error::handle_state("blob not open").is_fatal());
        assert!(Error::AuthenticationFailed { causes: vec![] }.is_fatal());
    }

    #[test]
    fn test_aggregated_causes_display() {
        let err = Error::EncryptionUnavailable {
            causes: vec!["Arc4: no session key".into(), "ChaCha: not installed".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Arc4: no session key"));
        assert!(msg.contains("ChaCha: not installed"));
    }
}
