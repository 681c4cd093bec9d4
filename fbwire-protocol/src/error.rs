//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing or decoding wire messages.
///
/// Write and read failures are kept apart: after a failed write the server
/// state is unknown, after a failed read the request may have been processed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("write error: {0}")]
    Write(#[source] std::io::Error),

    #[error("read error: {0}")]
    Read(#[source] std::io::Error),

    #[error("unexpected operation: expected {expected}, got {actual}")]
    UnexpectedOperation { expected: &'static str, actual: i32 },

    #[error("buffer too large: {size} bytes (max {max})")]
    BufferTooLarge { size: usize, max: usize },

    #[error("negative buffer length: {0}")]
    NegativeLength(i32),

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,
}

impl ProtocolError {
    pub(crate) fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            what,
            detail: detail.into(),
        }
    }

    /// Returns whether this error came from the underlying channel.
    pub fn is_io(&self) -> bool {
        matches!(self, ProtocolError::Write(_) | ProtocolError::Read(_))
    }
}
