//! # fbwire-client
//!
//! Client engine for the Firebird wire protocol.
//!
//! This crate provides:
//! - Protocol version descriptors and negotiation (versions 10 to 16)
//! - Connection handshake with plugin based authentication (SRP)
//! - Optional wire encryption keyed by the authentication session key
//! - Lazy send pipelining through a FIFO of deferred responses
//! - Database, transaction, statement and blob handles
//!
//! ```no_run
//! use fbwire_client::{connect, ConnectionConfig};
//! use fbwire_protocol::ParameterBuffer;
//!
//! # fn main() -> Result<(), fbwire_client::Error> {
//! let config = ConnectionConfig::new("localhost", "employee").with_credentials("sysdba", "masterkey");
//! let connection = connect(&config)?;
//! connection.authenticate()?;
//! let database = connection.database();
//! database.attach(ParameterBuffer::dpb())?;
//! database.detach()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod blob;
pub mod config;
pub mod connection;
pub mod crypt;
pub mod database;
pub mod dbcrypt;
pub mod deferred;
pub mod descriptor;
pub mod error;
pub(crate) mod handshake;
pub mod info;
pub mod statement;
pub mod transaction;
pub(crate) mod wire;

#[cfg(test)]
mod testing;

pub use auth::{AuthPlugin, AuthPluginProvider, AuthPluginRegistry, Credentials};
pub use blob::{Blob, BlobState, SeekMode};
pub use config::{ConfigError, ConnectionConfig, WireCrypt};
pub use connection::{
    connect, CancelKind, Connection, ConnectionState, Connector, LoggingWarningCallback,
    WarningCallback,
};
pub use crypt::{EncryptionIdentifier, EncryptionPlugin, EncryptionPluginRegistry};
pub use database::Database;
pub use dbcrypt::{DbCryptCallback, NoDbCryptCallback, StaticDbCryptCallback};
pub use descriptor::{Capabilities, ProtocolDescriptor, ProtocolRegistry};
pub use error::{Error, ServerError};
pub use info::{InfoItems, RowCounts, StatementInfo};
pub use statement::{Rows, Statement, StatementState};
pub use transaction::{Transaction, TransactionState};
