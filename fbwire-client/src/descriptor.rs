//! Protocol version descriptors.
//!
//! Every supported protocol version is described by a static
//! [`ProtocolDescriptor`]. Newer versions are declared as deltas over the
//! previous one, so a behavior only changes where the protocol changed it.
//! The descriptor picked during the handshake decides how every handle of
//! the connection talks to the server.

use crate::auth::ClientAuthBlock;
use crate::blob::Blob;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::database::Database;
use crate::dbcrypt::{self, DbCryptCallback};
use crate::error::Error;
use crate::statement::Statement;
use crate::transaction::Transaction;
use fbwire_protocol::consts::*;
use fbwire_protocol::{ParameterBuffer, RowCodec, XdrReader, XdrWriter};
use std::io::{Read, Write};

/// How cancellation requests can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSupport {
    /// Only a forced abort (closing the socket) is possible.
    AbortOnly,
    /// `op_cancel` with disable, enable and raise, plus abort.
    Full,
}

/// How credentials travel in the attach parameter buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthParameterConverter {
    /// User name and plain password items.
    LegacyPassword,
    /// User name plus authentication plugin name, list and data.
    PluginData,
}

impl AuthParameterConverter {
    /// Adds the credential items to an attach or create DPB.
    pub(crate) fn fill_dpb(
        self,
        dpb: &mut ParameterBuffer,
        config: &ConnectionConfig,
        auth: &ClientAuthBlock,
    ) {
        if let Some(ref user) = config.user {
            if !dpb.contains(ISC_DPB_USER_NAME) {
                dpb.add_string(ISC_DPB_USER_NAME, user);
            }
        }
        match self {
            AuthParameterConverter::LegacyPassword => {
                if let Some(ref password) = config.password {
                    if !dpb.contains(ISC_DPB_PASSWORD) {
                        dpb.add_string(ISC_DPB_PASSWORD, password);
                    }
                }
            }
            AuthParameterConverter::PluginData => {
                dpb.remove(ISC_DPB_PASSWORD);
                if auth.is_complete() {
                    return;
                }
                if let Some(name) = auth.current_plugin_name() {
                    dpb.add_string(ISC_DPB_AUTH_PLUGIN_NAME, name);
                }
                dpb.add_string(ISC_DPB_AUTH_PLUGIN_LIST, &auth.plugin_names());
                if let Some(data) = auth.client_data() {
                    dpb.add_bytes(ISC_DPB_SPECIFIC_AUTH_DATA, data);
                }
            }
        }
    }
}

/// Behaviors that differ between protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Release operations may be deferred (`ptype_lazy_send`).
    pub lazy_send: bool,
    pub cancel: CancelSupport,
    /// Authentication runs as a plugin exchange (`op_cont_auth`).
    pub plugin_auth: bool,
    pub wire_crypt: bool,
    /// File names are sent as UTF-8 and flagged in the DPB.
    pub utf8_filename: bool,
    pub row_codec: RowCodec,
    /// Largest info buffer the server accepts for statement info.
    pub max_info_size: i32,
    /// Crypt key callbacks carry the expected reply size.
    pub crypt_callback_reply_size: bool,
    /// Execute requests carry a statement timeout.
    pub statement_timeout: bool,
    pub auth_converter: AuthParameterConverter,
}

const V10_CAPABILITIES: Capabilities = Capabilities {
    lazy_send: false,
    cancel: CancelSupport::AbortOnly,
    plugin_auth: false,
    wire_crypt: false,
    utf8_filename: false,
    row_codec: RowCodec::NullIndicators,
    max_info_size: 32767,
    crypt_callback_reply_size: false,
    statement_timeout: false,
    auth_converter: AuthParameterConverter::LegacyPassword,
};

const V11_CAPABILITIES: Capabilities = Capabilities {
    lazy_send: true,
    max_info_size: 65535,
    ..V10_CAPABILITIES
};

const V12_CAPABILITIES: Capabilities = Capabilities {
    cancel: CancelSupport::Full,
    ..V11_CAPABILITIES
};

const V13_CAPABILITIES: Capabilities = Capabilities {
    plugin_auth: true,
    wire_crypt: true,
    utf8_filename: true,
    row_codec: RowCodec::NullBitmap,
    max_info_size: 16 * 1024 * 1024,
    auth_converter: AuthParameterConverter::PluginData,
    ..V12_CAPABILITIES
};

const V15_CAPABILITIES: Capabilities = Capabilities {
    crypt_callback_reply_size: true,
    ..V13_CAPABILITIES
};

const V16_CAPABILITIES: Capabilities = Capabilities {
    statement_timeout: true,
    ..V15_CAPABILITIES
};

/// One supported protocol version.
#[derive(Debug, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    version: u32,
    architecture: i32,
    min_type: i32,
    max_type: i32,
    supports_compression: bool,
    weight: i32,
    capabilities: Capabilities,
}

pub static PROTOCOL_V10: ProtocolDescriptor = ProtocolDescriptor {
    version: 10,
    architecture: ARCH_GENERIC,
    min_type: PTYPE_RPC,
    max_type: PTYPE_BATCH_SEND,
    supports_compression: false,
    weight: 2,
    capabilities: V10_CAPABILITIES,
};

pub static PROTOCOL_V11: ProtocolDescriptor = ProtocolDescriptor {
    version: 11,
    max_type: PTYPE_LAZY_SEND,
    weight: 4,
    capabilities: V11_CAPABILITIES,
    ..PROTOCOL_V10
};

pub static PROTOCOL_V12: ProtocolDescriptor = ProtocolDescriptor {
    version: 12,
    weight: 6,
    capabilities: V12_CAPABILITIES,
    ..PROTOCOL_V11
};

pub static PROTOCOL_V13: ProtocolDescriptor = ProtocolDescriptor {
    version: 13,
    supports_compression: true,
    weight: 8,
    capabilities: V13_CAPABILITIES,
    ..PROTOCOL_V12
};

pub static PROTOCOL_V15: ProtocolDescriptor = ProtocolDescriptor {
    version: 15,
    weight: 10,
    capabilities: V15_CAPABILITIES,
    ..PROTOCOL_V13
};

pub static PROTOCOL_V16: ProtocolDescriptor = ProtocolDescriptor {
    version: 16,
    weight: 12,
    capabilities: V16_CAPABILITIES,
    ..PROTOCOL_V15
};

static ALL_PROTOCOLS: [&ProtocolDescriptor; 6] = [
    &PROTOCOL_V10,
    &PROTOCOL_V11,
    &PROTOCOL_V12,
    &PROTOCOL_V13,
    &PROTOCOL_V15,
    &PROTOCOL_V16,
];

impl ProtocolDescriptor {
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Version number as sent on the wire.
    pub fn wire_version(&self) -> i32 {
        wire_protocol_version(self.version)
    }

    pub fn architecture(&self) -> i32 {
        self.architecture
    }

    pub fn min_type(&self) -> i32 {
        self.min_type
    }

    pub fn max_type(&self) -> i32 {
        self.max_type
    }

    pub fn supports_compression(&self) -> bool {
        self.supports_compression
    }

    /// Preference weight; the server picks the highest weight it supports.
    pub fn weight(&self) -> i32 {
        self.weight
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub(crate) fn not_supported(&self, what: &'static str) -> Error {
        Error::NotSupported {
            what,
            version: self.version,
        }
    }

    pub fn create_database(&'static self, connection: Connection) -> Database {
        Database::new(connection, self)
    }

    pub fn create_transaction(&'static self, database: &Database, handle: i32) -> Transaction {
        Transaction::new(database.downgrade(), self, handle)
    }

    pub fn create_statement(&'static self, database: &Database) -> Statement {
        Statement::new(database.downgrade(), self)
    }

    pub fn create_input_blob(
        &'static self,
        database: &Database,
        transaction: &Transaction,
        blob_id: i64,
        bpb: Option<ParameterBuffer>,
    ) -> Blob {
        Blob::input(database.downgrade(), self, transaction.handle(), blob_id, bpb)
    }

    pub fn create_output_blob(
        &'static self,
        database: &Database,
        transaction: &Transaction,
        bpb: Option<ParameterBuffer>,
    ) -> Blob {
        Blob::output(database.downgrade(), self, transaction.handle(), bpb)
    }

    pub fn create_wire_operations(&self) -> WireOperations {
        WireOperations {
            version: self.version,
            capabilities: self.capabilities,
        }
    }

    pub fn auth_parameter_converter(&self) -> AuthParameterConverter {
        self.capabilities.auth_converter
    }
}

/// Connection-level operations whose encoding depends on the version.
#[derive(Debug, Clone, Copy)]
pub struct WireOperations {
    version: u32,
    capabilities: Capabilities,
}

impl WireOperations {
    pub fn uses_plugin_auth(&self) -> bool {
        self.capabilities.plugin_auth
    }

    pub fn supports_wire_crypt(&self) -> bool {
        self.capabilities.wire_crypt
    }

    /// Writes an `op_cancel` request; only abort works before version 12.
    pub(crate) fn write_cancel<W: Write>(
        &self,
        out: &mut XdrWriter<W>,
        kind: i32,
    ) -> Result<(), Error> {
        if self.capabilities.cancel != CancelSupport::Full {
            return Err(Error::NotSupported {
                what: "cancel operation",
                version: self.version,
            });
        }
        out.write_i32(OP_CANCEL);
        out.write_i32(kind);
        Ok(())
    }

    /// Answers an `op_crypt_key_callback` whose operation code was read.
    pub(crate) fn answer_crypt_callback<R: Read, W: Write>(
        &self,
        input: &mut XdrReader<R>,
        output: &mut XdrWriter<W>,
        callback: &dyn DbCryptCallback,
    ) -> Result<(), Error> {
        dbcrypt::answer_callback(
            input,
            output,
            callback,
            self.capabilities.crypt_callback_reply_size,
        )
    }
}

/// The set of protocol versions a connection may offer.
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    descriptors: Vec<&'static ProtocolDescriptor>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self {
            descriptors: ALL_PROTOCOLS.to_vec(),
        }
    }
}

impl ProtocolRegistry {
    /// Restricts the registry to the given versions.
    pub fn with_versions(versions: &[u32]) -> Result<Self, Error> {
        Self::default().restricted_to(versions)
    }

    /// Returns the subset of this registry named by `versions`; an empty
    /// list keeps everything.
    pub fn restricted_to(&self, versions: &[u32]) -> Result<Self, Error> {
        if versions.is_empty() {
            return Ok(self.clone());
        }
        let mut descriptors = Vec::with_capacity(versions.len());
        for version in versions {
            let descriptor = self.get(*version).ok_or_else(|| {
                Error::InvalidArgument(format!("protocol version {} is not supported", version))
            })?;
            if !descriptors.contains(&descriptor) {
                descriptors.push(descriptor);
            }
        }
        descriptors.sort_by_key(|d| d.weight);
        Ok(Self { descriptors })
    }

    pub fn get(&self, version: u32) -> Option<&'static ProtocolDescriptor> {
        self.descriptors.iter().copied().find(|d| d.version == version)
    }

    /// Descriptors in ascending weight order.
    pub fn offered(&self) -> &[&'static ProtocolDescriptor] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Maps the version accepted by the server to its descriptor. A version
    /// that was not offered is a protocol violation.
    pub fn negotiate(&self, accepted: i32) -> Result<&'static ProtocolDescriptor, Error> {
        let version = plain_protocol_version(accepted);
        self.get(version).ok_or_else(|| {
            Error::protocol(format!(
                "server accepted protocol version {} which was not offered",
                version
            ))
        })
    }
}
