//! Database attachments.

use crate::blob::Blob;
use crate::connection::{AttachmentState, CancelKind, Connection, ConnectionState, Shared};
use crate::descriptor::ProtocolDescriptor;
use crate::error::Error;
use crate::handshake;
use crate::statement::Statement;
use crate::transaction::{Transaction, TransactionState};
use crate::wire::Wire;
use bytes::Bytes;
use fbwire_protocol::consts::*;
use fbwire_protocol::{Encoding, ParameterBuffer};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Resolves a handle's weak reference to its connection.
pub(crate) fn upgrade(database: &Weak<Shared>) -> Result<Arc<Shared>, Error> {
    database
        .upgrade()
        .ok_or_else(|| Error::handle_state("database handle was dropped"))
}

/// An attachment to one database over a [`Connection`].
#[derive(Debug, Clone)]
pub struct Database {
    connection: Connection,
    descriptor: &'static ProtocolDescriptor,
}

impl Database {
    pub(crate) fn new(connection: Connection, descriptor: &'static ProtocolDescriptor) -> Self {
        Self {
            connection,
            descriptor,
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.connection.shared)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn protocol_version(&self) -> u32 {
        self.descriptor.version()
    }

    /// The server's handle of this attachment.
    pub fn handle(&self) -> Option<i32> {
        match self.connection.shared.channel.lock().attachment {
            AttachmentState::Attached { handle } => Some(handle),
            _ => None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.handle().is_some()
    }

    /// Attaches to the configured database.
    pub fn attach(&self, dpb: ParameterBuffer) -> Result<(), Error> {
        self.attach_or_create(OP_ATTACH, dpb)
    }

    /// Creates the configured database and attaches to it.
    pub fn create(&self, dpb: ParameterBuffer) -> Result<(), Error> {
        self.attach_or_create(OP_CREATE, dpb)
    }

    fn attach_or_create(&self, operation: i32, dpb: ParameterBuffer) -> Result<(), Error> {
        let shared = &self.connection.shared;
        let mut wire = shared.lock()?;
        if wire.channel.attachment != AttachmentState::Detached {
            return Err(Error::handle_state("database is already attached"));
        }
        if shared.state() != ConnectionState::Ready {
            return Err(Error::handle_state(
                "connection must be authenticated before attaching",
            ));
        }

        let dpb = self.complete_dpb(dpb, &wire);
        let content = dpb.content()?;
        let config = wire.config();
        let encoding = if self.descriptor.capabilities().utf8_filename {
            Encoding::Utf8
        } else {
            Encoding::Latin1
        };
        let filename = encoding.encode(&config.database);
        debug!(
            operation = if operation == OP_ATTACH { "attach" } else { "create" },
            database = %config.database,
            "opening database"
        );
        wire.send(|out| {
            out.write_i32(operation);
            out.write_i32(0);
            out.write_buffer(&filename);
            out.write_typed(dpb.version(), &content);
        })?;

        let response = if self.descriptor.capabilities().plugin_auth {
            handshake::receive_auth_response(&mut wire, None)?
        } else {
            wire.read_generic_response()?
        };
        wire.channel.attachment = AttachmentState::Attached {
            handle: response.object_handle,
        };
        info!(database = %config.database, handle = response.object_handle, "database attached");
        Ok(())
    }

    /// Adds connection-level items the caller did not set.
    fn complete_dpb(&self, mut dpb: ParameterBuffer, wire: &Wire<'_>) -> ParameterBuffer {
        let config = wire.config();
        if !dpb.contains(ISC_DPB_LC_CTYPE) {
            dpb.add_string(ISC_DPB_LC_CTYPE, &config.charset);
        }
        if !dpb.contains(ISC_DPB_SQL_DIALECT) {
            dpb.add_int(ISC_DPB_SQL_DIALECT, config.sql_dialect);
        }
        if !dpb.contains(ISC_DPB_CONNECT_TIMEOUT) {
            dpb.add_int(ISC_DPB_CONNECT_TIMEOUT, config.connect_timeout_secs as i32);
        }
        if let Some(ref role) = config.role {
            if !dpb.contains(ISC_DPB_SQL_ROLE_NAME) {
                dpb.add_string(ISC_DPB_SQL_ROLE_NAME, role);
            }
        }
        if !dpb.contains(ISC_DPB_PROCESS_ID) {
            let pid = config.process_id.unwrap_or_else(std::process::id);
            dpb.add_int(ISC_DPB_PROCESS_ID, pid as i32);
        }
        if let Some(ref name) = config.process_name {
            if !dpb.contains(ISC_DPB_PROCESS_NAME) {
                dpb.add_string(ISC_DPB_PROCESS_NAME, name);
            }
        }
        if !dpb.contains(ISC_DPB_CLIENT_VERSION) {
            dpb.add_string(
                ISC_DPB_CLIENT_VERSION,
                concat!("fbwire ", env!("CARGO_PKG_VERSION")),
            );
        }
        if self.descriptor.capabilities().utf8_filename && !dpb.contains(ISC_DPB_UTF8_FILENAME) {
            dpb.add_bytes(ISC_DPB_UTF8_FILENAME, &[]);
        }
        self.descriptor
            .auth_parameter_converter()
            .fill_dpb(&mut dpb, config, &wire.channel.auth);
        dpb
    }

    /// Detaches and closes the connection.
    pub fn detach(&self) -> Result<(), Error> {
        self.release(OP_DETACH, "detached")
    }

    /// Drops the attached database and closes the connection.
    pub fn drop_database(&self) -> Result<(), Error> {
        self.release(OP_DROP_DATABASE, "dropped")
    }

    fn release(&self, operation: i32, outcome: &str) -> Result<(), Error> {
        let shared = &self.connection.shared;
        let mut wire = shared.lock()?;
        let handle = wire.database_handle()?;
        wire.drain_synchronously()?;
        wire.send(|out| {
            out.write_i32(operation);
            out.write_i32(handle);
        })?;
        wire.read_generic_response()?;
        wire.channel.attachment = AttachmentState::Closed;
        info!(handle, "database {}", outcome);

        if let Err(e) = wire.send(|out| out.write_i32(OP_DISCONNECT)) {
            debug!("op_disconnect failed: {}", e);
        }
        drop(wire);
        shared.close();
        Ok(())
    }

    /// Starts a transaction described by `tpb`.
    pub fn start_transaction(&self, tpb: &ParameterBuffer) -> Result<Transaction, Error> {
        let content = tpb.content()?;
        let handle = {
            let mut wire = self.connection.shared.lock()?;
            let db = wire.database_handle()?;
            wire.send(|out| {
                out.write_i32(OP_TRANSACTION);
                out.write_i32(db);
                out.write_typed(tpb.version(), &content);
            })?;
            wire.read_generic_response()?.object_handle
        };
        debug!(handle, "transaction started");
        Ok(self.descriptor.create_transaction(self, handle))
    }

    /// Reconnects a prepared (limbo) transaction by its id.
    pub fn reconnect_transaction(&self, transaction_id: i64) -> Result<Transaction, Error> {
        let id = match u32::try_from(transaction_id) {
            Ok(id) => id.to_le_bytes().to_vec(),
            Err(_) => transaction_id.to_le_bytes().to_vec(),
        };
        let handle = {
            let mut wire = self.connection.shared.lock()?;
            let db = wire.database_handle()?;
            wire.send(|out| {
                out.write_i32(OP_RECONNECT);
                out.write_i32(db);
                out.write_buffer(&id);
            })?;
            wire.read_generic_response()?.object_handle
        };
        let transaction = self.descriptor.create_transaction(self, handle);
        transaction.set_state(TransactionState::Prepared);
        Ok(transaction)
    }

    /// Executes a statement without preparing it. Without a transaction
    /// only statements like `CREATE DATABASE` are accepted by the server.
    pub fn execute_immediate(&self, transaction: Option<&Transaction>, sql: &str) -> Result<(), Error> {
        let mut wire = self.connection.shared.lock()?;
        let db = wire.database_handle()?;
        let dialect = wire.config().sql_dialect;
        wire.send(|out| {
            out.write_i32(OP_EXEC_IMMEDIATE);
            out.write_i32(transaction.map_or(0, Transaction::handle));
            out.write_i32(db);
            out.write_i32(dialect);
            out.write_string(sql);
            out.write_opt_buffer(None);
            out.write_i32(0);
        })?;
        wire.read_generic_response()?;
        Ok(())
    }

    /// Requests database info items.
    pub fn info(&self, items: &[u8], max_len: usize) -> Result<Bytes, Error> {
        let mut wire = self.connection.shared.lock()?;
        let db = wire.database_handle()?;
        wire.send(|out| {
            out.write_i32(OP_INFO_DATABASE);
            out.write_i32(db);
            out.write_i32(0);
            out.write_buffer(items);
            out.write_i32(max_len as i32);
        })?;
        Ok(wire.read_generic_response()?.data)
    }

    /// Round trip to the server; also drains deferred responses.
    pub fn ping(&self) -> Result<(), Error> {
        let mut wire = self.connection.shared.lock()?;
        wire.database_handle()?;
        wire.send(|out| out.write_i32(OP_PING))?;
        wire.read_generic_response()?;
        Ok(())
    }

    pub fn cancel_operation(&self, kind: CancelKind) -> Result<(), Error> {
        self.connection.cancel_operation(kind)
    }

    pub fn create_statement(&self) -> Statement {
        self.descriptor.create_statement(self)
    }

    /// A blob for writing; the server assigns its id on open.
    pub fn create_blob(&self, transaction: &Transaction, bpb: Option<ParameterBuffer>) -> Blob {
        self.descriptor.create_output_blob(self, transaction, bpb)
    }

    /// A blob for reading the existing blob `blob_id`.
    pub fn open_blob(
        &self,
        transaction: &Transaction,
        blob_id: i64,
        bpb: Option<ParameterBuffer>,
    ) -> Blob {
        self.descriptor
            .create_input_blob(self, transaction, blob_id, bpb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::connect;
    use crate::testing::FakeServer;
    use fbwire_protocol::ClumpletReader;
    use std::collections::HashMap;

    /// Parses a DPB of either version; version 2 uses 4-byte lengths.
    fn dpb_items(buffer: &[u8]) -> HashMap<u8, Vec<u8>> {
        if buffer[0] == ISC_DPB_VERSION1 {
            return ClumpletReader::new(&buffer[1..])
                .map(|item| item.map(|(tag, value)| (tag, value.to_vec())))
                .collect::<Result<_, _>>()
                .unwrap();
        }
        let mut items = HashMap::new();
        let mut rest = &buffer[1..];
        while !rest.is_empty() {
            let len = u32::from_le_bytes(rest[1..5].try_into().unwrap()) as usize;
            items.insert(rest[0], rest[5..5 + len].to_vec());
            rest = &rest[5 + len..];
        }
        items
    }

    #[test]
    fn test_attach_v12_sends_password() {
        let server = FakeServer::start(|peer| {
            peer.read_connect();
            peer.accept(PROTOCOL_VERSION12, PTYPE_LAZY_SEND);
            peer.expect_request(OP_ATTACH, &[0]);
            assert_eq!(&peer.input.read_buffer().unwrap()[..], b"test.fdb");
            let dpb = dpb_items(&peer.input.read_buffer().unwrap());
            assert_eq!(dpb[&ISC_DPB_USER_NAME], b"sysdba".to_vec());
            assert_eq!(dpb[&ISC_DPB_PASSWORD], b"masterkey".to_vec());
            assert_eq!(dpb[&ISC_DPB_LC_CTYPE], b"UTF8".to_vec());
            assert_eq!(dpb[&ISC_DPB_SQL_DIALECT], 3i32.to_le_bytes().to_vec());
            assert!(!dpb.contains_key(&ISC_DPB_UTF8_FILENAME));
            assert!(!dpb.contains_key(&ISC_DPB_AUTH_PLUGIN_NAME));
            peer.ok(7);
        });

        let connection = connect(&server.config().with_protocol_versions(&[12])).unwrap();
        connection.authenticate().unwrap();
        let database = connection.database();
        database.attach(ParameterBuffer::dpb()).unwrap();
        assert_eq!(database.handle(), Some(7));
        assert!(matches!(
            database.attach(ParameterBuffer::dpb()),
            Err(Error::HandleState(_))
        ));
        server.join();
    }

    #[test]
    fn test_attach_v13_sends_plugin_data() {
        let server = FakeServer::start(|peer| {
            peer.read_connect();
            peer.accept(PROTOCOL_VERSION13, PTYPE_LAZY_SEND);
            peer.expect_request(OP_ATTACH, &[0]);
            peer.input.read_buffer().unwrap();
            let dpb = dpb_items(&peer.input.read_buffer().unwrap());
            assert_eq!(dpb[&ISC_DPB_USER_NAME], b"sysdba".to_vec());
            assert!(!dpb.contains_key(&ISC_DPB_PASSWORD));
            assert_eq!(dpb[&ISC_DPB_AUTH_PLUGIN_NAME], b"Srp256".to_vec());
            assert_eq!(dpb[&ISC_DPB_AUTH_PLUGIN_LIST], b"Srp256,Srp".to_vec());
            // Hex encoded SRP public key.
            assert!(dpb[&ISC_DPB_SPECIFIC_AUTH_DATA].len() > 200);
            assert!(dpb[&ISC_DPB_SPECIFIC_AUTH_DATA]
                .iter()
                .all(|b| b.is_ascii_hexdigit()));
            assert!(dpb[&ISC_DPB_UTF8_FILENAME].is_empty());
            peer.ok(3);
        });

        let connection = connect(&server.config()).unwrap();
        connection.authenticate().unwrap();
        let database = connection.database();
        database.attach(ParameterBuffer::dpb()).unwrap();
        assert_eq!(database.handle(), Some(3));
        server.join();
    }

    #[test]
    fn test_attach_requires_authentication() {
        let server = FakeServer::start(|peer| {
            peer.read_connect();
            peer.accept(PROTOCOL_VERSION13, PTYPE_LAZY_SEND);
        });
        let connection = connect(&server.config()).unwrap();
        assert!(matches!(
            connection.database().attach(ParameterBuffer::dpb()),
            Err(Error::HandleState(_))
        ));
        server.join();
    }

    #[test]
    fn test_attach_failure_leaves_database_detached() {
        let server = FakeServer::start(|peer| {
            peer.read_connect();
            peer.accept(PROTOCOL_VERSION12, PTYPE_LAZY_SEND);
            peer.expect_op(OP_ATTACH);
            peer.read_i32();
            peer.input.skip_buffer().unwrap();
            peer.input.skip_buffer().unwrap();
            peer.error(335544344);
        });
        let connection = connect(&server.config().with_protocol_versions(&[12])).unwrap();
        connection.authenticate().unwrap();
        let database = connection.database();
        let err = database.attach(ParameterBuffer::dpb()).unwrap_err();
        assert_eq!(err.server_code(), Some(335544344));
        assert!(!database.is_attached());
        assert_eq!(connection.state(), ConnectionState::Ready);
        server.join();
    }

    #[test]
    fn test_detach_disconnects() {
        let server = FakeServer::start(|peer| {
            peer.handshake(PROTOCOL_VERSION13);
            peer.expect_request(OP_DETACH, &[1]);
            peer.ok(0);
            peer.expect_op(OP_DISCONNECT);
        });

        let connection = connect(&server.config()).unwrap();
        connection.authenticate().unwrap();
        let database = connection.database();
        database.attach(ParameterBuffer::dpb()).unwrap();
        database.detach().unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(database.ping(), Err(Error::NotConnected)));
        server.join();
    }

    #[test]
    fn test_start_transaction_and_execute_immediate() {
        let server = FakeServer::start(|peer| {
            peer.handshake(PROTOCOL_VERSION13);
            peer.expect_request(OP_TRANSACTION, &[1]);
            let tpb = peer.input.read_buffer().unwrap();
            assert_eq!(&tpb[..], &[ISC_TPB_VERSION3, ISC_TPB_CONCURRENCY, ISC_TPB_WAIT]);
            peer.ok(42);

            peer.expect_request(OP_EXEC_IMMEDIATE, &[42, 1, 3]);
            assert_eq!(peer.input.read_string().unwrap(), "DELETE FROM t");
            peer.input.skip_buffer().unwrap();
            assert_eq!(peer.read_i32(), 0);
            peer.ok(0);
        });

        let connection = connect(&server.config()).unwrap();
        connection.authenticate().unwrap();
        let database = connection.database();
        database.attach(ParameterBuffer::dpb()).unwrap();

        let mut tpb = ParameterBuffer::tpb();
        tpb.add_flag(ISC_TPB_CONCURRENCY).add_flag(ISC_TPB_WAIT);
        let transaction = database.start_transaction(&tpb).unwrap();
        assert_eq!(transaction.handle(), 42);
        assert_eq!(transaction.state(), TransactionState::Active);
        database
            .execute_immediate(Some(&transaction), "DELETE FROM t")
            .unwrap();
        server.join();
    }

    #[test]
    fn test_database_info() {
        let server = FakeServer::start(|peer| {
            peer.handshake(PROTOCOL_VERSION13);
            peer.expect_request(OP_INFO_DATABASE, &[1, 0]);
            assert_eq!(&peer.input.read_buffer().unwrap()[..], &[ISC_INFO_ODS_VERSION]);
            assert_eq!(peer.read_i32(), 64);
            peer.response(0, &[ISC_INFO_ODS_VERSION, 4, 0, 13, 0, 0, 0, ISC_INFO_END]);
        });

        let connection = connect(&server.config()).unwrap();
        connection.authenticate().unwrap();
        let database = connection.database();
        database.attach(ParameterBuffer::dpb()).unwrap();
        let info = database.info(&[ISC_INFO_ODS_VERSION], 64).unwrap();
        assert_eq!(info[0], ISC_INFO_ODS_VERSION);
        assert_eq!(info.len(), 8);
        server.join();
    }

    #[test]
    fn test_operations_need_attachment() {
        let server = FakeServer::start(|peer| {
            peer.read_connect();
            peer.accept(PROTOCOL_VERSION13, PTYPE_LAZY_SEND);
        });
        let connection = connect(&server.config()).unwrap();
        connection.authenticate().unwrap();
        let database = connection.database();
        assert!(matches!(database.ping(), Err(Error::HandleState(_))));
        assert!(matches!(
            database.start_transaction(&ParameterBuffer::tpb()),
            Err(Error::HandleState(_))
        ));
        server.join();
    }
}
