//! Connection management.
//!
//! A [`Connection`] owns one TCP socket. All request/response exchanges run
//! under the connection's main lock, which also guards the input stream and
//! the deferred queue. Output goes through a separate transmit lock so a
//! cancel request can be written while another thread waits for a response.
//!
//! Lock order: main lock, then transmit lock, then the state lock.

use crate::auth::{AuthPluginRegistry, ClientAuthBlock, Credentials};
use crate::config::ConnectionConfig;
use crate::crypt::{EncryptionIdentifier, EncryptionPluginRegistry};
use crate::database::Database;
use crate::dbcrypt::{DbCryptCallback, NoDbCryptCallback};
use crate::deferred::DeferredQueue;
use crate::descriptor::{ProtocolDescriptor, ProtocolRegistry};
use crate::error::{Error, ServerError};
use crate::handshake::{self, AcceptPacket};
use crate::wire::Wire;
use fbwire_protocol::consts::*;
use fbwire_protocol::{XdrReader, XdrWriter};
use parking_lot::Mutex;
use std::fmt;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Negotiating,
    /// Protocol negotiated, authentication pending.
    Connected,
    Authenticating,
    Ready,
    /// Unusable after an I/O or protocol failure.
    Error(String),
    Closed,
}

/// Receives warnings reported by the server.
pub trait WarningCallback: Send + Sync {
    fn process_warning(&self, warning: &ServerError);
}

/// Logs warnings at `warn` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingWarningCallback;

impl WarningCallback for LoggingWarningCallback {
    fn process_warning(&self, warning: &ServerError) {
        warn!(code = warning.code, "server warning: {}", warning);
    }
}

/// Kind of cancellation requested with [`Connection::cancel_operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// Stop honoring cancel requests.
    Disable,
    /// Honor cancel requests again.
    Enable,
    /// Cancel the running operation.
    Raise,
    /// Close the socket, failing every operation in progress.
    Abort,
}

impl CancelKind {
    fn wire_value(self) -> i32 {
        match self {
            CancelKind::Disable => FB_CANCEL_DISABLE,
            CancelKind::Enable => FB_CANCEL_ENABLE,
            CancelKind::Raise => FB_CANCEL_RAISE,
            CancelKind::Abort => FB_CANCEL_ABORT,
        }
    }
}

/// Attachment held by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttachmentState {
    Detached,
    Attached { handle: i32 },
    Closed,
}

/// State guarded by the main lock.
pub(crate) struct Channel {
    pub(crate) input: XdrReader<TcpStream>,
    pub(crate) deferred: DeferredQueue,
    pub(crate) auth: ClientAuthBlock,
    pub(crate) accept: Option<AcceptPacket>,
    pub(crate) attachment: AttachmentState,
    pub(crate) encryption: Option<EncryptionIdentifier>,
}

pub(crate) struct Shared {
    pub(crate) config: ConnectionConfig,
    pub(crate) descriptor: &'static ProtocolDescriptor,
    pub(crate) channel: Mutex<Channel>,
    pub(crate) transmit: Mutex<XdrWriter<TcpStream>>,
    pub(crate) encryption_plugins: EncryptionPluginRegistry,
    pub(crate) db_crypt_callback: Arc<dyn DbCryptCallback>,
    pub(crate) warning_callback: Arc<dyn WarningCallback>,
    socket: TcpStream,
    state: Mutex<ConnectionState>,
}

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if matches!(*current, ConnectionState::Error(_) | ConnectionState::Closed) {
            return;
        }
        debug!("connection state: {:?} -> {:?}", *current, state);
        *current = state;
    }

    /// Moves the connection into the error state after a fatal failure.
    pub(crate) fn mark_broken(&self, cause: &Error) {
        let mut current = self.state.lock();
        if matches!(*current, ConnectionState::Error(_) | ConnectionState::Closed) {
            return;
        }
        warn!("connection broken: {}", cause);
        *current = ConnectionState::Error(cause.to_string());
    }

    /// Fails fast when the connection can no longer be used.
    pub(crate) fn check_usable(&self) -> Result<(), Error> {
        match &*self.state.lock() {
            ConnectionState::Error(cause) => Err(Error::ConnectionBroken(cause.clone())),
            ConnectionState::Closed | ConnectionState::Unconnected => Err(Error::NotConnected),
            _ => Ok(()),
        }
    }

    /// Acquires the main lock.
    pub(crate) fn lock(&self) -> Result<Wire<'_>, Error> {
        self.check_usable()?;
        let channel = self.channel.lock();
        // An abort may have happened while waiting for the lock.
        self.check_usable()?;
        Ok(Wire::new(self, channel))
    }

    pub(crate) fn close_socket(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            debug!("socket shutdown failed: {}", e);
        }
    }

    fn abort(&self) {
        self.mark_broken(&Error::ConnectionBroken("connection aborted".to_string()));
        self.close_socket();
    }

    pub(crate) fn close(&self) {
        self.close_socket();
        *self.state.lock() = ConnectionState::Closed;
    }
}

/// Establishes connections.
#[derive(Clone)]
pub struct Connector {
    protocols: ProtocolRegistry,
    auth_plugins: AuthPluginRegistry,
    encryption_plugins: EncryptionPluginRegistry,
    db_crypt_callback: Arc<dyn DbCryptCallback>,
    warning_callback: Arc<dyn WarningCallback>,
}

impl Default for Connector {
    fn default() -> Self {
        Self {
            protocols: ProtocolRegistry::default(),
            auth_plugins: AuthPluginRegistry::default(),
            encryption_plugins: EncryptionPluginRegistry::default(),
            db_crypt_callback: Arc::new(NoDbCryptCallback),
            warning_callback: Arc::new(LoggingWarningCallback),
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("protocols", &self.protocols)
            .field("auth_plugins", &self.auth_plugins)
            .field("encryption_plugins", &self.encryption_plugins)
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocols(mut self, protocols: ProtocolRegistry) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_auth_plugins(mut self, registry: AuthPluginRegistry) -> Self {
        self.auth_plugins = registry;
        self
    }

    pub fn with_encryption_plugins(mut self, registry: EncryptionPluginRegistry) -> Self {
        self.encryption_plugins = registry;
        self
    }

    pub fn with_db_crypt_callback(mut self, callback: Arc<dyn DbCryptCallback>) -> Self {
        self.db_crypt_callback = callback;
        self
    }

    pub fn with_warning_callback(mut self, callback: Arc<dyn WarningCallback>) -> Self {
        self.warning_callback = callback;
        self
    }

    /// Opens a socket and negotiates the protocol version.
    ///
    /// The returned connection is `Connected`; call
    /// [`Connection::authenticate`] next.
    pub fn connect(&self, config: &ConnectionConfig) -> Result<Connection, Error> {
        config.validate()?;
        let offered = self.protocols.restricted_to(&config.protocol_versions)?;
        let credentials = Credentials::new(config.user.clone(), config.password.clone());
        let mut auth = ClientAuthBlock::new(&self.auth_plugins, &config.auth_plugins, credentials)?;

        let address = config.address();
        let socket = open_socket(config)?;
        let connect_error = |source| Error::Connect {
            addr: address.clone(),
            source,
        };
        let mut input = XdrReader::new(socket.try_clone().map_err(connect_error)?);
        let mut output = XdrWriter::new(socket.try_clone().map_err(connect_error)?);

        debug!(%address, "connection state: Unconnected -> Negotiating");
        let negotiated = handshake::identify(
            &mut input,
            &mut output,
            config,
            &offered,
            &mut auth,
            self.db_crypt_callback.as_ref(),
        );
        let (descriptor, accept) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                let _ = socket.shutdown(Shutdown::Both);
                return Err(e);
            }
        };
        info!(
            %address,
            protocol = descriptor.version(),
            "connected to server"
        );

        let shared = Shared {
            config: config.clone(),
            descriptor,
            channel: Mutex::new(Channel {
                input,
                deferred: DeferredQueue::default(),
                auth,
                accept: Some(accept),
                attachment: AttachmentState::Detached,
                encryption: None,
            }),
            transmit: Mutex::new(output),
            encryption_plugins: self.encryption_plugins.clone(),
            db_crypt_callback: self.db_crypt_callback.clone(),
            warning_callback: self.warning_callback.clone(),
            socket,
            state: Mutex::new(ConnectionState::Connected),
        };
        Ok(Connection {
            shared: Arc::new(shared),
        })
    }
}

fn open_socket(config: &ConnectionConfig) -> Result<TcpStream, Error> {
    let address = config.address();
    let connect_error = |source| Error::Connect {
        addr: address.clone(),
        source,
    };
    let mut last_error = None;
    for addr in address.to_socket_addrs().map_err(connect_error)? {
        match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
            Ok(socket) => {
                socket.set_nodelay(true).map_err(connect_error)?;
                socket
                    .set_read_timeout(config.socket_timeout())
                    .map_err(connect_error)?;
                return Ok(socket);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(connect_error(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "host did not resolve")
    })))
}

/// Connects with the default plugins and callbacks.
pub fn connect(config: &ConnectionConfig) -> Result<Connection, Error> {
    Connector::new().connect(config)
}

/// A negotiated connection to a server.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.shared.config.address())
            .field("protocol", &self.shared.descriptor.version())
            .field("state", &self.shared.state())
            .finish()
    }
}

impl Connection {
    /// Completes authentication and, when possible, wire encryption.
    ///
    /// Credentials come from the configuration: the first plugin step
    /// already travels in the connect request. With protocol 13 and an
    /// `op_accept` reply, authentication finishes during attach instead.
    pub fn authenticate(&self) -> Result<(), Error> {
        let mut wire = self.shared.lock()?;
        match self.shared.state() {
            ConnectionState::Connected => {}
            ConnectionState::Ready => return Ok(()),
            other => {
                return Err(Error::handle_state(format!(
                    "cannot authenticate a connection in state {:?}",
                    other
                )))
            }
        }
        self.shared.set_state(ConnectionState::Authenticating);
        match handshake::authenticate(&mut wire) {
            Ok(()) => {
                self.shared.set_state(ConnectionState::Ready);
                Ok(())
            }
            Err(e) => {
                self.shared.mark_broken(&e);
                self.shared.close_socket();
                Err(e)
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn protocol_version(&self) -> u32 {
        self.shared.descriptor.version()
    }

    pub fn descriptor(&self) -> &'static ProtocolDescriptor {
        self.shared.descriptor
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// The wire encryption in use, if any.
    pub fn encryption(&self) -> Option<EncryptionIdentifier> {
        self.shared.channel.lock().encryption.clone()
    }

    /// A database handle bound to this connection.
    pub fn database(&self) -> Database {
        self.shared.descriptor.create_database(self.clone())
    }

    /// Sends a cancel request without waiting for the main lock.
    ///
    /// `Abort` closes the socket; the other kinds need protocol 12 or newer.
    pub fn cancel_operation(&self, kind: CancelKind) -> Result<(), Error> {
        if kind == CancelKind::Abort {
            info!("aborting connection");
            self.shared.abort();
            return Ok(());
        }
        self.shared.check_usable()?;
        let operations = self.shared.descriptor.create_wire_operations();
        let mut out = self.shared.transmit.lock();
        operations.write_cancel(&mut out, kind.wire_value())?;
        out.flush().map_err(|e| {
            let e = Error::from(e);
            self.shared.mark_broken(&e);
            e
        })
    }

    /// Disconnects without detaching.
    pub fn close(&self) {
        if let Ok(wire) = self.shared.lock() {
            let _ = wire.send(|out| out.write_i32(OP_DISCONNECT));
        }
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;
    use fbwire_protocol::ParameterBuffer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_connect_negotiates_highest_offered() {
        let server = FakeServer::start(|peer| {
            let request = peer.read_connect();
            assert_eq!(request.database, "test.fdb");
            assert_eq!(request.versions.len(), 3);
            // Offered in ascending weight order.
            assert_eq!(request.versions[0].0, PROTOCOL_VERSION10);
            assert_eq!(request.versions[2].0, PROTOCOL_VERSION12);
            assert_eq!(request.versions[2].2, PTYPE_LAZY_SEND);
            peer.accept(PROTOCOL_VERSION12, PTYPE_LAZY_SEND);
        });

        let config = server.config().with_protocol_versions(&[10, 11, 12]);
        let connection = connect(&config).unwrap();
        assert_eq!(connection.protocol_version(), 12);
        assert_eq!(connection.state(), ConnectionState::Connected);
        connection.authenticate().unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);
        server.join();
    }

    #[test]
    fn test_connect_rejects_unoffered_version() {
        let server = FakeServer::start(|peer| {
            peer.read_connect();
            peer.accept(PROTOCOL_VERSION13, PTYPE_LAZY_SEND);
        });
        let config = server.config().with_protocol_versions(&[10, 11]);
        assert!(matches!(connect(&config), Err(Error::Protocol(_))));
        server.join();
    }

    #[test]
    fn test_connect_rejected() {
        let server = FakeServer::start(|peer| {
            peer.read_connect();
            peer.output.write_i32(OP_REJECT);
            peer.output.flush().unwrap();
        });
        assert!(matches!(connect(&server.config()), Err(Error::Protocol(_))));
        server.join();
    }

    #[test]
    fn test_compression_not_requested() {
        let server = FakeServer::start(|peer| {
            let request = peer.read_connect();
            assert!(request.versions.iter().all(|v| v.2 & PFLAG_COMPRESS == 0));
            peer.accept(PROTOCOL_VERSION13, PTYPE_LAZY_SEND | PFLAG_COMPRESS);
        });
        assert!(matches!(connect(&server.config()), Err(Error::Protocol(_))));
        server.join();
    }

    #[test]
    fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let config = ConnectionConfig::new("127.0.0.1", "test.fdb").with_port(port);
        let err = connect(&config).unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
    }

    #[test]
    fn test_cancel_needs_v12() {
        let server = FakeServer::start(|peer| {
            peer.read_connect();
            peer.accept(PROTOCOL_VERSION11, PTYPE_LAZY_SEND);
        });
        let connection = connect(&server.config().with_protocol_versions(&[11])).unwrap();
        assert!(matches!(
            connection.cancel_operation(CancelKind::Raise),
            Err(Error::NotSupported { version: 11, .. })
        ));
        server.join();
    }

    #[test]
    fn test_cancel_while_waiting_for_response() {
        let server = FakeServer::start(|peer| {
            peer.handshake(PROTOCOL_VERSION12);
            peer.expect_op(OP_PING);
            // The cancel arrives while the ping is still unanswered.
            peer.expect_op(OP_CANCEL);
            assert_eq!(peer.input.read_i32().unwrap(), FB_CANCEL_RAISE);
            peer.error(335544794);
        });

        let connection = connect(&server.config()).unwrap();
        connection.authenticate().unwrap();
        let database = connection.database();
        database.attach(ParameterBuffer::dpb()).unwrap();

        let canceller = connection.clone();
        let pinger = std::thread::spawn(move || database.ping());
        std::thread::sleep(std::time::Duration::from_millis(100));
        canceller.cancel_operation(CancelKind::Raise).unwrap();

        let result = pinger.join().unwrap();
        assert_eq!(result.unwrap_err().server_code(), Some(335544794));
        assert_eq!(connection.state(), ConnectionState::Ready);
        server.join();
    }

    #[test]
    fn test_abort_fails_waiting_operation() {
        let server = FakeServer::start(|peer| {
            peer.handshake(PROTOCOL_VERSION13);
            peer.expect_op(OP_PING);
            // Never answer; wait for the client to go away.
            let _ = peer.input.read_i32();
        });

        let connection = connect(&server.config()).unwrap();
        connection.authenticate().unwrap();
        let database = connection.database();
        database.attach(ParameterBuffer::dpb()).unwrap();

        let aborter = connection.clone();
        let pinger = std::thread::spawn(move || database.ping());
        std::thread::sleep(std::time::Duration::from_millis(100));
        aborter.cancel_operation(CancelKind::Abort).unwrap();

        let err = pinger.join().unwrap().unwrap_err();
        assert!(err.is_io() || matches!(err, Error::ConnectionBroken(_)));
        assert!(matches!(connection.state(), ConnectionState::Error(_)));
        assert!(matches!(
            connection.database().ping(),
            Err(Error::ConnectionBroken(_))
        ));
        server.join();
    }

    #[test]
    fn test_server_warnings_reach_callback() {
        struct Counting(AtomicUsize);
        impl WarningCallback for Counting {
            fn process_warning(&self, warning: &ServerError) {
                assert_eq!(warning.code, 335544807);
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let server = FakeServer::start(|peer| {
            peer.handshake(PROTOCOL_VERSION13);
            peer.expect_op(OP_PING);
            peer.warning(335544807);
        });

        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let connection = Connector::new()
            .with_warning_callback(counter.clone())
            .connect(&server.config())
            .unwrap();
        connection.authenticate().unwrap();
        let database = connection.database();
        database.attach(ParameterBuffer::dpb()).unwrap();
        database.ping().unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        server.join();
    }
}
