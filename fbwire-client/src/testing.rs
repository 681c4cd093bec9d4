//! Scripted in-process server for exercising the client over real sockets.

use crate::config::ConnectionConfig;
use fbwire_protocol::consts::*;
use fbwire_protocol::{XdrReader, XdrWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct FakeServer {
    address: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl FakeServer {
    /// Accepts one connection and runs `script` against it.
    pub(crate) fn start<F>(script: F) -> Self
    where
        F: FnOnce(&mut Peer) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            socket.set_read_timeout(Some(TIMEOUT)).unwrap();
            let mut peer = Peer {
                input: XdrReader::new(socket.try_clone().unwrap()),
                output: XdrWriter::new(socket),
            };
            script(&mut peer);
        });
        Self {
            address,
            handle: Some(handle),
        }
    }

    pub(crate) fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", "test.fdb")
            .with_port(self.address.port())
            .with_credentials("sysdba", "masterkey")
            .with_socket_timeout(TIMEOUT)
    }

    /// Waits for the script, re-raising its assertion failures.
    pub(crate) fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

/// Decoded `op_connect`.
pub(crate) struct ConnectRequest {
    pub(crate) database: String,
    pub(crate) user_id: Vec<u8>,
    /// (wire version, architecture, max type, weight) per offered version.
    pub(crate) versions: Vec<(i32, i32, i32, i32)>,
}

/// The server end of one connection.
pub(crate) struct Peer {
    pub(crate) input: XdrReader<TcpStream>,
    pub(crate) output: XdrWriter<TcpStream>,
}

impl Peer {
    pub(crate) fn expect_op(&mut self, operation: i32) {
        assert_eq!(self.input.read_operation().unwrap(), operation);
    }

    pub(crate) fn read_i32(&mut self) -> i32 {
        self.input.read_i32().unwrap()
    }

    pub(crate) fn read_connect(&mut self) -> ConnectRequest {
        self.expect_op(OP_CONNECT);
        assert_eq!(self.read_i32(), OP_ATTACH);
        assert_eq!(self.read_i32(), CONNECT_VERSION3);
        assert_eq!(self.read_i32(), ARCH_GENERIC);
        let database = self.input.read_string().unwrap();
        let count = self.read_i32();
        let user_id = self.input.read_buffer().unwrap().to_vec();
        let versions = (0..count)
            .map(|_| {
                let version = self.read_i32();
                let architecture = self.read_i32();
                let _min_type = self.read_i32();
                let max_type = self.read_i32();
                let weight = self.read_i32();
                (version, architecture, max_type, weight)
            })
            .collect();
        ConnectRequest {
            database,
            user_id,
            versions,
        }
    }

    pub(crate) fn accept(&mut self, version: i32, accept_type: i32) {
        self.output.write_i32(OP_ACCEPT);
        self.output.write_i32(version);
        self.output.write_i32(ARCH_GENERIC);
        self.output.write_i32(accept_type);
        self.output.flush().unwrap();
    }

    pub(crate) fn cond_accept(
        &mut self,
        version: i32,
        data: &[u8],
        plugin: &str,
        authenticated: bool,
        keys: &[u8],
    ) {
        self.output.write_i32(OP_COND_ACCEPT);
        self.output.write_i32(version);
        self.output.write_i32(ARCH_GENERIC);
        self.output.write_i32(PTYPE_LAZY_SEND);
        self.output.write_buffer(data);
        self.output.write_string(plugin);
        self.output.write_i32(authenticated as i32);
        self.output.write_buffer(keys);
        self.output.flush().unwrap();
    }

    /// Accepts `version`, then answers a plain attach with handle 1.
    pub(crate) fn handshake(&mut self, version: i32) {
        self.read_connect();
        let accept_type = if version == PROTOCOL_VERSION10 {
            PTYPE_BATCH_SEND
        } else {
            PTYPE_LAZY_SEND
        };
        self.accept(version, accept_type);
        self.expect_op(OP_ATTACH);
        assert_eq!(self.read_i32(), 0);
        self.input.skip_buffer().unwrap();
        self.input.skip_buffer().unwrap();
        self.ok(1);
    }

    /// Reads a request made of an operation and `args` integers.
    pub(crate) fn expect_request(&mut self, operation: i32, args: &[i32]) {
        self.expect_op(operation);
        for arg in args {
            assert_eq!(self.read_i32(), *arg);
        }
    }

    pub(crate) fn write_response(&mut self, handle: i32, blob_id: i64, data: &[u8], status: &[i32]) {
        self.output.write_i32(OP_RESPONSE);
        self.output.write_i32(handle);
        self.output.write_i64(blob_id);
        self.output.write_buffer(data);
        for value in status {
            self.output.write_i32(*value);
        }
        self.output.write_i32(ISC_ARG_END);
        self.output.flush().unwrap();
    }

    pub(crate) fn ok(&mut self, handle: i32) {
        self.write_response(handle, 0, &[], &[]);
    }

    pub(crate) fn response(&mut self, handle: i32, data: &[u8]) {
        self.write_response(handle, 0, data, &[]);
    }

    pub(crate) fn error(&mut self, code: i32) {
        self.write_response(0, 0, &[], &[ISC_ARG_GDS, code]);
    }

    pub(crate) fn warning(&mut self, code: i32) {
        self.write_response(0, 0, &[], &[ISC_ARG_WARNING, code]);
    }
}
