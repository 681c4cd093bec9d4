//! Blob handles.
//!
//! On lazy-send protocols `open` only records the intent. The first
//! operation that needs the server handle writes the open request together
//! with an info request for the commonly asked items (both deferred), then
//! drains the queue; the info reply answers later `get_info` calls for
//! those items without another round trip.

use crate::connection::Shared;
use crate::database::upgrade;
use crate::deferred::{DeferredAction, PendingResponse};
use crate::descriptor::ProtocolDescriptor;
use crate::error::Error;
use crate::info::InfoItems;
use crate::wire::Wire;
use bytes::{Buf, Bytes, BytesMut};
use fbwire_protocol::consts::*;
use fbwire_protocol::{ParameterBuffer, Response};
use std::fmt;
use std::sync::Weak;
use tracing::{debug, trace};

/// Largest segment transferred by one request.
pub const MAX_SEGMENT_SIZE: usize = 32765;

/// Items requested alongside a deferred open.
const KNOWN_INFO_ITEMS: &[u8] = &[
    ISC_INFO_BLOB_NUM_SEGMENTS,
    ISC_INFO_BLOB_MAX_SEGMENT,
    ISC_INFO_BLOB_TOTAL_LENGTH,
    ISC_INFO_BLOB_TYPE,
];

const KNOWN_INFO_SIZE: i32 = 64;

/// `get_segment` reply handle: the buffer ends inside a segment.
const SEGMENT_INCOMPLETE: i32 = 1;
/// `get_segment` reply handle: no more data.
const SEGMENT_EOF: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobState {
    Closed,
    /// Open requested, nothing sent yet.
    DelayedOpen,
    /// Open written as a deferred request, reply not processed yet.
    PendingOpen,
    Open,
    Error,
}

enum OpenState {
    Closed,
    DelayedOpen,
    PendingOpen {
        open: PendingResponse,
        info: PendingResponse,
    },
    Open {
        handle: i32,
    },
    Error,
}

impl OpenState {
    fn public(&self) -> BlobState {
        match self {
            OpenState::Closed => BlobState::Closed,
            OpenState::DelayedOpen => BlobState::DelayedOpen,
            OpenState::PendingOpen { .. } => BlobState::PendingOpen,
            OpenState::Open { .. } => BlobState::Open,
            OpenState::Error => BlobState::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Absolute = 0,
    Relative = 1,
    FromTail = 2,
}

/// A blob being read (input) or written (output).
pub struct Blob {
    database: Weak<Shared>,
    descriptor: &'static ProtocolDescriptor,
    transaction: i32,
    /// Zero for an output blob until the server assigns the id.
    blob_id: i64,
    output: bool,
    bpb: Option<ParameterBuffer>,
    state: OpenState,
    eof: bool,
    known_info: InfoItems,
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("blob_id", &self.blob_id)
            .field("output", &self.output)
            .field("state", &self.state())
            .field("eof", &self.eof)
            .finish()
    }
}

impl Blob {
    pub(crate) fn input(
        database: Weak<Shared>,
        descriptor: &'static ProtocolDescriptor,
        transaction: i32,
        blob_id: i64,
        bpb: Option<ParameterBuffer>,
    ) -> Self {
        Self::new(database, descriptor, transaction, blob_id, false, bpb)
    }

    pub(crate) fn output(
        database: Weak<Shared>,
        descriptor: &'static ProtocolDescriptor,
        transaction: i32,
        bpb: Option<ParameterBuffer>,
    ) -> Self {
        Self::new(database, descriptor, transaction, 0, true, bpb)
    }

    fn new(
        database: Weak<Shared>,
        descriptor: &'static ProtocolDescriptor,
        transaction: i32,
        blob_id: i64,
        output: bool,
        bpb: Option<ParameterBuffer>,
    ) -> Self {
        Self {
            database,
            descriptor,
            transaction,
            blob_id,
            output,
            bpb,
            state: OpenState::Closed,
            eof: false,
            known_info: InfoItems::default(),
        }
    }

    /// The blob id; for an output blob only known once it was opened.
    pub fn blob_id(&self) -> i64 {
        self.blob_id
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn state(&self) -> BlobState {
        self.state.public()
    }

    fn set_state(&mut self, state: OpenState) {
        let (from, to) = (self.state.public(), state.public());
        if from != to {
            debug!(blob_id = self.blob_id, "blob state: {:?} -> {:?}", from, to);
        }
        self.state = state;
    }

    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            self.set_state(OpenState::Error);
        }
        err
    }

    fn exchange<T>(&mut self, f: impl FnOnce(&mut Wire<'_>) -> Result<T, Error>) -> Result<T, Error> {
        let result = upgrade(&self.database).and_then(|shared| {
            let mut wire = shared.lock()?;
            f(&mut wire)
        });
        result.map_err(|e| self.fail(e))
    }

    fn open_operation(&self) -> i32 {
        if self.output {
            OP_CREATE_BLOB2
        } else {
            OP_OPEN_BLOB2
        }
    }

    /// Opens (input) or creates (output) the blob.
    pub fn open(&mut self) -> Result<(), Error> {
        if !matches!(self.state, OpenState::Closed) {
            return Err(Error::handle_state(format!(
                "cannot open a blob in state {:?}",
                self.state()
            )));
        }
        if self.output && self.blob_id != 0 {
            return Err(Error::handle_state("output blob was already created"));
        }
        self.eof = false;
        self.known_info = InfoItems::default();

        if self.descriptor.capabilities().lazy_send {
            self.set_state(OpenState::DelayedOpen);
            return Ok(());
        }

        let bpb = self.bpb_bytes()?;
        let (operation, transaction, blob_id) = (self.open_operation(), self.transaction, self.blob_id);
        let response = self.exchange(|wire| {
            wire.send(|out| {
                out.write_i32(operation);
                out.write_opt_buffer(bpb.as_deref());
                out.write_i32(transaction);
                out.write_i64(blob_id);
            })?;
            wire.read_generic_response()
        })?;
        if self.output {
            self.blob_id = response.blob_id;
        }
        self.set_state(OpenState::Open {
            handle: response.object_handle,
        });
        Ok(())
    }

    fn bpb_bytes(&self) -> Result<Option<Vec<u8>>, Error> {
        match &self.bpb {
            Some(bpb) if !bpb.is_empty() => Ok(Some(bpb.to_bytes()?)),
            _ => Ok(None),
        }
    }

    /// Writes the deferred open and known-info requests.
    fn send_open(&mut self) -> Result<(), Error> {
        let bpb = self.bpb_bytes()?;
        let (operation, transaction, blob_id) = (self.open_operation(), self.transaction, self.blob_id);
        let (open, info) = self.exchange(|wire| {
            wire.write(|out| {
                out.write_i32(operation);
                out.write_opt_buffer(bpb.as_deref());
                out.write_i32(transaction);
                out.write_i64(blob_id);

                out.write_i32(OP_INFO_BLOB);
                out.write_i32(INVALID_OBJECT);
                out.write_i32(0);
                out.write_buffer(KNOWN_INFO_ITEMS);
                out.write_i32(KNOWN_INFO_SIZE);
            });
            let (open_action, open) = DeferredAction::with_slot("open blob");
            let (info_action, info) = DeferredAction::with_slot("blob info");
            wire.enqueue(open_action);
            wire.enqueue(info_action);
            Ok((open, info))
        })?;
        self.set_state(OpenState::PendingOpen { open, info });
        Ok(())
    }

    /// Returns the server handle, completing a deferred open first.
    fn complete_pending_open(&mut self) -> Result<i32, Error> {
        match self.state {
            OpenState::Open { handle } => return Ok(handle),
            OpenState::Closed => return Err(Error::handle_state("blob is not open")),
            OpenState::Error => return Err(Error::handle_state("blob is in error state")),
            OpenState::DelayedOpen => self.send_open()?,
            OpenState::PendingOpen { .. } => {}
        }

        self.exchange(|wire| wire.drain_synchronously())?;
        let OpenState::PendingOpen { open, info } =
            std::mem::replace(&mut self.state, OpenState::Error)
        else {
            return Err(Error::handle_state("blob open was not pending"));
        };

        let response = match open.take() {
            Some(Ok(Response::Generic(response))) => response,
            Some(Ok(other)) => {
                return Err(Error::protocol(format!(
                    "unexpected reply to blob open: {:?}",
                    other
                )))
            }
            Some(Err(e)) => {
                if !e.is_fatal() {
                    self.set_state(OpenState::Closed);
                }
                return Err(e);
            }
            None => return Err(Error::protocol("deferred blob open was never answered")),
        };

        match info.take() {
            Some(Ok(Response::Generic(reply))) => match InfoItems::parse(&reply.data) {
                Ok(items) => self.known_info = items,
                Err(e) => debug!("ignoring unparseable blob info: {}", e),
            },
            Some(Ok(_)) | None => {}
            Some(Err(e)) => debug!("blob info alongside open failed: {}", e),
        }

        if self.output {
            self.blob_id = response.blob_id;
        }
        trace!(handle = response.object_handle, blob_id = self.blob_id, "deferred blob open completed");
        self.set_state(OpenState::Open {
            handle: response.object_handle,
        });
        Ok(response.object_handle)
    }

    /// Reads up to `max_len` bytes (at most [`MAX_SEGMENT_SIZE`]); `None`
    /// once the end of the blob was reached.
    pub fn read(&mut self, max_len: usize) -> Result<Option<Bytes>, Error> {
        if self.output {
            return Err(Error::handle_state("cannot read an output blob"));
        }
        let handle = self.complete_pending_open()?;
        if self.eof {
            return Ok(None);
        }
        let requested = max_len.clamp(1, MAX_SEGMENT_SIZE);
        let response = self.exchange(|wire| {
            wire.send(|out| {
                out.write_i32(OP_GET_SEGMENT);
                out.write_i32(handle);
                out.write_i32(requested as i32);
                out.write_opt_buffer(None);
            })?;
            wire.read_generic_response()
        })?;

        let data = join_segments(response.data)?;
        match response.object_handle {
            SEGMENT_EOF => self.eof = true,
            SEGMENT_INCOMPLETE => trace!(handle, "segment continues in the next read"),
            _ => {}
        }
        if data.is_empty() && self.eof {
            Ok(None)
        } else {
            Ok(Some(data))
        }
    }

    /// Reads the remaining content.
    pub fn read_to_end(&mut self) -> Result<Bytes, Error> {
        let mut content = BytesMut::new();
        while let Some(chunk) = self.read(MAX_SEGMENT_SIZE)? {
            content.extend_from_slice(&chunk);
        }
        Ok(content.freeze())
    }

    /// Appends `data`, split into segments of at most [`MAX_SEGMENT_SIZE`].
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if !self.output {
            return Err(Error::handle_state("cannot write an input blob"));
        }
        let handle = self.complete_pending_open()?;
        if data.is_empty() {
            return Ok(());
        }
        self.known_info = InfoItems::default();
        self.exchange(|wire| {
            let mut segments = 0;
            wire.write(|out| {
                for chunk in data.chunks(MAX_SEGMENT_SIZE) {
                    out.write_i32(OP_PUT_SEGMENT);
                    out.write_i32(handle);
                    out.write_i32(chunk.len() as i32);
                    out.write_buffer(chunk);
                    segments += 1;
                }
            });
            wire.flush()?;
            // Every reply is consumed before the first failure is reported.
            let mut first_error = None;
            for _ in 0..segments {
                if let Err(e) = wire.read_generic_response() {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }

    /// Moves the read position of a stream blob; returns the new position.
    pub fn seek(&mut self, mode: SeekMode, offset: i32) -> Result<i64, Error> {
        if self.output {
            return Err(Error::handle_state("cannot seek in an output blob"));
        }
        let handle = self.complete_pending_open()?;
        let response = self.exchange(|wire| {
            wire.send(|out| {
                out.write_i32(OP_SEEK_BLOB);
                out.write_i32(handle);
                out.write_i32(mode as i32);
                out.write_i32(offset);
            })?;
            wire.read_generic_response()
        })?;
        self.eof = false;
        Ok(response.object_handle as i64)
    }

    /// Requests blob info items, answering from the values received with
    /// the open when all of them are known.
    pub fn get_info(&mut self, items: &[u8], max_len: usize) -> Result<Bytes, Error> {
        let handle = self.complete_pending_open()?;
        if !self.known_info.is_truncated() && self.known_info.contains_all(items) {
            trace!(handle, "blob info answered from cache");
            return Ok(Bytes::from(self.known_info.encode(items)));
        }
        self.exchange(|wire| {
            wire.send(|out| {
                out.write_i32(OP_INFO_BLOB);
                out.write_i32(handle);
                out.write_i32(0);
                out.write_buffer(items);
                out.write_i32(max_len as i32);
            })?;
            Ok(wire.read_generic_response()?.data)
        })
    }

    /// Total length in bytes.
    pub fn length(&mut self) -> Result<i64, Error> {
        let data = self.get_info(&[ISC_INFO_BLOB_TOTAL_LENGTH], 16)?;
        InfoItems::parse(&data)?
            .get_int(ISC_INFO_BLOB_TOTAL_LENGTH)
            .ok_or_else(|| Error::protocol("blob info lacks isc_info_blob_total_length"))
    }

    /// Closes the blob; an output blob keeps its content.
    pub fn close(&mut self) -> Result<(), Error> {
        self.release(OP_CLOSE_BLOB, "close blob")
    }

    /// Closes the blob; an output blob is discarded.
    pub fn cancel(&mut self) -> Result<(), Error> {
        self.release(OP_CANCEL_BLOB, "cancel blob")
    }

    fn release(&mut self, operation: i32, description: &'static str) -> Result<(), Error> {
        match self.state {
            OpenState::Closed => return Ok(()),
            OpenState::Error => return Err(Error::handle_state("blob is in error state")),
            OpenState::DelayedOpen => {
                self.set_state(OpenState::Closed);
                return Ok(());
            }
            OpenState::PendingOpen { .. } | OpenState::Open { .. } => {}
        }
        let handle = match self.complete_pending_open() {
            Ok(handle) => handle,
            Err(e) if matches!(self.state, OpenState::Closed) => {
                debug!("blob open failed before {}: {}", description, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let lazy = self.descriptor.capabilities().lazy_send;
        self.exchange(|wire| {
            wire.write(|out| {
                out.write_i32(operation);
                out.write_i32(handle);
            });
            if lazy {
                wire.enqueue(DeferredAction::new(description, |_| {}));
                Ok(())
            } else {
                wire.flush()?;
                wire.read_generic_response().map(drop)
            }
        })?;
        self.set_state(OpenState::Closed);
        Ok(())
    }
}

/// Concatenates the `u16` little-endian length-prefixed segments of a
/// `get_segment` reply.
fn join_segments(mut data: Bytes) -> Result<Bytes, Error> {
    let mut content = BytesMut::with_capacity(data.len());
    while data.has_remaining() {
        if data.remaining() < 2 {
            return Err(Error::protocol("truncated segment length"));
        }
        let len = data.get_u16_le() as usize;
        if data.remaining() < len {
            return Err(Error::protocol(format!(
                "segment of {} bytes exceeds the {} remaining",
                len,
                data.remaining()
            )));
        }
        content.extend_from_slice(&data.split_to(len));
    }
    Ok(content.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::connect;
    use crate::database::Database;
    use crate::testing::{FakeServer, Peer};
    use crate::transaction::Transaction;

    const BLOB_ID: i64 = 0x0000_0081_0000_0002;

    fn start_transaction(peer: &mut Peer, version: i32) {
        peer.handshake(version);
        peer.expect_op(OP_TRANSACTION);
        peer.read_i32();
        peer.input.skip_buffer().unwrap();
        peer.ok(5);
    }

    fn open(server: &FakeServer) -> (Database, Transaction) {
        let connection = connect(&server.config()).unwrap();
        connection.authenticate().unwrap();
        let database = connection.database();
        database.attach(ParameterBuffer::dpb()).unwrap();
        let transaction = database.start_transaction(&ParameterBuffer::tpb()).unwrap();
        (database, transaction)
    }

    fn segments(parts: &[&[u8]]) -> Vec<u8> {
        let mut data = Vec::new();
        for part in parts {
            data.extend_from_slice(&(part.len() as u16).to_le_bytes());
            data.extend_from_slice(part);
        }
        data
    }

    #[test]
    fn test_join_segments() {
        let data = Bytes::from(segments(&[b"ab", b"", b"cde"]));
        assert_eq!(&join_segments(data).unwrap()[..], b"abcde");
        assert!(join_segments(Bytes::from_static(&[5, 0, 1])).is_err());
        assert!(join_segments(Bytes::from_static(&[5])).is_err());
    }

    #[test]
    fn test_deferred_open_with_known_info() {
        let server = FakeServer::start(|peer| {
            start_transaction(peer, PROTOCOL_VERSION13);
            // A single open, pipelined with the info request.
            peer.expect_request(OP_OPEN_BLOB2, &[0, 5]);
            assert_eq!(peer.input.read_i64().unwrap(), BLOB_ID);
            peer.expect_request(OP_INFO_BLOB, &[INVALID_OBJECT, 0]);
            assert_eq!(&peer.input.read_buffer().unwrap()[..], KNOWN_INFO_ITEMS);
            peer.read_i32();
            peer.ok(9);
            let mut info = vec![ISC_INFO_BLOB_TOTAL_LENGTH, 4, 0];
            info.extend_from_slice(&7u32.to_le_bytes());
            info.extend_from_slice(&[ISC_INFO_BLOB_NUM_SEGMENTS, 4, 0, 2, 0, 0, 0, ISC_INFO_END]);
            peer.response(0, &info);

            peer.expect_request(OP_GET_SEGMENT, &[9, MAX_SEGMENT_SIZE as i32, 0]);
            peer.write_response(0, 0, &segments(&[b"hello"]), &[]);
            peer.expect_request(OP_GET_SEGMENT, &[9, MAX_SEGMENT_SIZE as i32, 0]);
            peer.write_response(SEGMENT_EOF, 0, &segments(&[b", w"]), &[]);

            peer.expect_request(OP_SEEK_BLOB, &[9, SeekMode::Absolute as i32, 0]);
            peer.ok(0);

            peer.expect_request(OP_CLOSE_BLOB, &[9]);
            peer.expect_op(OP_PING);
            peer.ok(0);
            peer.ok(0);
        });

        let (database, transaction) = open(&server);
        let mut blob = database.open_blob(&transaction, BLOB_ID, None);
        blob.open().unwrap();
        assert_eq!(blob.state(), BlobState::DelayedOpen);

        assert_eq!(blob.length().unwrap(), 7);
        assert_eq!(blob.state(), BlobState::Open);
        let info = InfoItems::parse(&blob.get_info(&[ISC_INFO_BLOB_NUM_SEGMENTS], 16).unwrap()).unwrap();
        assert_eq!(info.get_int(ISC_INFO_BLOB_NUM_SEGMENTS), Some(2));

        assert_eq!(&blob.read_to_end().unwrap()[..], b"hello, w");
        assert!(blob.is_eof());
        assert_eq!(blob.read(100).unwrap(), None);
        assert_eq!(blob.seek(SeekMode::Absolute, 0).unwrap(), 0);
        assert!(!blob.is_eof());

        blob.close().unwrap();
        assert_eq!(blob.state(), BlobState::Closed);
        database.ping().unwrap();
        server.join();
    }

    #[test]
    fn test_output_blob_on_v10() {
        let server = FakeServer::start(|peer| {
            start_transaction(peer, PROTOCOL_VERSION10);
            peer.expect_op(OP_CREATE_BLOB2);
            let bpb = peer.input.read_buffer().unwrap();
            assert_eq!(&bpb[..], &[ISC_BPB_VERSION1, ISC_BPB_TYPE, 1, ISC_BPB_TYPE_STREAM]);
            assert_eq!(peer.read_i32(), 5);
            assert_eq!(peer.input.read_i64().unwrap(), 0);
            peer.write_response(4, BLOB_ID, &[], &[]);

            peer.expect_request(OP_PUT_SEGMENT, &[4, MAX_SEGMENT_SIZE as i32]);
            assert_eq!(peer.input.read_buffer().unwrap().len(), MAX_SEGMENT_SIZE);
            peer.expect_request(OP_PUT_SEGMENT, &[4, 7235]);
            assert_eq!(peer.input.read_buffer().unwrap().len(), 7235);
            peer.ok(0);
            peer.ok(0);

            peer.expect_request(OP_CLOSE_BLOB, &[4]);
            peer.ok(0);
        });

        let (database, transaction) = open(&server);
        let mut bpb = ParameterBuffer::bpb();
        bpb.add_byte(ISC_BPB_TYPE, ISC_BPB_TYPE_STREAM);
        let mut blob = database.create_blob(&transaction, Some(bpb));
        assert!(matches!(blob.write(b"x"), Err(Error::HandleState(_))));
        blob.open().unwrap();
        assert_eq!(blob.state(), BlobState::Open);
        assert_eq!(blob.blob_id(), BLOB_ID);
        assert!(matches!(blob.read(10), Err(Error::HandleState(_))));

        blob.write(&vec![7u8; 40000]).unwrap();
        blob.close().unwrap();
        assert_eq!(blob.state(), BlobState::Closed);
        assert!(matches!(blob.open(), Err(Error::HandleState(_))));
        server.join();
    }

    #[test]
    fn test_failed_deferred_open() {
        let server = FakeServer::start(|peer| {
            start_transaction(peer, PROTOCOL_VERSION13);
            peer.expect_request(OP_OPEN_BLOB2, &[0, 5]);
            peer.input.read_i64().unwrap();
            peer.expect_request(OP_INFO_BLOB, &[INVALID_OBJECT, 0]);
            peer.input.skip_buffer().unwrap();
            peer.read_i32();
            peer.error(335544329);
            peer.error(335544328);

            // The never used blob costs nothing.
            peer.expect_op(OP_PING);
            peer.ok(0);
        });

        let (database, transaction) = open(&server);
        let mut blob = database.open_blob(&transaction, 1, None);
        blob.open().unwrap();
        let err = blob.read(10).unwrap_err();
        assert_eq!(err.server_code(), Some(335544329));
        assert_eq!(blob.state(), BlobState::Closed);

        let mut unused = database.open_blob(&transaction, 2, None);
        unused.open().unwrap();
        unused.close().unwrap();
        assert_eq!(unused.state(), BlobState::Closed);
        database.ping().unwrap();
        server.join();
    }
}
