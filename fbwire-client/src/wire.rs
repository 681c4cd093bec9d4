//! Request/response plumbing under the connection's main lock.

use crate::config::ConnectionConfig;
use crate::connection::{AttachmentState, Channel, Shared};
use crate::crypt::{CipherPair, EncryptionIdentifier};
use crate::deferred::DeferredAction;
use crate::descriptor::ProtocolDescriptor;
use crate::error::{Error, ServerError};
use fbwire_protocol::consts::*;
use fbwire_protocol::{GenericResponse, ProtocolError, Response, XdrReader, XdrWriter};
use parking_lot::MutexGuard;
use std::net::TcpStream;
use tracing::{debug, warn};

/// Exclusive access to a connection for one exchange.
pub(crate) struct Wire<'a> {
    shared: &'a Shared,
    pub(crate) channel: MutexGuard<'a, Channel>,
}

impl<'a> Wire<'a> {
    pub(crate) fn new(shared: &'a Shared, channel: MutexGuard<'a, Channel>) -> Self {
        Self { shared, channel }
    }

    pub(crate) fn shared(&self) -> &'a Shared {
        self.shared
    }

    pub(crate) fn descriptor(&self) -> &'static ProtocolDescriptor {
        self.shared.descriptor
    }

    pub(crate) fn config(&self) -> &'a ConnectionConfig {
        &self.shared.config
    }

    /// Passes `err` through, breaking the connection if it is fatal.
    pub(crate) fn fail(&self, err: Error) -> Error {
        if err.is_fatal() {
            self.shared.mark_broken(&err);
        }
        err
    }

    /// Buffers a request under the transmit lock.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&mut XdrWriter<TcpStream>) -> T) -> T {
        f(&mut self.shared.transmit.lock())
    }

    pub(crate) fn flush(&self) -> Result<(), Error> {
        self.shared
            .transmit
            .lock()
            .flush()
            .map_err(|e| self.fail(e.into()))
    }

    /// Buffers a request and flushes it.
    pub(crate) fn send<T>(&self, f: impl FnOnce(&mut XdrWriter<TcpStream>) -> T) -> Result<T, Error> {
        let mut out = self.shared.transmit.lock();
        let value = f(&mut out);
        out.flush().map_err(|e| self.fail(e.into()))?;
        Ok(value)
    }

    /// Reads from the input stream, breaking the connection on failure.
    pub(crate) fn read<T>(
        &mut self,
        f: impl FnOnce(&mut XdrReader<TcpStream>) -> Result<T, ProtocolError>,
    ) -> Result<T, Error> {
        let result = f(&mut self.channel.input);
        result.map_err(|e| self.fail(e.into()))
    }

    pub(crate) fn read_operation(&mut self) -> Result<i32, Error> {
        self.read(|input| input.read_operation())
    }

    /// Handle of the attached database.
    pub(crate) fn database_handle(&self) -> Result<i32, Error> {
        match self.channel.attachment {
            AttachmentState::Attached { handle } => Ok(handle),
            AttachmentState::Detached => Err(Error::handle_state("database is not attached")),
            AttachmentState::Closed => Err(Error::handle_state("database is detached")),
        }
    }

    /// Reads the next response, after processing every deferred one.
    pub(crate) fn read_response(&mut self) -> Result<Response, Error> {
        self.process_deferred();
        self.shared.check_usable()?;
        self.read_response_direct()
    }

    fn read_response_direct(&mut self) -> Result<Response, Error> {
        let response = self.read(Response::read)?;
        match response {
            Response::Generic(generic) => self.check_status(generic).map(Response::Generic),
            other => Ok(other),
        }
    }

    pub(crate) fn read_generic_response(&mut self) -> Result<GenericResponse, Error> {
        match self.read_response()? {
            Response::Generic(response) => Ok(response),
            other => Err(self.fail(Error::protocol(format!(
                "expected op_response, got {:?}",
                other
            )))),
        }
    }

    /// Reads the body of an `op_response` whose operation code was read.
    pub(crate) fn read_generic_body(&mut self) -> Result<GenericResponse, Error> {
        let response = self.read(GenericResponse::read)?;
        self.check_status(response)
    }

    /// Routes warnings to the callback and turns errors into `Err`.
    fn check_status(&self, response: GenericResponse) -> Result<GenericResponse, Error> {
        for warning in response.status.warnings() {
            self.shared
                .warning_callback
                .process_warning(&ServerError::from_warning(warning));
        }
        match ServerError::from_status(&response.status) {
            Some(err) => Err(Error::Server(err)),
            None => Ok(response),
        }
    }

    pub(crate) fn enqueue(&mut self, action: DeferredAction) {
        debug!(action = action.description(), "deferring response");
        self.channel.deferred.push(action);
    }

    /// Reads the responses of all deferred requests in FIFO order.
    ///
    /// Failures are handed to the action and logged, never returned.
    pub(crate) fn process_deferred(&mut self) {
        if self.channel.deferred.is_empty() {
            return;
        }
        if let Err(e) = self.flush() {
            warn!("flushing deferred requests failed: {}", e);
        }
        while let Some(action) = self.channel.deferred.pop() {
            let result = match self.shared.check_usable() {
                Ok(()) => self.read_response_direct(),
                Err(e) => Err(e),
            };
            if let Err(ref e) = result {
                warn!(action = action.description(), "deferred operation failed: {}", e);
            }
            action.complete(result);
        }
    }

    /// Forces every deferred response to arrive, sending a ping when a
    /// queued request is only answered after a later round trip.
    pub(crate) fn drain_synchronously(&mut self) -> Result<(), Error> {
        if self.channel.deferred.is_empty() {
            return Ok(());
        }
        let ping = self.channel.deferred.requires_sync();
        if ping {
            self.write(|out| out.write_i32(OP_PING));
        }
        self.flush()?;
        self.process_deferred();
        if ping {
            self.read_generic_response()?;
        }
        Ok(())
    }

    /// Answers an `op_crypt_key_callback` whose operation code was read.
    pub(crate) fn answer_crypt_callback(&mut self) -> Result<(), Error> {
        let operations = self.shared.descriptor.create_wire_operations();
        let callback = self.shared.db_crypt_callback.as_ref();
        let mut out = self.shared.transmit.lock();
        operations
            .answer_crypt_callback(&mut self.channel.input, &mut out, callback)
            .map_err(|e| self.fail(e))
    }

    /// Sends `op_crypt`, installs both ciphers and reads the acknowledgement.
    pub(crate) fn enable_encryption(
        &mut self,
        identifier: &EncryptionIdentifier,
        ciphers: CipherPair,
    ) -> Result<(), Error> {
        {
            let mut out = self.shared.transmit.lock();
            out.write_i32(OP_CRYPT);
            out.write_string(&identifier.plugin_name);
            out.write_string(&identifier.key_type);
            out.flush().map_err(|e| self.fail(e.into()))?;
            out.set_cipher(ciphers.encrypt)
                .map_err(|e| self.fail(e.into()))?;
            self.channel.input.set_cipher(ciphers.decrypt);
        }
        self.read_generic_response()?;
        self.channel.encryption = Some(identifier.clone());
        Ok(())
    }
}
