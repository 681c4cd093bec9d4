//! Transactions.

use crate::connection::Shared;
use crate::database::upgrade;
use crate::descriptor::ProtocolDescriptor;
use crate::error::Error;
use bytes::Bytes;
use fbwire_protocol::clumplet::{InfoItem, InfoReader};
use fbwire_protocol::consts::*;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Weak;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    /// First phase of a two-phase commit done.
    Prepared,
    Committed,
    RolledBack,
    Error,
}

/// A server transaction.
pub struct Transaction {
    database: Weak<Shared>,
    descriptor: &'static ProtocolDescriptor,
    handle: i32,
    state: Mutex<TransactionState>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("handle", &self.handle)
            .field("state", &self.state())
            .field("protocol", &self.descriptor.version())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        database: Weak<Shared>,
        descriptor: &'static ProtocolDescriptor,
        handle: i32,
    ) -> Self {
        Self {
            database,
            descriptor,
            handle,
            state: Mutex::new(TransactionState::Active),
        }
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(handle = self.handle, "transaction state: {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn require(&self, allowed: &[TransactionState], action: &str) -> Result<(), Error> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(Error::handle_state(format!(
                "cannot {} a transaction in state {:?}",
                action, state
            )))
        }
    }

    /// Sends `operation` for this transaction and moves to `next` on success.
    fn simple_request(
        &self,
        operation: i32,
        message: Option<&[u8]>,
        next: TransactionState,
    ) -> Result<(), Error> {
        let result = upgrade(&self.database).and_then(|shared| {
            let mut wire = shared.lock()?;
            wire.send(|out| {
                out.write_i32(operation);
                out.write_i32(self.handle);
                if let Some(message) = message {
                    out.write_buffer(message);
                }
            })?;
            wire.read_generic_response().map(drop)
        });
        match result {
            Ok(()) => {
                self.set_state(next);
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    self.set_state(TransactionState::Error);
                }
                Err(e)
            }
        }
    }

    pub fn commit(&self) -> Result<(), Error> {
        use TransactionState::*;
        self.require(&[Active, Prepared], "commit")?;
        self.simple_request(OP_COMMIT, None, Committed)
    }

    /// Commits and keeps the transaction context open.
    pub fn commit_retaining(&self) -> Result<(), Error> {
        self.require(&[TransactionState::Active], "commit")?;
        self.simple_request(OP_COMMIT_RETAINING, None, TransactionState::Active)
    }

    pub fn rollback(&self) -> Result<(), Error> {
        use TransactionState::*;
        self.require(&[Active, Prepared], "roll back")?;
        self.simple_request(OP_ROLLBACK, None, RolledBack)
    }

    pub fn rollback_retaining(&self) -> Result<(), Error> {
        self.require(&[TransactionState::Active], "roll back")?;
        self.simple_request(OP_ROLLBACK_RETAINING, None, TransactionState::Active)
    }

    /// First phase of a two-phase commit, optionally recording `message`
    /// for recovery.
    pub fn prepare(&self, message: Option<&[u8]>) -> Result<(), Error> {
        self.require(&[TransactionState::Active], "prepare")?;
        match message {
            Some(message) => {
                self.simple_request(OP_PREPARE2, Some(message), TransactionState::Prepared)
            }
            None => self.simple_request(OP_PREPARE, None, TransactionState::Prepared),
        }
    }

    /// Requests transaction info items.
    pub fn info(&self, items: &[u8], max_len: usize) -> Result<Bytes, Error> {
        let shared = upgrade(&self.database)?;
        let mut wire = shared.lock()?;
        wire.send(|out| {
            out.write_i32(OP_INFO_TRANSACTION);
            out.write_i32(self.handle);
            out.write_i32(0);
            out.write_buffer(items);
            out.write_i32(max_len as i32);
        })?;
        Ok(wire.read_generic_response()?.data)
    }

    /// The server-side transaction id.
    pub fn transaction_id(&self) -> Result<i64, Error> {
        let info = self.info(&[ISC_INFO_TRA_ID], 16)?;
        for item in InfoReader::new(&info) {
            match item? {
                InfoItem::Value { item: ISC_INFO_TRA_ID, data } => {
                    return Ok(fbwire_protocol::clumplet::vax_integer(data))
                }
                InfoItem::Value { .. } => {}
                InfoItem::Truncated => break,
            }
        }
        Err(Error::protocol("transaction info lacks isc_info_tra_id"))
    }
}
