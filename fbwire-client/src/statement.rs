//! Prepared statements.
//!
//! From protocol 11 on, allocation travels in the same packet as the first
//! prepare (addressed through the "last object" handle) and closing or
//! freeing is written without waiting for the reply.

use crate::connection::Shared;
use crate::database::upgrade;
use crate::deferred::{DeferredAction, PendingResponse};
use crate::descriptor::ProtocolDescriptor;
use crate::error::Error;
use crate::info::{parse_row_counts, parse_statement_info, RowCounts, StatementInfo, STATEMENT_INFO_ITEMS};
use crate::transaction::Transaction;
use crate::wire::Wire;
use bytes::Bytes;
use fbwire_protocol::blr::message_blr;
use fbwire_protocol::consts::*;
use fbwire_protocol::{FetchResponse, Response, RowCodec, RowDescriptor, RowValue, XdrWriter};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Weak;
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    /// No server handle yet.
    New,
    Allocated,
    Prepared,
    Executed,
    /// A cursor is open and at least one batch was fetched.
    Fetching,
    /// Free written, reply not processed yet.
    FreePending,
    Closed,
    Error,
}

/// A server-side statement.
pub struct Statement {
    database: Weak<Shared>,
    descriptor: &'static ProtocolDescriptor,
    handle: Option<i32>,
    state: StatementState,
    info: Option<StatementInfo>,
    cursor_open: bool,
    all_rows_fetched: bool,
    timeout: Option<Duration>,
    pending_free: Option<PendingResponse>,
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("cursor_open", &self.cursor_open)
            .field("protocol", &self.descriptor.version())
            .finish()
    }
}

impl Statement {
    pub(crate) fn new(database: Weak<Shared>, descriptor: &'static ProtocolDescriptor) -> Self {
        Self {
            database,
            descriptor,
            handle: None,
            state: StatementState::New,
            info: None,
            cursor_open: false,
            all_rows_fetched: false,
            timeout: None,
            pending_free: None,
        }
    }

    pub fn handle(&self) -> Option<i32> {
        self.handle
    }

    pub fn state(&self) -> StatementState {
        self.state
    }

    /// Type, columns and parameters of the prepared statement.
    pub fn statement_info(&self) -> Option<&StatementInfo> {
        self.info.as_ref()
    }

    pub fn has_open_cursor(&self) -> bool {
        self.cursor_open
    }

    /// Sets the execution timeout (protocol 16 and later).
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        if !self.descriptor.capabilities().statement_timeout {
            return Err(self.descriptor.not_supported("statement timeout"));
        }
        if timeout.as_millis() > u32::MAX as u128 {
            return Err(Error::InvalidArgument(format!(
                "statement timeout {:?} is too large",
                timeout
            )));
        }
        self.timeout = Some(timeout);
        Ok(())
    }

    fn set_state(&mut self, state: StatementState) {
        if self.state != state {
            debug!(handle = ?self.handle, "statement state: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            self.cursor_open = false;
            self.set_state(StatementState::Error);
        }
        err
    }

    fn require_usable(&self, action: &str) -> Result<(), Error> {
        match self.state {
            StatementState::FreePending | StatementState::Closed | StatementState::Error => {
                Err(Error::handle_state(format!(
                    "cannot {} a statement in state {:?}",
                    action, self.state
                )))
            }
            _ => Ok(()),
        }
    }

    fn require_handle(&self, action: &str) -> Result<i32, Error> {
        self.require_usable(action)?;
        self.handle
            .ok_or_else(|| Error::handle_state(format!("cannot {} an unallocated statement", action)))
    }

    fn prepared_info(&self, action: &str) -> Result<&StatementInfo, Error> {
        self.require_usable(action)?;
        self.info
            .as_ref()
            .ok_or_else(|| Error::handle_state(format!("cannot {} an unprepared statement", action)))
    }

    /// Runs one exchange under the connection lock; fatal errors move the
    /// statement to the error state.
    fn exchange<T>(&mut self, f: impl FnOnce(&mut Wire<'_>) -> Result<T, Error>) -> Result<T, Error> {
        let result = upgrade(&self.database).and_then(|shared| {
            let mut wire = shared.lock()?;
            f(&mut wire)
        });
        result.map_err(|e| self.fail(e))
    }

    /// Allocates the server handle right away.
    ///
    /// [`prepare`](Self::prepare) allocates on demand, so this is only
    /// needed to hold a handle before the first prepare.
    pub fn allocate(&mut self) -> Result<(), Error> {
        self.require_usable("allocate")?;
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = self.exchange(|wire| {
            let db = wire.database_handle()?;
            wire.send(|out| {
                out.write_i32(OP_ALLOCATE_STATEMENT);
                out.write_i32(db);
            })?;
            Ok(wire.read_generic_response()?.object_handle)
        })?;
        self.handle = Some(handle);
        self.set_state(StatementState::Allocated);
        Ok(())
    }

    /// Prepares `sql` within `transaction` and returns its description.
    pub fn prepare(&mut self, transaction: &Transaction, sql: &str) -> Result<&StatementInfo, Error> {
        self.require_usable("prepare")?;
        if self.cursor_open {
            self.close_cursor()?;
        }
        let descriptor = self.descriptor;
        let capabilities = descriptor.capabilities();
        if self.handle.is_none() && !capabilities.lazy_send {
            self.allocate()?;
        }

        let pipelined = self.handle.is_none();
        let handle = self.handle.unwrap_or(INVALID_OBJECT);
        let (allocated, prepared) = self.exchange(|wire| {
            let db = wire.database_handle()?;
            let dialect = wire.config().sql_dialect;
            let info_size = wire
                .config()
                .statement_info_size
                .unwrap_or(capabilities.max_info_size);
            wire.send(|out| {
                if pipelined {
                    out.write_i32(OP_ALLOCATE_STATEMENT);
                    out.write_i32(db);
                }
                out.write_i32(OP_PREPARE_STATEMENT);
                out.write_i32(transaction.handle());
                out.write_i32(handle);
                out.write_i32(dialect);
                out.write_string(sql);
                out.write_buffer(STATEMENT_INFO_ITEMS);
                out.write_i32(info_size);
            })?;
            // Both replies must be consumed even when the allocation failed.
            let allocated = pipelined.then(|| wire.read_generic_response());
            let prepared = wire.read_generic_response();
            Ok((allocated, prepared))
        })?;

        if let Some(allocated) = allocated {
            let response = allocated.map_err(|e| self.fail(e))?;
            self.handle = Some(response.object_handle);
        }
        self.info = None;
        self.all_rows_fetched = false;
        self.set_state(StatementState::Allocated);

        let response = prepared.map_err(|e| self.fail(e))?;
        let info = parse_statement_info(&response.data)?;
        trace!(
            statement_type = info.statement_type,
            fields = info.fields.len(),
            parameters = info.parameters.len(),
            "statement prepared"
        );
        self.set_state(StatementState::Prepared);
        Ok(self.info.insert(info))
    }

    /// Executes the prepared statement with one value per parameter.
    ///
    /// Returns the output row of a singleton (procedure) statement; for a
    /// select the rows are read with [`fetch`](Self::fetch).
    pub fn execute(
        &mut self,
        transaction: &Transaction,
        parameters: &[Option<Bytes>],
    ) -> Result<Option<RowValue>, Error> {
        if self.cursor_open {
            self.close_cursor()?;
        }
        let info = self.prepared_info("execute")?;
        let handle = self.require_handle("execute")?;
        if parameters.len() != info.parameters.len() {
            return Err(Error::InvalidArgument(format!(
                "statement takes {} parameters, got {}",
                info.parameters.len(),
                parameters.len()
            )));
        }

        let codec = self.descriptor.capabilities().row_codec;
        let input_blr = message_blr(&info.parameters)?;
        let message = encode_message(codec, &info.parameters, parameters)?;
        let singleton =
            info.statement_type == ISC_INFO_SQL_STMT_EXEC_PROCEDURE && !info.fields.is_empty();
        let output = if singleton {
            Some((info.fields.clone(), message_blr(&info.fields)?))
        } else {
            None
        };
        let opens_cursor = matches!(
            info.statement_type,
            ISC_INFO_SQL_STMT_SELECT | ISC_INFO_SQL_STMT_SELECT_FOR_UPD
        ) && !info.fields.is_empty();
        let timeout = self
            .descriptor
            .capabilities()
            .statement_timeout
            .then(|| self.timeout.map_or(0, |t| t.as_millis() as u32));

        let row = self.exchange(|wire| {
            wire.send(|out| {
                out.write_i32(if singleton { OP_EXECUTE2 } else { OP_EXECUTE });
                out.write_i32(handle);
                out.write_i32(transaction.handle());
                out.write_opt_buffer(input_blr.as_deref());
                out.write_i32(0);
                if parameters.is_empty() {
                    out.write_i32(0);
                } else {
                    out.write_i32(1);
                    out.write_raw(&message);
                }
                if let Some((_, output_blr)) = &output {
                    out.write_opt_buffer(output_blr.as_deref());
                    out.write_i32(0);
                }
                if let Some(timeout) = timeout {
                    out.write_i32(timeout as i32);
                }
            })?;

            let row = match &output {
                Some((fields, _)) => match wire.read_response()? {
                    Response::Sql(response) if response.count > 0 => {
                        Some(wire.read(|input| codec.read_row(input, fields))?)
                    }
                    Response::Sql(_) => None,
                    other => {
                        return Err(wire.fail(Error::protocol(format!(
                            "expected op_sql_response, got {:?}",
                            other
                        ))))
                    }
                },
                None => None,
            };
            wire.read_generic_response()?;
            Ok(row)
        })?;

        self.cursor_open = opens_cursor;
        self.all_rows_fetched = false;
        self.set_state(StatementState::Executed);
        Ok(row)
    }

    /// Fetches up to `count` rows from the open cursor.
    ///
    /// An empty batch means the cursor is exhausted.
    pub fn fetch(&mut self, count: usize) -> Result<Vec<RowValue>, Error> {
        if !self.cursor_open {
            return Err(Error::handle_state("statement has no open cursor"));
        }
        if self.all_rows_fetched {
            return Ok(Vec::new());
        }
        let handle = self.require_handle("fetch from")?;
        let fields = self.prepared_info("fetch from")?.fields.clone();
        let blr = message_blr(&fields)?;
        let codec = self.descriptor.capabilities().row_codec;
        let count = count.clamp(1, i32::MAX as usize);

        let (rows, exhausted) = self.exchange(|wire| {
            wire.send(|out| {
                out.write_i32(OP_FETCH);
                out.write_i32(handle);
                out.write_opt_buffer(blr.as_deref());
                out.write_i32(0);
                out.write_i32(count as i32);
            })?;
            read_fetched_rows(wire, codec, &fields)
        })?;

        trace!(handle, rows = rows.len(), exhausted, "fetched batch");
        self.all_rows_fetched = exhausted;
        self.set_state(StatementState::Fetching);
        Ok(rows)
    }

    /// Iterates over the remaining rows, fetching `batch` rows at a time.
    pub fn rows(&mut self, batch: usize) -> Rows<'_> {
        Rows {
            statement: self,
            batch,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Closes the open cursor, keeping the statement prepared.
    pub fn close_cursor(&mut self) -> Result<(), Error> {
        if !self.cursor_open {
            return Ok(());
        }
        let handle = self.require_handle("close")?;
        let lazy = self.descriptor.capabilities().lazy_send;
        self.exchange(|wire| {
            wire.write(|out| {
                out.write_i32(OP_FREE_STATEMENT);
                out.write_i32(handle);
                out.write_i32(DSQL_CLOSE);
            });
            if lazy {
                wire.enqueue(DeferredAction::new("close cursor", |_| {}));
                Ok(())
            } else {
                wire.flush()?;
                wire.read_generic_response().map(drop)
            }
        })?;
        self.cursor_open = false;
        self.all_rows_fetched = false;
        self.set_state(StatementState::Prepared);
        Ok(())
    }

    /// Releases the server handle.
    ///
    /// With lazy send the request is only written; the statement stays in
    /// [`StatementState::FreePending`] until [`sync_free`](Self::sync_free)
    /// observes the reply.
    pub fn free(&mut self) -> Result<(), Error> {
        match self.state {
            StatementState::Closed | StatementState::FreePending => return Ok(()),
            _ => {}
        }
        let Some(handle) = self.handle else {
            self.set_state(StatementState::Closed);
            return Ok(());
        };
        let lazy = self.descriptor.capabilities().lazy_send;
        let pending = self.exchange(|wire| {
            wire.write(|out| {
                out.write_i32(OP_FREE_STATEMENT);
                out.write_i32(handle);
                out.write_i32(DSQL_DROP);
            });
            if lazy {
                let (action, slot) = DeferredAction::with_slot("free statement");
                wire.enqueue(action.requiring_sync());
                Ok(Some(slot))
            } else {
                wire.flush()?;
                wire.read_generic_response()?;
                Ok(None)
            }
        })?;

        self.handle = None;
        self.info = None;
        self.cursor_open = false;
        match pending {
            Some(slot) => {
                self.pending_free = Some(slot);
                self.set_state(StatementState::FreePending);
            }
            None => self.set_state(StatementState::Closed),
        }
        Ok(())
    }

    /// Waits for the reply of a deferred free.
    pub fn sync_free(&mut self) -> Result<(), Error> {
        let Some(slot) = self.pending_free.take() else {
            return Ok(());
        };
        if !slot.is_complete() {
            if let Err(e) = self.exchange(|wire| wire.drain_synchronously()) {
                self.pending_free = Some(slot);
                return Err(e);
            }
        }
        match slot.take() {
            Some(Ok(_)) => {
                self.set_state(StatementState::Closed);
                Ok(())
            }
            Some(Err(e)) => {
                self.set_state(StatementState::Error);
                Err(e)
            }
            None => {
                self.set_state(StatementState::Error);
                Err(Error::protocol("deferred free was never answered"))
            }
        }
    }

    /// Requests statement info items.
    pub fn sql_info(&mut self, items: &[u8], max_len: usize) -> Result<Bytes, Error> {
        let handle = self.require_handle("query")?;
        self.exchange(|wire| {
            wire.send(|out| {
                out.write_i32(OP_INFO_SQL);
                out.write_i32(handle);
                out.write_i32(0);
                out.write_buffer(items);
                out.write_i32(max_len as i32);
            })?;
            Ok(wire.read_generic_response()?.data)
        })
    }

    /// Rows affected by the last execute.
    pub fn row_counts(&mut self) -> Result<RowCounts, Error> {
        let data = self.sql_info(&[ISC_INFO_SQL_RECORDS, ISC_INFO_END], 64)?;
        parse_row_counts(&data)
    }
}

/// Encodes a message before taking the transmit lock, so that an encoding
/// error never leaves a partial request in the send buffer.
fn encode_message(
    codec: RowCodec,
    descriptor: &RowDescriptor,
    values: &[Option<Bytes>],
) -> Result<Vec<u8>, Error> {
    if values.is_empty() {
        return Ok(Vec::new());
    }
    let mut scratch = XdrWriter::new(Vec::new());
    codec.write_row(&mut scratch, descriptor, values)?;
    scratch.flush()?;
    Ok(scratch.get_ref().clone())
}

/// Reads `op_fetch_response` packets up to the one closing the batch.
fn read_fetched_rows(
    wire: &mut Wire<'_>,
    codec: RowCodec,
    fields: &RowDescriptor,
) -> Result<(Vec<RowValue>, bool), Error> {
    let mut rows = Vec::new();
    loop {
        match wire.read_response()? {
            Response::Fetch(FetchResponse { status: FETCH_OK, count }) if count > 0 => {
                rows.push(wire.read(|input| codec.read_row(input, fields))?);
            }
            Response::Fetch(FetchResponse { status, .. }) => {
                return Ok((rows, status == FETCH_NO_MORE_ROWS));
            }
            other => {
                return Err(wire.fail(Error::protocol(format!(
                    "expected op_fetch_response, got {:?}",
                    other
                ))))
            }
        }
    }
}

/// Iterator over the rows of an open cursor.
pub struct Rows<'a> {
    statement: &'a mut Statement,
    batch: usize,
    buffer: VecDeque<RowValue>,
    done: bool,
}

impl Iterator for Rows<'_> {
    type Item = Result<RowValue, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.buffer.pop_front() {
            return Some(Ok(row));
        }
        if self.done {
            return None;
        }
        match self.statement.fetch(self.batch) {
            Ok(rows) if rows.is_empty() => {
                self.done = true;
                None
            }
            Ok(rows) => {
                self.buffer.extend(rows);
                self.buffer.pop_front().map(Ok)
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
