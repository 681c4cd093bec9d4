//! Database encryption key callbacks.
//!
//! A server with an encrypted database may ask the client for key material
//! (`op_crypt_key_callback`) at any point of the handshake or attach.

use crate::error::Error;
use fbwire_protocol::consts::OP_CRYPT_KEY_CALLBACK;
use fbwire_protocol::{XdrReader, XdrWriter};
use std::io::{Read, Write};
use tracing::debug;

/// Produces the reply to a database crypt key request.
pub trait DbCryptCallback: Send + Sync {
    fn name(&self) -> &str;

    /// `reply_size` is the size the server expects, when it says so.
    fn handle_callback(&self, server_data: &[u8], reply_size: Option<i32>) -> Vec<u8>;
}

/// Answers every request with an empty reply.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDbCryptCallback;

impl DbCryptCallback for NoDbCryptCallback {
    fn name(&self) -> &str {
        "none"
    }

    fn handle_callback(&self, _server_data: &[u8], _reply_size: Option<i32>) -> Vec<u8> {
        Vec::new()
    }
}

/// Answers every request with a fixed key.
#[derive(Debug, Clone)]
pub struct StaticDbCryptCallback {
    key: Vec<u8>,
}

impl StaticDbCryptCallback {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }
}

impl DbCryptCallback for StaticDbCryptCallback {
    fn name(&self) -> &str {
        "static"
    }

    fn handle_callback(&self, _server_data: &[u8], _reply_size: Option<i32>) -> Vec<u8> {
        self.key.clone()
    }
}

/// Reads the body of an `op_crypt_key_callback` and writes the reply.
pub(crate) fn answer_callback<R: Read, W: Write>(
    input: &mut XdrReader<R>,
    output: &mut XdrWriter<W>,
    callback: &dyn DbCryptCallback,
    with_reply_size: bool,
) -> Result<(), Error> {
    let server_data = input.read_buffer()?;
    let reply_size = if with_reply_size {
        Some(input.read_i32()?)
    } else {
        None
    };
    debug!(
        callback = callback.name(),
        "answering database crypt key callback"
    );
    let reply = callback.handle_callback(&server_data, reply_size);

    output.write_i32(OP_CRYPT_KEY_CALLBACK);
    output.write_buffer(&reply);
    if with_reply_size {
        output.write_i32(reply.len() as i32);
    }
    output.flush()?;
    Ok(())
}
