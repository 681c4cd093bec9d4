//! Protocol negotiation, authentication exchange and wire encryption setup.
//!
//! ```text
//! client                                server
//!   op_connect (versions, user id) -->
//!                                  <--  op_accept | op_cond_accept | op_accept_data
//!   op_cont_auth                   -->                                (cond_accept)
//!                                  <--  op_cont_auth ... op_response
//!   op_crypt (plugin, key type)    -->
//!                                  <--  op_response (encrypted)
//! ```

use crate::auth::ClientAuthBlock;
use crate::config::{ConnectionConfig, WireCrypt};
use crate::crypt::CryptSession;
use crate::dbcrypt::{self, DbCryptCallback};
use crate::descriptor::{ProtocolDescriptor, ProtocolRegistry};
use crate::error::{Error, ServerError};
use crate::wire::Wire;
use bytes::Bytes;
use fbwire_protocol::consts::*;
use fbwire_protocol::{GenericResponse, ProtocolError, XdrReader, XdrWriter};
use std::io::{Read, Write};
use tracing::{debug, info, warn};

/// Most protocol versions a single `op_connect` may offer.
const MAX_OFFERED_VERSIONS: usize = 10;

/// Largest part of plugin data in one `CNCT_specific_data` item.
const SPECIFIC_DATA_PART: usize = 254;

/// The server's answer to `op_connect`.
#[derive(Debug, Clone, Default)]
pub(crate) struct AcceptPacket {
    pub(crate) operation: i32,
    pub(crate) version: i32,
    pub(crate) architecture: i32,
    pub(crate) accept_type: i32,
    pub(crate) auth_data: Bytes,
    pub(crate) plugin_name: String,
    pub(crate) authenticated: bool,
    pub(crate) keys: Bytes,
}

impl AcceptPacket {
    fn read<R: Read>(operation: i32, input: &mut XdrReader<R>) -> Result<Self, ProtocolError> {
        let mut packet = AcceptPacket {
            operation,
            version: input.read_i32()?,
            architecture: input.read_i32()?,
            accept_type: input.read_i32()?,
            ..AcceptPacket::default()
        };
        if operation != OP_ACCEPT {
            packet.auth_data = input.read_buffer()?;
            packet.plugin_name = input.read_string()?;
            packet.authenticated = input.read_i32()? != 0;
            packet.keys = input.read_buffer()?;
        }
        Ok(packet)
    }
}

fn add_item(uid: &mut Vec<u8>, tag: u8, value: &[u8]) {
    let value = &value[..value.len().min(255)];
    uid.push(tag);
    uid.push(value.len() as u8);
    uid.extend_from_slice(value);
}

/// Splits plugin data into numbered parts.
fn add_specific_data(uid: &mut Vec<u8>, data: &[u8]) {
    for (step, part) in data.chunks(SPECIFIC_DATA_PART).enumerate() {
        uid.push(CNCT_SPECIFIC_DATA);
        uid.push(part.len() as u8 + 1);
        uid.push(step as u8);
        uid.extend_from_slice(part);
    }
}

/// Builds the user identification block of `op_connect`.
fn user_identification(config: &ConnectionConfig, auth: &ClientAuthBlock) -> Vec<u8> {
    let mut uid = Vec::new();
    if let Some(ref login) = config.user {
        add_item(&mut uid, CNCT_LOGIN, login.as_bytes());
    }
    if let Some(name) = auth.current_plugin_name() {
        add_item(&mut uid, CNCT_PLUGIN_NAME, name.as_bytes());
    }
    add_item(&mut uid, CNCT_PLUGIN_LIST, auth.plugin_names().as_bytes());
    if let Some(data) = auth.client_data() {
        add_specific_data(&mut uid, data);
    }
    add_item(
        &mut uid,
        CNCT_CLIENT_CRYPT,
        &config.wire_crypt.wire_value().to_le_bytes(),
    );
    if let Some(user) = std::env::var("USER")
        .ok()
        .or_else(|| std::env::var("USERNAME").ok())
    {
        add_item(&mut uid, CNCT_USER, user.as_bytes());
    }
    if let Ok(host) = std::env::var("HOSTNAME") {
        add_item(&mut uid, CNCT_HOST, host.as_bytes());
    }
    add_item(&mut uid, CNCT_USER_VERIFICATION, &[]);
    uid
}

/// Sends `op_connect` and reads the server's choice of protocol.
pub(crate) fn identify<R: Read, W: Write>(
    input: &mut XdrReader<R>,
    output: &mut XdrWriter<W>,
    config: &ConnectionConfig,
    offered: &ProtocolRegistry,
    auth: &mut ClientAuthBlock,
    db_crypt_callback: &dyn DbCryptCallback,
) -> Result<(&'static ProtocolDescriptor, AcceptPacket), Error> {
    if let Err(e) = auth.start() {
        debug!("no authentication data for op_connect: {}", e);
    }
    let versions = offered.offered();
    let versions = &versions[versions.len().saturating_sub(MAX_OFFERED_VERSIONS)..];

    output.write_i32(OP_CONNECT);
    output.write_i32(OP_ATTACH);
    output.write_i32(CONNECT_VERSION3);
    output.write_i32(ARCH_GENERIC);
    output.write_string(&config.database);
    output.write_i32(versions.len() as i32);
    output.write_buffer(&user_identification(config, auth));
    for descriptor in versions {
        output.write_i32(descriptor.wire_version());
        output.write_i32(descriptor.architecture());
        output.write_i32(descriptor.min_type());
        output.write_i32(descriptor.max_type());
        output.write_i32(descriptor.weight());
    }
    output.flush()?;
    debug!(
        versions = ?versions.iter().map(|d| d.version()).collect::<Vec<_>>(),
        "sent op_connect"
    );

    let reply_size = versions
        .iter()
        .any(|d| d.capabilities().crypt_callback_reply_size);
    loop {
        let operation = input.read_operation()?;
        match operation {
            OP_ACCEPT | OP_COND_ACCEPT | OP_ACCEPT_DATA => {
                let accept = AcceptPacket::read(operation, input)?;
                let descriptor = offered.negotiate(accept.version)?;
                if accept.accept_type & PFLAG_COMPRESS != 0 {
                    return Err(Error::protocol(
                        "server enabled wire compression which was not requested",
                    ));
                }
                if operation != OP_ACCEPT {
                    apply_accept_data(auth, &accept)?;
                }
                debug!(
                    operation = operation_name(operation),
                    protocol = descriptor.version(),
                    accept_type = accept.accept_type & PTYPE_MASK,
                    "protocol accepted"
                );
                return Ok((descriptor, accept));
            }
            OP_CRYPT_KEY_CALLBACK => {
                dbcrypt::answer_callback(input, output, db_crypt_callback, reply_size)?;
            }
            OP_REJECT => {
                return Err(Error::protocol(
                    "server rejected every offered protocol version",
                ))
            }
            OP_RESPONSE => {
                let response = GenericResponse::read(input)?;
                return Err(match ServerError::from_status(&response.status) {
                    Some(err) => Error::Server(err),
                    None => Error::protocol("unexpected op_response to op_connect"),
                });
            }
            other => {
                return Err(Error::protocol(format!(
                    "unexpected {} ({}) during connect",
                    operation_name(other),
                    other
                )))
            }
        }
    }
}

/// Feeds the authentication data of `op_cond_accept`/`op_accept_data`.
fn apply_accept_data(auth: &mut ClientAuthBlock, accept: &AcceptPacket) -> Result<(), Error> {
    auth.set_complete(accept.authenticated);
    if let Err(e) = auth.add_server_keys(&accept.keys) {
        debug!("ignoring malformed server keys: {}", e);
    }
    if let Err(e) = auth.restrict_to_server_plugins(&accept.keys) {
        debug!("ignoring malformed known plugin list: {}", e);
    }
    if !accept.plugin_name.is_empty() && !auth.switch_plugin(&accept.plugin_name) {
        return Err(auth.failed(&format!(
            "server requires authentication plugin '{}'",
            accept.plugin_name
        )));
    }
    auth.set_server_data(&accept.auth_data);
    Ok(())
}

/// Runs the part of authentication that happens before attach.
pub(crate) fn authenticate(wire: &mut Wire<'_>) -> Result<(), Error> {
    let accept = wire.channel.accept.take().unwrap_or_default();
    let capabilities = wire.descriptor().capabilities();
    if !capabilities.plugin_auth {
        if wire.config().wire_crypt == WireCrypt::Required {
            return Err(Error::EncryptionUnavailable {
                causes: vec![format!(
                    "protocol {} does not support wire encryption",
                    wire.descriptor().version()
                )],
            });
        }
        return Ok(());
    }

    match accept.operation {
        OP_COND_ACCEPT => {
            receive_auth_response(wire, Some(accept))?;
        }
        OP_ACCEPT_DATA if accept.authenticated => {
            wire.channel.auth.set_complete(true);
            establish_encryption(wire)?;
        }
        OP_ACCEPT_DATA if !accept.auth_data.is_empty() => {
            // The answer travels in the attach DPB.
            wire.channel.auth.authenticate()?;
        }
        _ => debug!("authentication continues during attach"),
    }
    Ok(())
}

/// Runs `op_cont_auth` rounds until the server sends `op_response`.
///
/// `accept` carries the first round's server data when the exchange starts
/// from `op_cond_accept`.
pub(crate) fn receive_auth_response(
    wire: &mut Wire<'_>,
    accept: Option<AcceptPacket>,
) -> Result<GenericResponse, Error> {
    let mut pending = accept.map(|a| (a.auth_data, a.plugin_name));
    loop {
        let (data, plugin_name) = match pending.take() {
            Some(round) => round,
            None => match read_auth_message(wire)? {
                AuthMessage::Round(data, name) => (data, name),
                AuthMessage::Done(response) => return Ok(response),
            },
        };

        let auth = &mut wire.channel.auth;
        if !plugin_name.is_empty() && !auth.switch_plugin(&plugin_name) {
            let err = auth.failed(&format!(
                "server requires authentication plugin '{}'",
                plugin_name
            ));
            return Err(wire.fail(err));
        }
        auth.set_server_data(&data);
        if let Err(e) = auth.authenticate() {
            return Err(wire.fail(e));
        }
        let client_data = auth.client_data().map(<[u8]>::to_vec).unwrap_or_default();
        let name = auth.current_plugin_name().unwrap_or_default().to_string();
        let list = auth.take_plugin_list();
        debug!(plugin = %name, "sending op_cont_auth");
        wire.send(|out| {
            out.write_i32(OP_CONT_AUTH);
            out.write_buffer(&client_data);
            out.write_string(&name);
            match list {
                Some(ref list) => out.write_string(list),
                None => out.write_opt_buffer(None),
            }
            out.write_opt_buffer(None);
        })?;
    }
}

enum AuthMessage {
    Round(Bytes, String),
    Done(GenericResponse),
}

fn read_auth_message(wire: &mut Wire<'_>) -> Result<AuthMessage, Error> {
    loop {
        let operation = wire.read_operation()?;
        match operation {
            OP_CONT_AUTH => {
                let (data, name, keys) = wire.read(|input| {
                    let data = input.read_buffer()?;
                    let name = input.read_string()?;
                    input.skip_buffer()?;
                    let keys = input.read_buffer()?;
                    Ok((data, name, keys))
                })?;
                if let Err(e) = wire.channel.auth.add_server_keys(&keys) {
                    debug!("ignoring malformed server keys: {}", e);
                }
                return Ok(AuthMessage::Round(data, name));
            }
            OP_COND_ACCEPT => {
                let accept = wire.read(|input| AcceptPacket::read(operation, input))?;
                if let Err(e) = wire.channel.auth.add_server_keys(&accept.keys) {
                    debug!("ignoring malformed server keys: {}", e);
                }
                return Ok(AuthMessage::Round(accept.auth_data, accept.plugin_name));
            }
            OP_CRYPT_KEY_CALLBACK => wire.answer_crypt_callback()?,
            OP_TRUSTED_AUTH => {
                return Err(wire.fail(Error::protocol(
                    "trusted authentication is not supported",
                )))
            }
            OP_RESPONSE => {
                let response = match wire.read_generic_body() {
                    Ok(response) => response,
                    Err(Error::Server(e)) if e.code == ISC_LOGIN => {
                        let err = wire.channel.auth.failed(&e.to_string());
                        return Err(wire.fail(err));
                    }
                    Err(e) => return Err(e),
                };
                wire.channel.auth.set_complete(true);
                if let Err(e) = wire.channel.auth.add_server_keys(&response.data) {
                    debug!("ignoring server keys in op_response: {}", e);
                }
                establish_encryption(wire)?;
                return Ok(AuthMessage::Done(response));
            }
            other => {
                return Err(wire.fail(Error::protocol(format!(
                    "unexpected {} ({}) during authentication",
                    operation_name(other),
                    other
                ))))
            }
        }
    }
}

/// Tries the server's keys against the local encryption plugins and
/// switches the wire to the first one that initializes.
pub(crate) fn establish_encryption(wire: &mut Wire<'_>) -> Result<(), Error> {
    let policy = wire.config().wire_crypt;
    if policy == WireCrypt::Disabled || wire.channel.encryption.is_some() {
        return Ok(());
    }
    let descriptor = wire.descriptor();
    if !descriptor.create_wire_operations().supports_wire_crypt() {
        if policy == WireCrypt::Required {
            let err = Error::EncryptionUnavailable {
                causes: vec![format!(
                    "protocol {} does not support wire encryption",
                    descriptor.version()
                )],
            };
            return Err(wire.fail(err));
        }
        return Ok(());
    }

    let mut causes = Vec::new();
    let keys = wire.channel.auth.server_keys().to_vec();
    match wire.channel.auth.session_key() {
        None => causes.push("authentication produced no session key".to_string()),
        Some(session_key) => {
            let plugins = &wire.shared().encryption_plugins;
            for key in &keys {
                for (identifier, specific_data) in key.candidates() {
                    let Some(plugin) = plugins.get(&identifier) else {
                        debug!(%identifier, "no local encryption plugin");
                        causes.push(format!("{}: no local plugin", identifier));
                        continue;
                    };
                    if !plugin.supports_protocol(descriptor.version()) {
                        causes.push(format!(
                            "{}: not supported by protocol {}",
                            identifier,
                            descriptor.version()
                        ));
                        continue;
                    }
                    let session = CryptSession {
                        identifier: &identifier,
                        session_key: &session_key,
                        specific_data,
                    };
                    match plugin.initialize(&session) {
                        Ok(ciphers) => {
                            wire.enable_encryption(&identifier, ciphers)?;
                            info!(%identifier, "wire encryption enabled");
                            return Ok(());
                        }
                        Err(e) => {
                            debug!(%identifier, "encryption plugin failed: {}", e);
                            causes.push(format!("{}: {}", identifier, e));
                        }
                    }
                }
            }
        }
    }
    if keys.is_empty() {
        causes.push("server offered no encryption keys".to_string());
    }

    if policy == WireCrypt::Required {
        return Err(wire.fail(Error::EncryptionUnavailable { causes }));
    }
    warn!("continuing without wire encryption: {}", causes.join("; "));
    Ok(())
}
