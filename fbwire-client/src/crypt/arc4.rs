//! `Arc4` wire encryption.

use super::{CipherPair, CryptSession, EncryptionIdentifier, EncryptionPlugin};
use crate::error::Error;
use fbwire_protocol::WireCipher;
use rc4::consts::U20;
use rc4::{KeyInit, Rc4, StreamCipher};

/// Length of the SRP session key Arc4 is keyed with.
const KEY_LENGTH: usize = 20;

struct Arc4Cipher(Rc4<U20>);

impl WireCipher for Arc4Cipher {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

/// RC4 keyed with the session key, one independent stream per direction.
pub struct Arc4Plugin {
    identifier: EncryptionIdentifier,
}

impl Arc4Plugin {
    pub fn new() -> Self {
        Self {
            identifier: EncryptionIdentifier::new("Symmetric", "Arc4"),
        }
    }
}

impl Default for Arc4Plugin {
    fn default() -> Self {
        Self::new()
    }
}

fn cipher(key: &[u8]) -> Result<Box<dyn WireCipher>, Error> {
    let rc4 = Rc4::<U20>::new_from_slice(key).map_err(|_| {
        Error::InvalidArgument(format!(
            "Arc4 needs a {} byte session key, got {}",
            KEY_LENGTH,
            key.len()
        ))
    })?;
    Ok(Box::new(Arc4Cipher(rc4)))
}

impl EncryptionPlugin for Arc4Plugin {
    fn identifier(&self) -> &EncryptionIdentifier {
        &self.identifier
    }

    fn initialize(&self, session: &CryptSession<'_>) -> Result<CipherPair, Error> {
        Ok(CipherPair {
            encrypt: cipher(session.session_key)?,
            decrypt: cipher(session.session_key)?,
        })
    }
}
