//! Wire encryption plugins.
//!
//! After authentication the server advertises the keys it can use for wire
//! encryption. Each key names a key type and the plugins able to use it:
//!
//! ```text
//! TAG_KEY_TYPE        "Symmetric"
//! TAG_KEY_PLUGINS     "Arc4 ChaCha"            (space separated)
//! TAG_PLUGIN_SPECIFIC "ChaCha\0<plugin data>"
//! TAG_KNOWN_PLUGINS   "Srp256 Srp"             (authentication plugins)
//! ```

mod arc4;

pub use arc4::Arc4Plugin;

use crate::error::Error;
use fbwire_protocol::consts::{TAG_KEY_PLUGINS, TAG_KEY_TYPE, TAG_KNOWN_PLUGINS, TAG_PLUGIN_SPECIFIC};
use fbwire_protocol::{ClumpletReader, WireCipher};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Key type and plugin name of an encryption candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncryptionIdentifier {
    pub key_type: String,
    pub plugin_name: String,
}

impl EncryptionIdentifier {
    pub fn new(key_type: impl Into<String>, plugin_name: impl Into<String>) -> Self {
        Self {
            key_type: key_type.into(),
            plugin_name: plugin_name.into(),
        }
    }
}

impl fmt::Display for EncryptionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plugin_name, self.key_type)
    }
}

/// A key the server offered for wire encryption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownServerKey {
    pub key_type: String,
    pub plugins: Vec<String>,
    pub specific_data: HashMap<String, Vec<u8>>,
}

impl KnownServerKey {
    /// Parses every key in a server keys buffer.
    pub fn parse_all(data: &[u8]) -> Result<Vec<Self>, Error> {
        let mut keys: Vec<KnownServerKey> = Vec::new();
        for clumplet in ClumpletReader::new(data) {
            let (tag, value) = clumplet?;
            match tag {
                TAG_KEY_TYPE => keys.push(KnownServerKey {
                    key_type: String::from_utf8_lossy(value).into_owned(),
                    ..KnownServerKey::default()
                }),
                TAG_KEY_PLUGINS => {
                    if let Some(key) = keys.last_mut() {
                        key.plugins = String::from_utf8_lossy(value)
                            .split_whitespace()
                            .map(str::to_string)
                            .collect();
                    }
                }
                TAG_PLUGIN_SPECIFIC => {
                    if let Some(key) = keys.last_mut() {
                        let split = value.iter().position(|&b| b == 0).unwrap_or(value.len());
                        let plugin = String::from_utf8_lossy(&value[..split]).into_owned();
                        let data = value.get(split + 1..).unwrap_or_default().to_vec();
                        key.specific_data.insert(plugin, data);
                    }
                }
                _ => {}
            }
        }
        Ok(keys)
    }

    /// Encryption candidates of this key, in server preference order.
    pub fn candidates(&self) -> impl Iterator<Item = (EncryptionIdentifier, Option<&[u8]>)> + '_ {
        self.plugins.iter().map(move |plugin| {
            (
                EncryptionIdentifier::new(&self.key_type, plugin),
                self.specific_data.get(plugin).map(Vec::as_slice),
            )
        })
    }
}

/// Authentication plugin names listed in a server keys buffer.
pub fn known_auth_plugins(data: &[u8]) -> Result<Vec<String>, Error> {
    let mut names = Vec::new();
    for clumplet in ClumpletReader::new(data) {
        let (tag, value) = clumplet?;
        if tag == TAG_KNOWN_PLUGINS {
            names.extend(
                String::from_utf8_lossy(value)
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }
    }
    Ok(names)
}

/// Inputs for initializing an encryption plugin.
pub struct CryptSession<'a> {
    pub identifier: &'a EncryptionIdentifier,
    /// Session key from the authentication plugin.
    pub session_key: &'a [u8],
    pub specific_data: Option<&'a [u8]>,
}

/// Ciphers for both directions of the wire.
pub struct CipherPair {
    pub encrypt: Box<dyn WireCipher>,
    pub decrypt: Box<dyn WireCipher>,
}

/// A wire encryption plugin.
pub trait EncryptionPlugin: Send + Sync {
    fn identifier(&self) -> &EncryptionIdentifier;

    fn supports_protocol(&self, version: u32) -> bool {
        version >= 13
    }

    fn initialize(&self, session: &CryptSession<'_>) -> Result<CipherPair, Error>;
}

/// Encryption plugins available to connections.
#[derive(Clone)]
pub struct EncryptionPluginRegistry {
    plugins: Vec<Arc<dyn EncryptionPlugin>>,
}

impl Default for EncryptionPluginRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Arc4Plugin::new()));
        registry
    }
}

impl EncryptionPluginRegistry {
    pub fn empty() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Adds a plugin, replacing one with the same identifier.
    pub fn register(&mut self, plugin: Arc<dyn EncryptionPlugin>) {
        self.plugins
            .retain(|p| p.identifier() != plugin.identifier());
        self.plugins.push(plugin);
    }

    pub fn get(&self, identifier: &EncryptionIdentifier) -> Option<Arc<dyn EncryptionPlugin>> {
        self.plugins
            .iter()
            .find(|p| p.identifier() == identifier)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl fmt::Debug for EncryptionPluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.identifier().to_string()))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a server keys buffer.
    pub(crate) fn keys_buffer(entries: &[(u8, &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        for (tag, value) in entries {
            data.push(*tag);
            data.push(value.len() as u8);
            data.extend_from_slice(value);
        }
        data
    }

    #[test]
    fn test_parse_keys() {
        let data = keys_buffer(&[
            (TAG_KNOWN_PLUGINS, b"Srp256 Srp"),
            (TAG_KEY_TYPE, b"Symmetric"),
            (TAG_KEY_PLUGINS, b"ChaCha Arc4"),
            (TAG_PLUGIN_SPECIFIC, b"ChaCha\0nonce"),
            (TAG_KEY_TYPE, b"Other"),
            (TAG_KEY_PLUGINS, b"Foo"),
        ]);

        let keys = KnownServerKey::parse_all(&data).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key_type, "Symmetric");
        assert_eq!(keys[0].plugins, vec!["ChaCha", "Arc4"]);
        assert_eq!(keys[0].specific_data["ChaCha"], b"nonce".to_vec());

        let candidates: Vec<_> = keys[0].candidates().collect();
        assert_eq!(candidates[0].0, EncryptionIdentifier::new("Symmetric", "ChaCha"));
        assert_eq!(candidates[0].1, Some(&b"nonce"[..]));
        assert_eq!(candidates[1].1, None);

        assert_eq!(known_auth_plugins(&data).unwrap(), vec!["Srp256", "Srp"]);
    }

    #[test]
    fn test_truncated_keys() {
        assert!(KnownServerKey::parse_all(&[TAG_KEY_TYPE, 9, b'S']).is_err());
    }

    #[test]
    fn test_default_registry() {
        let registry = EncryptionPluginRegistry::default();
        assert!(registry
            .get(&EncryptionIdentifier::new("Symmetric", "Arc4"))
            .is_some());
        assert!(registry
            .get(&EncryptionIdentifier::new("Symmetric", "ChaCha"))
            .is_none());
    }
}
