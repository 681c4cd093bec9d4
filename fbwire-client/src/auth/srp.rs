//! Secure Remote Password authentication (`Srp`, `Srp224` .. `Srp512`).
//!
//! The variants differ only in the digest of the client proof; the session
//! key is always SHA-1 of the shared secret.
//!
//! ```text
//! client -> server : hex(A)
//! server -> client : salt length (u16 LE) | salt | key length (u16 LE) | hex(B)
//! client -> server : hex(M)
//! ```

use super::{AuthPlugin, AuthPluginProvider, AuthStatus, Credentials};
use crate::error::Error;
use num_bigint::{BigUint, RandBigInt};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::marker::PhantomData;
use std::sync::Arc;

/// Bits of the client private key.
const PRIVATE_KEY_BITS: u64 = 128;

const GENERATOR: u32 = 2;

#[rustfmt::skip]
const PRIME: [u8; 128] = [
    0xe6, 0x7d, 0x2e, 0x99, 0x4b, 0x2f, 0x90, 0x0c, 0x3f, 0x41, 0xf0, 0x8f,
    0x5b, 0xb2, 0x62, 0x7e, 0xd0, 0xd4, 0x9e, 0xe1, 0xfe, 0x76, 0x7a, 0x52,
    0xef, 0xcd, 0x56, 0x5c, 0xd6, 0xe7, 0x68, 0x81, 0x2c, 0x3e, 0x1e, 0x9c,
    0xe8, 0xf0, 0xa8, 0xbe, 0xa6, 0xcb, 0x13, 0xcd, 0x29, 0xdd, 0xeb, 0xf7,
    0xa9, 0x6d, 0x4a, 0x93, 0xb5, 0x5d, 0x48, 0x8d, 0xf0, 0x99, 0xa1, 0x5c,
    0x89, 0xdc, 0xb0, 0x64, 0x07, 0x38, 0xeb, 0x2c, 0xbd, 0xd9, 0xa8, 0xf7,
    0xba, 0xb5, 0x61, 0xab, 0x1b, 0x0d, 0xc1, 0xc6, 0xcd, 0xab, 0xf3, 0x03,
    0x26, 0x4a, 0x08, 0xd1, 0xbc, 0xa9, 0x32, 0xd1, 0xf1, 0xee, 0x42, 0x8b,
    0x61, 0x9d, 0x97, 0x0f, 0x34, 0x2a, 0xba, 0x9a, 0x65, 0x79, 0x3b, 0x8b,
    0x2f, 0x04, 0x1a, 0xe5, 0x36, 0x43, 0x50, 0xc1, 0x6f, 0x73, 0x5f, 0x56,
    0xec, 0xbc, 0xa8, 0x7b, 0xd5, 0x7b, 0x29, 0xe7,
];

/// SRP group parameters.
struct Group {
    prime: BigUint,
    generator: BigUint,
    /// Multiplier `k = H(N | pad(g))`.
    multiplier: BigUint,
}

impl Group {
    fn new() -> Self {
        let prime = BigUint::from_bytes_be(&PRIME);
        let generator = BigUint::from(GENERATOR);
        let mut padded = vec![0u8; PRIME.len()];
        let g = generator.to_bytes_be();
        padded[PRIME.len() - g.len()..].copy_from_slice(&g);
        let multiplier = BigUint::from_bytes_be(
            &Sha1::new()
                .chain_update(PRIME)
                .chain_update(&padded)
                .finalize(),
        );
        Self {
            prime,
            generator,
            multiplier,
        }
    }
}

fn sha1_number(parts: &[&[u8]]) -> BigUint {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    BigUint::from_bytes_be(&hasher.finalize())
}

/// Client side of one SRP exchange.
pub struct SrpClient {
    group: Group,
    private_key: BigUint,
    public_key: BigUint,
    session_key: Option<Vec<u8>>,
}

impl SrpClient {
    pub fn new() -> Self {
        let private_key = rand::thread_rng().gen_biguint(PRIVATE_KEY_BITS);
        Self::with_private_key(private_key)
    }

    pub fn with_private_key(private_key: BigUint) -> Self {
        let group = Group::new();
        let public_key = group.generator.modpow(&private_key, &group.prime);
        Self {
            group,
            private_key,
            public_key,
            session_key: None,
        }
    }

    pub fn public_key(&self) -> &BigUint {
        &self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.to_bytes_be())
    }

    /// Session key, available after [`SrpClient::client_proof`].
    pub fn session_key(&self) -> Option<&[u8]> {
        self.session_key.as_deref()
    }

    /// Computes the client proof for the server's salt and public key.
    pub fn client_proof<D: Digest>(
        &mut self,
        user: &str,
        password: &str,
        server_data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let (salt, server_key) = parse_server_data(server_data)?;
        let group = &self.group;
        if (&server_key % &group.prime) == BigUint::from(0u32) {
            return Err(Error::AuthenticationFailed {
                causes: vec!["SRP server public key is invalid".to_string()],
            });
        }

        let a_bytes = self.public_key.to_bytes_be();
        let b_bytes = server_key.to_bytes_be();
        let scramble = sha1_number(&[&a_bytes, &b_bytes]);

        let user_hash = Sha1::new()
            .chain_update(user.as_bytes())
            .chain_update(b":")
            .chain_update(password.as_bytes())
            .finalize();
        let x = sha1_number(&[salt, &user_hash]);

        let gx = group.generator.modpow(&x, &group.prime);
        let kgx = (&group.multiplier * gx) % &group.prime;
        let diff = ((&server_key % &group.prime) + &group.prime - kgx) % &group.prime;
        let ux = (&scramble * &x) % &group.prime;
        let aux = (&self.private_key + ux) % &group.prime;
        let secret = diff.modpow(&aux, &group.prime);
        let session_key = Sha1::digest(secret.to_bytes_be()).to_vec();

        let n_hash = sha1_number(&[&group.prime.to_bytes_be()]);
        let g_hash = sha1_number(&[&group.generator.to_bytes_be()]);
        let group_hash = n_hash.modpow(&g_hash, &group.prime);
        let user_digest = Sha1::digest(user.as_bytes());

        let proof = D::new()
            .chain_update(group_hash.to_bytes_be())
            .chain_update(user_digest)
            .chain_update(salt)
            .chain_update(&a_bytes)
            .chain_update(&b_bytes)
            .chain_update(&session_key)
            .finalize()
            .to_vec();

        self.session_key = Some(session_key);
        Ok(proof)
    }
}

impl Default for SrpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_server_data(data: &[u8]) -> Result<(&[u8], BigUint), Error> {
    let malformed = || Error::AuthenticationFailed {
        causes: vec!["malformed SRP server data".to_string()],
    };
    let take_len = |at: usize| -> Result<usize, Error> {
        data.get(at..at + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .ok_or_else(malformed)
    };

    let salt_len = take_len(0)?;
    let salt = data.get(2..2 + salt_len).ok_or_else(malformed)?;
    let key_len = take_len(2 + salt_len)?;
    let key_start = 4 + salt_len;
    let key_hex = data.get(key_start..key_start + key_len).ok_or_else(malformed)?;
    let key = BigUint::parse_bytes(key_hex, 16).ok_or_else(malformed)?;
    Ok((salt, key))
}

/// SRP plugin whose client proof uses digest `D`.
pub struct SrpPlugin<D> {
    name: &'static str,
    client: Option<SrpClient>,
    client_data: Option<Vec<u8>>,
    server_data: Option<Vec<u8>>,
    digest: PhantomData<fn() -> D>,
}

impl<D: Digest> SrpPlugin<D> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            client: None,
            client_data: None,
            server_data: None,
            digest: PhantomData,
        }
    }
}

impl<D: Digest> AuthPlugin for SrpPlugin<D> {
    fn name(&self) -> &str {
        self.name
    }

    fn authenticate(&mut self, credentials: &Credentials) -> Result<AuthStatus, Error> {
        let (Some(user), Some(password)) = (
            credentials.normalized_login(),
            credentials.password.as_deref(),
        ) else {
            return Ok(AuthStatus::Continue);
        };

        if self.client.is_none() {
            let client = SrpClient::new();
            self.client_data = Some(client.public_key_hex().into_bytes());
            self.client = Some(client);
            return Ok(AuthStatus::MoreData);
        }
        if self.session_key().is_some() {
            return Err(Error::protocol(format!(
                "{} authentication called after the exchange completed",
                self.name
            )));
        }
        let (Some(client), Some(server_data)) = (
            self.client.as_mut(),
            self.server_data.as_deref().filter(|d| !d.is_empty()),
        ) else {
            return Ok(AuthStatus::MoreData);
        };

        let proof = client.client_proof::<D>(&user, password, server_data)?;
        self.client_data = Some(hex::encode(proof).into_bytes());
        Ok(AuthStatus::Success)
    }

    fn client_data(&self) -> Option<&[u8]> {
        self.client_data.as_deref()
    }

    fn set_server_data(&mut self, data: &[u8]) {
        self.server_data = Some(data.to_vec());
    }

    fn has_server_data(&self) -> bool {
        self.server_data.as_ref().is_some_and(|d| !d.is_empty())
    }

    fn session_key(&self) -> Option<&[u8]> {
        self.client.as_ref().and_then(SrpClient::session_key)
    }
}

struct SrpProvider<D> {
    name: &'static str,
    digest: PhantomData<fn() -> D>,
}

impl<D: Digest + 'static> AuthPluginProvider for SrpProvider<D> {
    fn name(&self) -> &str {
        self.name
    }

    fn create(&self) -> Box<dyn AuthPlugin> {
        Box::new(SrpPlugin::<D>::new(self.name))
    }
}

fn provider<D: Digest + 'static>(name: &'static str) -> Arc<dyn AuthPluginProvider> {
    Arc::new(SrpProvider::<D> {
        name,
        digest: PhantomData,
    })
}

/// Providers for every SRP variant.
pub fn providers() -> Vec<Arc<dyn AuthPluginProvider>> {
    vec![
        provider::<Sha256>("Srp256"),
        provider::<Sha1>("Srp"),
        provider::<Sha224>("Srp224"),
        provider::<Sha384>("Srp384"),
        provider::<Sha512>("Srp512"),
    ]
}
