//! Client authentication plugins.
//!
//! An authentication plugin produces client data for each round of the
//! exchange and consumes the data the server sends back. The
//! [`ClientAuthBlock`] walks the configured plugins in preference order and
//! switches when the server asks for a different one.

pub(crate) mod block;
pub mod srp;

pub use block::ClientAuthBlock;

use crate::error::Error;
use std::fmt;
use std::sync::Arc;

/// Outcome of one authentication step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// The plugin finished its part of the exchange.
    Success,
    /// The plugin produced data and expects a server reply.
    MoreData,
    /// The plugin cannot work with these credentials; try the next one.
    Continue,
}

/// Login name and password used by authentication plugins.
#[derive(Clone, Default)]
pub struct Credentials {
    pub login: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(login: Option<String>, password: Option<String>) -> Self {
        Self { login, password }
    }

    /// The login as the server stores it: unquoted names are upper-cased,
    /// quoted names lose their quotes and `""` collapses to `"`.
    pub fn normalized_login(&self) -> Option<String> {
        self.login.as_deref().map(normalize_login)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

fn normalize_login(login: &str) -> String {
    if login.len() >= 2 && login.starts_with('"') && login.ends_with('"') {
        login[1..login.len() - 1].replace("\"\"", "\"")
    } else {
        login.to_uppercase()
    }
}

/// One instance of an authentication plugin for a single exchange.
pub trait AuthPlugin: Send {
    fn name(&self) -> &str;

    /// Runs the next step, producing client data when it returns
    /// [`AuthStatus::MoreData`] or [`AuthStatus::Success`].
    fn authenticate(&mut self, credentials: &Credentials) -> Result<AuthStatus, Error>;

    /// Data to send to the server for the last step.
    fn client_data(&self) -> Option<&[u8]>;

    fn set_server_data(&mut self, data: &[u8]);

    fn has_server_data(&self) -> bool;

    /// Session key for wire encryption, once the exchange completed.
    fn session_key(&self) -> Option<&[u8]> {
        None
    }
}

/// Factory for plugin instances.
pub trait AuthPluginProvider: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self) -> Box<dyn AuthPlugin>;
}

/// Authentication plugins available to connections.
#[derive(Clone)]
pub struct AuthPluginRegistry {
    providers: Vec<Arc<dyn AuthPluginProvider>>,
}

impl Default for AuthPluginRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for provider in srp::providers() {
            registry.register(provider);
        }
        registry
    }
}

impl AuthPluginRegistry {
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Adds a provider, replacing one with the same name.
    pub fn register(&mut self, provider: Arc<dyn AuthPluginProvider>) {
        self.providers.retain(|p| p.name() != provider.name());
        self.providers.push(provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AuthPluginProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

impl fmt::Debug for AuthPluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
