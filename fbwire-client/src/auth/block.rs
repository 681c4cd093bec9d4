//! Per-connection authentication state.

use super::{AuthPlugin, AuthPluginProvider, AuthPluginRegistry, AuthStatus, Credentials};
use crate::crypt::{self, KnownServerKey};
use crate::error::Error;
use std::sync::Arc;
use tracing::{debug, warn};

/// Drives the configured authentication plugins through one exchange.
pub struct ClientAuthBlock {
    credentials: Credentials,
    /// Remaining providers in preference order.
    providers: Vec<Arc<dyn AuthPluginProvider>>,
    current: Option<Box<dyn AuthPlugin>>,
    complete: bool,
    plugin_list_sent: bool,
    server_keys: Vec<KnownServerKey>,
    failures: Vec<String>,
}

impl ClientAuthBlock {
    /// Resolves `plugin_names` against the registry; unknown names are skipped.
    pub fn new(
        registry: &AuthPluginRegistry,
        plugin_names: &[String],
        credentials: Credentials,
    ) -> Result<Self, Error> {
        let mut providers = Vec::with_capacity(plugin_names.len());
        for name in plugin_names {
            match registry.get(name) {
                Some(provider) => providers.push(provider),
                None => warn!("authentication plugin '{}' is not available", name),
            }
        }
        if providers.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "none of the authentication plugins {:?} is available",
                plugin_names
            )));
        }
        Ok(Self {
            credentials,
            providers,
            current: None,
            complete: false,
            plugin_list_sent: false,
            server_keys: Vec::new(),
            failures: Vec::new(),
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Names of the remaining plugins, comma separated.
    pub fn plugin_names(&self) -> String {
        self.providers
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The plugin list for the first `op_cont_auth`, `None` afterwards.
    pub fn take_plugin_list(&mut self) -> Option<String> {
        if self.plugin_list_sent {
            return None;
        }
        self.plugin_list_sent = true;
        Some(self.plugin_names())
    }

    pub fn current_plugin_name(&self) -> Option<&str> {
        self.current.as_ref().map(|p| p.name())
    }

    pub fn client_data(&self) -> Option<&[u8]> {
        self.current.as_ref().and_then(|p| p.client_data())
    }

    pub fn set_server_data(&mut self, data: &[u8]) {
        if let Some(plugin) = self.current.as_mut() {
            plugin.set_server_data(data);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn set_complete(&mut self, complete: bool) {
        self.complete = complete;
    }

    /// Starts the exchange with the first plugin that accepts the credentials.
    pub fn start(&mut self) -> Result<AuthStatus, Error> {
        while let Some(provider) = self.providers.first().cloned() {
            let mut plugin = provider.create();
            match plugin.authenticate(&self.credentials) {
                Ok(AuthStatus::Continue) => {
                    debug!("authentication plugin {} skipped", provider.name());
                    self.failures
                        .push(format!("{}: credentials not usable", provider.name()));
                }
                Ok(status) => {
                    self.current = Some(plugin);
                    return Ok(status);
                }
                Err(e) => self.failures.push(format!("{}: {}", provider.name(), e)),
            }
            self.providers.remove(0);
        }
        self.current = None;
        Err(self.failed("no authentication plugin could start"))
    }

    /// Runs the next step of the current plugin.
    pub fn authenticate(&mut self) -> Result<AuthStatus, Error> {
        let Some(plugin) = self.current.as_mut() else {
            return self.start();
        };
        match plugin.authenticate(&self.credentials) {
            Ok(AuthStatus::Continue) => {
                let cause = format!("{}: credentials not usable", plugin.name());
                self.failures.push(cause);
                Err(self.failed("authentication plugin gave up"))
            }
            Ok(status) => Ok(status),
            Err(e) => {
                let cause = format!("{}: {}", plugin.name(), e);
                self.failures.push(cause);
                Err(self.failed("authentication plugin failed"))
            }
        }
    }

    /// Switches to the plugin the server asked for, dropping the providers
    /// listed before it. Returns `false` when no such plugin remains.
    pub fn switch_plugin(&mut self, name: &str) -> bool {
        if self.current_plugin_name() == Some(name) {
            return true;
        }
        match self.providers.iter().position(|p| p.name() == name) {
            Some(index) => {
                self.providers.drain(..index);
                self.current = Some(self.providers[0].create());
                debug!("switched to authentication plugin {}", name);
                true
            }
            None => {
                self.failures
                    .push(format!("server requested unsupported plugin '{}'", name));
                false
            }
        }
    }

    /// Keeps only the plugins the server reports it knows.
    pub fn restrict_to_server_plugins(&mut self, server_keys: &[u8]) -> Result<(), Error> {
        let known = crypt::known_auth_plugins(server_keys)?;
        if known.is_empty() {
            return Ok(());
        }
        self.providers.retain(|p| known.iter().any(|k| k == p.name()));
        let current_known = self
            .current_plugin_name()
            .map_or(true, |name| known.iter().any(|k| k == name));
        if !current_known {
            self.current = None;
        }
        Ok(())
    }

    /// Records keys the server offered for wire encryption.
    pub fn add_server_keys(&mut self, data: &[u8]) -> Result<(), Error> {
        if !data.is_empty() {
            self.server_keys.extend(KnownServerKey::parse_all(data)?);
        }
        Ok(())
    }

    pub fn server_keys(&self) -> &[KnownServerKey] {
        &self.server_keys
    }

    pub fn session_key(&self) -> Option<Vec<u8>> {
        self.current
            .as_ref()
            .and_then(|p| p.session_key())
            .map(<[u8]>::to_vec)
    }

    /// Failure causes collected so far plus `reason`.
    pub fn failed(&self, reason: &str) -> Error {
        let mut causes = self.failures.clone();
        causes.push(reason.to_string());
        Error::AuthenticationFailed { causes }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fbwire_protocol::consts::{TAG_KEY_PLUGINS, TAG_KEY_TYPE, TAG_KNOWN_PLUGINS};

    /// Plugin echoing fixed data; completes after one server reply.
    pub(crate) struct EchoPlugin {
        name: &'static str,
        data: Vec<u8>,
        server_data: Option<Vec<u8>>,
        give_up: bool,
    }

    impl AuthPlugin for EchoPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn authenticate(&mut self, _credentials: &Credentials) -> Result<AuthStatus, Error> {
            if self.give_up {
                return Ok(AuthStatus::Continue);
            }
            match self.server_data.take() {
                Some(reply) => {
                    self.data = reply.iter().rev().copied().collect();
                    Ok(AuthStatus::Success)
                }
                None => Ok(AuthStatus::MoreData),
            }
        }

        fn client_data(&self) -> Option<&[u8]> {
            Some(&self.data)
        }

        fn set_server_data(&mut self, data: &[u8]) {
            self.server_data = Some(data.to_vec());
        }

        fn has_server_data(&self) -> bool {
            self.server_data.is_some()
        }

        fn session_key(&self) -> Option<&[u8]> {
            Some(&[0x5a; 20])
        }
    }

    pub(crate) struct EchoProvider {
        pub(crate) name: &'static str,
        pub(crate) give_up: bool,
    }

    impl AuthPluginProvider for EchoProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn create(&self) -> Box<dyn AuthPlugin> {
            Box::new(EchoPlugin {
                name: self.name,
                data: self.name.as_bytes().to_vec(),
                server_data: None,
                give_up: self.give_up,
            })
        }
    }

    pub(crate) fn echo_registry() -> AuthPluginRegistry {
        let mut registry = AuthPluginRegistry::empty();
        registry.register(Arc::new(EchoProvider {
            name: "Lazy",
            give_up: true,
        }));
        registry.register(Arc::new(EchoProvider {
            name: "EchoA",
            give_up: false,
        }));
        registry.register(Arc::new(EchoProvider {
            name: "EchoB",
            give_up: false,
        }));
        registry.register(Arc::new(EchoProvider {
            name: "EchoC",
            give_up: false,
        }));
        registry
    }

    fn block(names: &[&str]) -> ClientAuthBlock {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        ClientAuthBlock::new(&echo_registry(), &names, Credentials::default()).unwrap()
    }

    #[test]
    fn test_start_skips_plugins_that_give_up() {
        let mut auth = block(&["Lazy", "EchoA", "EchoB"]);
        assert_eq!(auth.start().unwrap(), AuthStatus::MoreData);
        assert_eq!(auth.current_plugin_name(), Some("EchoA"));
        assert_eq!(auth.client_data(), Some(&b"EchoA"[..]));
        assert_eq!(auth.plugin_names(), "EchoA,EchoB");
    }

    #[test]
    fn test_exhausted_plugins_fail_with_causes() {
        let mut auth = block(&["Lazy"]);
        match auth.start() {
            Err(Error::AuthenticationFailed { causes }) => {
                assert!(causes[0].contains("Lazy"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unknown_plugins_are_skipped() {
        let mut auth = block(&["Missing", "EchoB"]);
        assert_eq!(auth.plugin_names(), "EchoB");
        assert!(auth.start().is_ok());

        let names = vec!["Missing".to_string()];
        assert!(ClientAuthBlock::new(&echo_registry(), &names, Credentials::default()).is_err());
    }

    #[test]
    fn test_switch_plugin() {
        let mut auth = block(&["EchoA", "EchoB"]);
        auth.start().unwrap();
        assert!(auth.switch_plugin("EchoA"));
        assert!(auth.switch_plugin("EchoB"));
        assert_eq!(auth.current_plugin_name(), Some("EchoB"));
        assert_eq!(auth.plugin_names(), "EchoB");
        assert!(!auth.switch_plugin("EchoA"));
    }

    #[test]
    fn test_exchange() {
        let mut auth = block(&["EchoA"]);
        auth.start().unwrap();
        auth.set_server_data(b"abc");
        assert_eq!(auth.authenticate().unwrap(), AuthStatus::Success);
        assert_eq!(auth.client_data(), Some(&b"cba"[..]));
        assert_eq!(auth.session_key().unwrap().len(), 20);
    }

    #[test]
    fn test_plugin_list_sent_once() {
        let mut auth = block(&["EchoA", "EchoB"]);
        assert_eq!(auth.take_plugin_list().as_deref(), Some("EchoA,EchoB"));
        assert_eq!(auth.take_plugin_list(), None);
    }

    #[test]
    fn test_server_keys() {
        let mut auth = block(&["EchoA", "EchoB"]);
        auth.start().unwrap();
        let keys = crate::crypt::tests::keys_buffer(&[
            (TAG_KNOWN_PLUGINS, b"EchoB"),
            (TAG_KEY_TYPE, b"Symmetric"),
            (TAG_KEY_PLUGINS, b"Arc4"),
        ]);
        auth.restrict_to_server_plugins(&keys).unwrap();
        assert_eq!(auth.plugin_names(), "EchoB");
        assert_eq!(auth.current_plugin_name(), None);

        auth.add_server_keys(&keys).unwrap();
        assert_eq!(auth.server_keys().len(), 1);
        assert_eq!(auth.server_keys()[0].plugins, vec!["Arc4"]);
    }
}
