//! Connection configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via FBWIRE_CONFIG)
//! 3. Environment variables

use fbwire_protocol::consts::{WIRE_CRYPT_DISABLED, WIRE_CRYPT_ENABLED, WIRE_CRYPT_REQUIRED};
use fbwire_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Wire encryption requirement of the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireCrypt {
    /// Never encrypt.
    Disabled,
    /// Encrypt when both sides support it.
    #[default]
    Enabled,
    /// Fail the connection unless encryption is established.
    Required,
}

impl WireCrypt {
    /// Value sent in the `CNCT_client_crypt` clumplet.
    pub fn wire_value(self) -> i32 {
        match self {
            WireCrypt::Disabled => WIRE_CRYPT_DISABLED,
            WireCrypt::Enabled => WIRE_CRYPT_ENABLED,
            WireCrypt::Required => WIRE_CRYPT_REQUIRED,
        }
    }
}

impl FromStr for WireCrypt {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" | "false" => Ok(WireCrypt::Disabled),
            "enabled" | "true" => Ok(WireCrypt::Enabled),
            "required" => Ok(WireCrypt::Required),
            other => Err(ConfigError::ValidationError(format!(
                "unknown wire_crypt value '{}'",
                other
            ))),
        }
    }
}

/// Parameters of a connection and its database attachment.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Database path or alias on the server.
    pub database: String,
    /// Login name.
    pub user: Option<String>,
    /// Password; never written back out.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub role: Option<String>,
    /// Authentication plugins in preference order.
    pub auth_plugins: Vec<String>,
    pub wire_crypt: WireCrypt,
    /// Protocol versions to offer (empty = every supported version).
    pub protocol_versions: Vec<u32>,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Socket read timeout in seconds (None = block until data arrives).
    pub socket_timeout_secs: Option<u64>,
    /// Connection character set.
    pub charset: String,
    pub sql_dialect: i32,
    pub process_name: Option<String>,
    pub process_id: Option<u32>,
    /// Statement info buffer size requested on prepare (None = protocol maximum).
    pub statement_info_size: Option<i32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: String::new(),
            user: None,
            password: None,
            role: None,
            auth_plugins: vec!["Srp256".to_string(), "Srp".to_string()],
            wire_crypt: WireCrypt::Enabled,
            protocol_versions: Vec::new(),
            connect_timeout_secs: 10,
            socket_timeout_secs: None,
            charset: "UTF8".to_string(),
            sql_dialect: 3,
            process_name: None,
            process_id: None,
            statement_info_size: None,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("role", &self.role)
            .field("auth_plugins", &self.auth_plugins)
            .field("wire_crypt", &self.wire_crypt)
            .field("protocol_versions", &self.protocol_versions)
            .field("charset", &self.charset)
            .field("sql_dialect", &self.sql_dialect)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("FBWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ConnectionConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies `FBWIRE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("FBWIRE_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("FBWIRE_PORT") {
            self.port = port
                .parse()
                .map_err(|_| ConfigError::ValidationError(format!("invalid port '{}'", port)))?;
        }
        if let Some(database) = lookup("FBWIRE_DATABASE") {
            self.database = database;
        }
        if let Some(user) = lookup("FBWIRE_USER") {
            self.user = Some(user);
        }
        if let Some(password) = lookup("FBWIRE_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(role) = lookup("FBWIRE_ROLE") {
            self.role = Some(role);
        }
        if let Some(plugins) = lookup("FBWIRE_AUTH_PLUGINS") {
            self.auth_plugins = split_list(&plugins);
        }
        if let Some(crypt) = lookup("FBWIRE_WIRE_CRYPT") {
            self.wire_crypt = crypt.parse()?;
        }
        if let Some(versions) = lookup("FBWIRE_PROTOCOL_VERSIONS") {
            self.protocol_versions = split_list(&versions)
                .iter()
                .map(|v| {
                    v.parse().map_err(|_| {
                        ConfigError::ValidationError(format!("invalid protocol version '{}'", v))
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(charset) = lookup("FBWIRE_CHARSET") {
            self.charset = charset;
        }
        if let Some(timeout) = lookup("FBWIRE_CONNECT_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.connect_timeout_secs = secs;
            }
        }
        Ok(())
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_auth_plugins<I, S>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auth_plugins = plugins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_wire_crypt(mut self, wire_crypt: WireCrypt) -> Self {
        self.wire_crypt = wire_crypt;
        self
    }

    pub fn with_protocol_versions(mut self, versions: &[u32]) -> Self {
        self.protocol_versions = versions.to_vec();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn with_sql_dialect(mut self, dialect: i32) -> Self {
        self.sql_dialect = dialect;
        self
    }

    pub fn with_process(mut self, name: impl Into<String>, id: u32) -> Self {
        self.process_name = Some(name.into());
        self.process_id = Some(id);
        self
    }

    pub fn with_statement_info_size(mut self, size: i32) -> Self {
        self.statement_info_size = Some(size);
        self
    }

    /// Returns `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout_secs.map(Duration::from_secs)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::ValidationError("host not set".to_string()));
        }
        if self.database.is_empty() {
            return Err(ConfigError::ValidationError("database not set".to_string()));
        }
        if self.sql_dialect != 1 && self.sql_dialect != 3 {
            return Err(ConfigError::ValidationError(format!(
                "unsupported SQL dialect {}",
                self.sql_dialect
            )));
        }
        if self.auth_plugins.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one authentication plugin is required".to_string(),
            ));
        }
        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
