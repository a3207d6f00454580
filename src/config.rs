//! Client and server configuration.
//!
//! Both can be built in code or loaded from a JSON file. Durations are given in milliseconds in
//! files.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::protocol::TableId;

/// the address clients connect to and servers listen on when none is given
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:4580";

const DEFAULT_MAX_CONNECTIONS: usize = 8;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LISTEN_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);
// each open client connection holds a server worker: room for two default pools
const DEFAULT_SERVER_THREADS: u32 = 2 * DEFAULT_MAX_CONNECTIONS as u32;

/// Configuration of a [`MasterConnector`].
///
/// [`MasterConnector`]: ./struct.MasterConnector.html
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) addr: String,
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) max_connections: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) checkout_timeout: Duration,
    pub(crate) listen_timeout: Duration,
    pub(crate) monitor_invalidations: bool,
}

impl ClientConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// loads a configuration from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<ClientConfig> {
        let file: ClientConfigFile = serde_json::from_str(&fs::read_to_string(path)?)?;
        file.into_builder().build()
    }

    /// turns the configuration back into a builder, so single settings can be overridden
    pub fn into_builder(self) -> ClientConfigBuilder {
        ClientConfigBuilder {
            addr: self.addr,
            username: self.username,
            password: self.password,
            max_connections: self.max_connections,
            connect_timeout: self.connect_timeout,
            checkout_timeout: self.checkout_timeout,
            listen_timeout: self.listen_timeout,
            monitor_invalidations: self.monitor_invalidations,
        }
    }

    /// the `host:port` of the master server
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// the account name sent in the handshake
    pub fn username(&self) -> &str {
        &self.username
    }

    /// the most connections the pool will hold open
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// how long opening a socket may take
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// how long a request waits for a free pooled connection
    pub fn checkout_timeout(&self) -> Duration {
        self.checkout_timeout
    }

    /// how long a listening connection may stay silent before it is presumed dead
    pub fn listen_timeout(&self) -> Duration {
        self.listen_timeout
    }

    /// whether [`MasterConnector::connect`] starts the invalidation monitor
    ///
    /// [`MasterConnector::connect`]: ./struct.MasterConnector.html#method.connect
    pub fn monitor_invalidations(&self) -> bool {
        self.monitor_invalidations
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    addr: String,
    username: String,
    password: String,
    max_connections: usize,
    connect_timeout: Duration,
    checkout_timeout: Duration,
    listen_timeout: Duration,
    monitor_invalidations: bool,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        ClientConfigBuilder {
            addr: DEFAULT_ADDRESS.to_string(),
            username: String::new(),
            password: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
            listen_timeout: DEFAULT_LISTEN_TIMEOUT,
            monitor_invalidations: true,
        }
    }
}

impl ClientConfigBuilder {
    /// sets the `host:port` of the master server
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// sets the account name and password sent in the handshake
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// replaces only the password, keeping the account name
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// sets the most connections the pool will hold open
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// sets how long opening a socket may take
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// sets how long a request waits for a free pooled connection
    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    /// sets how long a listening connection may stay silent
    pub fn listen_timeout(mut self, timeout: Duration) -> Self {
        self.listen_timeout = timeout;
        self
    }

    /// sets whether the invalidation monitor starts on connect
    pub fn monitor_invalidations(mut self, monitor: bool) -> Self {
        self.monitor_invalidations = monitor;
        self
    }

    /// validates the settings
    ///
    /// # Errors
    /// returns [`CacheError::Config`] for an empty address or username, a zero sized pool or a
    /// zero timeout
    pub fn build(self) -> Result<ClientConfig> {
        if self.addr.trim().is_empty() {
            return Err(CacheError::Config("server address must not be empty".into()));
        }
        if self.username.is_empty() {
            return Err(CacheError::Config("username must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(CacheError::Config("max_connections must be at least 1".into()));
        }
        for (name, timeout) in [
            ("connect_timeout", self.connect_timeout),
            ("checkout_timeout", self.checkout_timeout),
            ("listen_timeout", self.listen_timeout),
        ] {
            if timeout.is_zero() {
                return Err(CacheError::Config(format!("{} must be greater than zero", name)));
            }
        }

        Ok(ClientConfig {
            addr: self.addr,
            username: self.username,
            password: self.password,
            max_connections: self.max_connections,
            connect_timeout: self.connect_timeout,
            checkout_timeout: self.checkout_timeout,
            listen_timeout: self.listen_timeout,
            monitor_invalidations: self.monitor_invalidations,
        })
    }
}

/// the on-disk form of a [`ClientConfig`]
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ClientConfigFile {
    addr: String,
    username: String,
    password: String,
    max_connections: usize,
    connect_timeout_ms: u64,
    checkout_timeout_ms: u64,
    listen_timeout_ms: u64,
    monitor_invalidations: bool,
}

impl Default for ClientConfigFile {
    fn default() -> Self {
        let defaults = ClientConfigBuilder::default();
        ClientConfigFile {
            addr: defaults.addr,
            username: defaults.username,
            password: defaults.password,
            max_connections: defaults.max_connections,
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            checkout_timeout_ms: defaults.checkout_timeout.as_millis() as u64,
            listen_timeout_ms: defaults.listen_timeout.as_millis() as u64,
            monitor_invalidations: defaults.monitor_invalidations,
        }
    }
}

impl ClientConfigFile {
    fn into_builder(self) -> ClientConfigBuilder {
        ClientConfig::builder()
            .addr(self.addr)
            .credentials(self.username, self.password)
            .max_connections(self.max_connections)
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .checkout_timeout(Duration::from_millis(self.checkout_timeout_ms))
            .listen_timeout(Duration::from_millis(self.listen_timeout_ms))
            .monitor_invalidations(self.monitor_invalidations)
    }
}

/// The thread pool implementation a server runs connections on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// [`SharedQueueThreadPool`](./thread_pool/struct.SharedQueueThreadPool.html)
    Shared,
    /// [`RayonThreadPool`](./thread_pool/struct.RayonThreadPool.html)
    Rayon,
}

impl FromStr for PoolKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shared" => Ok(PoolKind::Shared),
            "rayon" => Ok(PoolKind::Rayon),
            other => Err(CacheError::Parsing(format!(
                "unknown thread pool '{}', expected 'shared' or 'rayon'",
                other
            ))),
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Shared => write!(f, "shared"),
            PoolKind::Rayon => write!(f, "rayon"),
        }
    }
}

/// Configuration of the reference master server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// the `host:port` to listen on
    pub addr: String,
    /// the number of worker threads serving connections; each open client connection holds
    /// one, so this bounds the connections served at once
    pub threads: u32,
    /// the thread pool implementation
    pub pool: PoolKind,
    /// username -> password; an empty map accepts every handshake
    pub users: HashMap<String, String>,
    /// table -> tables that must be invalidated whenever it changes
    pub dependents: BTreeMap<TableId, Vec<TableId>>,
    /// how often an idle listening connection receives a keepalive frame
    pub keepalive_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: DEFAULT_ADDRESS.to_string(),
            threads: DEFAULT_SERVER_THREADS,
            pool: PoolKind::Shared,
            users: HashMap::new(),
            dependents: BTreeMap::new(),
            keepalive_ms: DEFAULT_KEEPALIVE.as_millis() as u64,
        }
    }
}

impl ServerConfig {
    /// loads a configuration from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<ServerConfig> {
        let config: ServerConfig = serde_json::from_str(&fs::read_to_string(path)?)?;
        if config.threads == 0 {
            return Err(CacheError::Config("threads must be at least 1".into()));
        }
        if config.keepalive_ms == 0 {
            return Err(CacheError::Config("keepalive_ms must be greater than zero".into()));
        }
        Ok(config)
    }

    /// the keepalive interval as a [`Duration`]
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builder_rejects_an_empty_pool() {
        let err = ClientConfig::builder()
            .credentials("admin", "secret")
            .max_connections(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn builder_requires_a_username() {
        assert!(ClientConfig::builder().build().is_err());
        let config = ClientConfig::builder().credentials("admin", "").build().unwrap();
        assert_eq!(config.addr(), DEFAULT_ADDRESS);
        assert_eq!(config.max_connections(), DEFAULT_MAX_CONNECTIONS);
        assert!(config.monitor_invalidations());
    }

    #[test]
    fn client_file_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "addr": "10.0.0.5:4580", "username": "noc", "checkout_timeout_ms": 250 }}"#
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.addr(), "10.0.0.5:4580");
        assert_eq!(config.username(), "noc");
        assert_eq!(config.checkout_timeout(), Duration::from_millis(250));
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);

        let overridden = config.into_builder().max_connections(2).build().unwrap();
        assert_eq!(overridden.username(), "noc");
        assert_eq!(overridden.max_connections(), 2);
    }

    #[test]
    fn server_file_reads_users_and_dependents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "pool": "rayon", "users": {{ "admin": "pw" }}, "dependents": {{ "3": [4, 5] }} }}"#
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.pool, PoolKind::Rayon);
        assert_eq!(config.users.get("admin").map(String::as_str), Some("pw"));
        assert_eq!(
            config.dependents.get(&TableId(3)),
            Some(&vec![TableId(4), TableId(5)])
        );
        assert_eq!(config.threads, DEFAULT_SERVER_THREADS);
    }

    #[test]
    fn unknown_pool_name_is_a_parsing_error() {
        assert_eq!("shared".parse::<PoolKind>().unwrap(), PoolKind::Shared);
        assert!(matches!(
            "fibers".parse::<PoolKind>().unwrap_err(),
            CacheError::Parsing(_)
        ));
    }
}
