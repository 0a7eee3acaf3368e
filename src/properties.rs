//! IPC transport properties.
//!
//! A properties file names the IPC type and carries transport specific keys.
//! Resolution goes through a fixed registry of providers, one per
//! [`IpcType`]; adding a transport means adding a provider, not touching
//! [`ProviderRegistry::resolve`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::endpoint::EndpointName;
use crate::error::IpcError;
use crate::identity::UserIdentity;

/// Flat string properties as read from a properties file.
pub type RawProperties = BTreeMap<String, String>;

const KEY_TYPE: &str = "type";
const KEY_TCP_HOST: &str = "tcp.host";
const KEY_TCP_PORT_PREFIX: &str = "tcp.port.";
const KEY_UNIX_DIR: &str = "unixsocket.dir";
const KEY_PIPE_PREFIX: &str = "winpipe.prefix";

const DEFAULT_TCP_HOST: &str = "127.0.0.1";
const DEFAULT_SOCKET_SUBDIR: &str = "jvm-agent-ipc";
const DEFAULT_PIPE_PREFIX: &str = "jvm-agent-ipc";

/// Supported IPC transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpcType {
    #[serde(rename = "socket")]
    Socket,
    #[serde(rename = "unix-socket")]
    UnixSocket,
    #[serde(rename = "winpipe")]
    WinPipe,
}

impl IpcType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::UnixSocket => "unix-socket",
            Self::WinPipe => "winpipe",
        }
    }
}

impl fmt::Display for IpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpcType {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "socket" => Ok(Self::Socket),
            "unix-socket" => Ok(Self::UnixSocket),
            "winpipe" => Ok(Self::WinPipe),
            other => Err(IpcError::UnknownIpcType(other.to_string())),
        }
    }
}

/// TCP transport: one host, one port per endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpProperties {
    host: String,
    ports: BTreeMap<EndpointName, u16>,
}

impl TcpProperties {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ports: BTreeMap::new(),
        }
    }

    /// Assign `port` to `endpoint`. Port 0 asks the listener for an ephemeral port.
    #[must_use]
    pub fn with_port(mut self, endpoint: EndpointName, port: u16) -> Self {
        self.ports.insert(endpoint, port);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self, endpoint: &EndpointName) -> Option<u16> {
        self.ports.get(endpoint).copied()
    }
}

/// UNIX domain socket transport rooted at a base directory.
///
/// Sockets live at `<socket_dir>/<username>/<endpoint>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixSocketProperties {
    socket_dir: PathBuf,
}

impl UnixSocketProperties {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Per-user rendezvous directory.
    pub fn user_dir(&self, user: &UserIdentity) -> PathBuf {
        self.socket_dir.join(&user.name)
    }

    pub fn socket_path(&self, user: &UserIdentity, endpoint: &EndpointName) -> PathBuf {
        self.user_dir(user).join(endpoint.as_str())
    }
}

/// Windows named pipe transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeProperties {
    prefix: String,
}

impl PipeProperties {
    pub fn new(prefix: impl Into<String>) -> Result<Self, IpcError> {
        let prefix = prefix.into();
        if !crate::endpoint::validate(&prefix) {
            return Err(IpcError::InvalidEndpointName(prefix));
        }
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full pipe path for `endpoint`, scoped to `user`.
    pub fn pipe_path(&self, user: &UserIdentity, endpoint: &EndpointName) -> String {
        format!(r"\\.\pipe\{}-{}-{}", self.prefix, user.name, endpoint)
    }
}

/// Resolved transport configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcProperties {
    Tcp(TcpProperties),
    UnixSocket(UnixSocketProperties),
    WinPipe(PipeProperties),
}

impl IpcProperties {
    pub const fn ipc_type(&self) -> IpcType {
        match self {
            Self::Tcp(_) => IpcType::Socket,
            Self::UnixSocket(_) => IpcType::UnixSocket,
            Self::WinPipe(_) => IpcType::WinPipe,
        }
    }
}

/// Builds [`IpcProperties`] for one IPC type.
pub trait PropertiesProvider: Send + Sync {
    fn ipc_type(&self) -> IpcType;

    /// Build properties from `raw`. `source` is the file `raw` came from; it is
    /// used for error messages and to anchor relative paths.
    fn create(&self, raw: &RawProperties, source: &Path) -> Result<IpcProperties, IpcError>;
}

struct TcpPropertiesProvider;

impl PropertiesProvider for TcpPropertiesProvider {
    fn ipc_type(&self) -> IpcType {
        IpcType::Socket
    }

    fn create(&self, raw: &RawProperties, source: &Path) -> Result<IpcProperties, IpcError> {
        let host = raw
            .get(KEY_TCP_HOST)
            .map_or(DEFAULT_TCP_HOST, String::as_str);
        let mut props = TcpProperties::new(host);

        for (key, value) in raw {
            let Some(name) = key.strip_prefix(KEY_TCP_PORT_PREFIX) else {
                continue;
            };
            let endpoint = EndpointName::new(name).map_err(|e| malformed(source, e.to_string()))?;
            let port: u16 = value
                .trim()
                .parse()
                .map_err(|_| malformed(source, format!("invalid port '{value}' for {key}")))?;
            props = props.with_port(endpoint, port);
        }

        Ok(IpcProperties::Tcp(props))
    }
}

struct UnixSocketPropertiesProvider;

impl PropertiesProvider for UnixSocketPropertiesProvider {
    fn ipc_type(&self) -> IpcType {
        IpcType::UnixSocket
    }

    fn create(&self, raw: &RawProperties, source: &Path) -> Result<IpcProperties, IpcError> {
        let dir = match raw.get(KEY_UNIX_DIR) {
            Some(dir) if dir.trim().is_empty() => {
                return Err(malformed(source, format!("{KEY_UNIX_DIR} is empty")));
            }
            Some(dir) => {
                let dir = PathBuf::from(dir.trim());
                if dir.is_absolute() {
                    dir
                } else {
                    source.parent().unwrap_or_else(|| Path::new(".")).join(dir)
                }
            }
            None => std::env::temp_dir().join(DEFAULT_SOCKET_SUBDIR),
        };
        Ok(IpcProperties::UnixSocket(UnixSocketProperties::new(dir)))
    }
}

struct PipePropertiesProvider;

impl PropertiesProvider for PipePropertiesProvider {
    fn ipc_type(&self) -> IpcType {
        IpcType::WinPipe
    }

    fn create(&self, raw: &RawProperties, source: &Path) -> Result<IpcProperties, IpcError> {
        let prefix = raw
            .get(KEY_PIPE_PREFIX)
            .map_or(DEFAULT_PIPE_PREFIX, String::as_str);
        let props = PipeProperties::new(prefix.trim()).map_err(|e| malformed(source, e.to_string()))?;
        Ok(IpcProperties::WinPipe(props))
    }
}

/// Fixed set of providers, built once at startup.
pub struct ProviderRegistry {
    providers: Vec<Box<dyn PropertiesProvider>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Box<dyn PropertiesProvider>>) -> Self {
        Self { providers }
    }

    /// Registry with the TCP, UNIX socket and named pipe providers.
    pub fn builtin() -> Self {
        Self::new(vec![
            Box::new(TcpPropertiesProvider),
            Box::new(UnixSocketPropertiesProvider),
            Box::new(PipePropertiesProvider),
        ])
    }

    /// Delegate to the single provider that handles `ipc_type`.
    pub fn resolve(
        &self,
        ipc_type: IpcType,
        raw: &RawProperties,
        source: &Path,
    ) -> Result<IpcProperties, IpcError> {
        let mut matching = self.providers.iter().filter(|p| p.ipc_type() == ipc_type);
        let provider = matching.next().ok_or(IpcError::NoProvider(ipc_type))?;
        let extra = matching.count();
        if extra > 0 {
            return Err(IpcError::AmbiguousProvider {
                ipc_type,
                count: extra + 1,
            });
        }
        provider.create(raw, source)
    }

    /// Read a properties file and resolve it.
    pub fn load(&self, path: &Path) -> Result<IpcProperties, IpcError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| malformed(path, format!("cannot read file: {e}")))?;
        let raw = parse_properties(&text, path)?;
        let ipc_type = raw
            .get(KEY_TYPE)
            .ok_or_else(|| malformed(path, format!("missing '{KEY_TYPE}' key")))?
            .parse::<IpcType>()?;
        debug!(path = %path.display(), ipc_type = %ipc_type, "Loaded IPC properties");
        self.resolve(ipc_type, &raw, path)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Parse a properties document: a JSON object of string keys to string values.
pub fn parse_properties(text: &str, path: &Path) -> Result<RawProperties, IpcError> {
    let raw: RawProperties =
        serde_json::from_str(text).map_err(|e| malformed(path, e.to_string()))?;
    for key in raw.keys() {
        if !is_known_key(key) {
            debug!(key = %key, path = %path.display(), "Ignoring unknown IPC property");
        }
    }
    Ok(raw)
}

fn is_known_key(key: &str) -> bool {
    matches!(key, KEY_TYPE | KEY_TCP_HOST | KEY_UNIX_DIR | KEY_PIPE_PREFIX)
        || key.starts_with(KEY_TCP_PORT_PREFIX)
}

fn malformed(path: &Path, reason: impl Into<String>) -> IpcError {
    IpcError::MalformedProperties {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
