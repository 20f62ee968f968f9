use crate::loader::ConfigError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where the engine connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Newline-delimited JSON over a Unix domain socket
    Unix(PathBuf),
    /// Newline-delimited JSON over TCP (`host:port`)
    Tcp(String),
    /// One JSON document per WebSocket text message
    WebSocket(String),
}

/// Get the default socket path
///
/// Priority:
/// 1. `CHAINRPC_SOCKET` environment variable (if set)
/// 2. `$XDG_RUNTIME_DIR/chainrpc.sock` (if a runtime dir exists)
/// 3. `/tmp/chainrpc.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("CHAINRPC_SOCKET") {
        return PathBuf::from(path);
    }
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("chainrpc.sock")
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            let path = path.trim_start_matches("//");
            if path.is_empty() {
                return Err(ConfigError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            let valid = addr
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(ConfigError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if let Some(rest) = s
            .strip_prefix("ws://")
            .or_else(|| s.strip_prefix("wss://"))
        {
            if rest.is_empty() {
                return Err(ConfigError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::WebSocket(s.to_string()));
        }
        if s.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        Err(ConfigError::InvalidEndpoint(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::WebSocket(url) => f.write_str(url),
        }
    }
}
