//! Node addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A cluster node address: `(host, port)`.
///
/// This is the unique key for a node throughout the library. Hosts are
/// kept as strings rather than resolved IPs because that is what both
/// seed configuration and `CLUSTER SLOTS` replies carry.
///
/// `Ord` is lexicographic by host, then port, which gives deterministic
/// iteration wherever "any node" must be picked reproducibly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Addr {
    host: String,
    port: u16,
}

impl Addr {
    /// Creates an address from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host name or IP string.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<(&str, u16)> for Addr {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new(host, port)
    }
}

impl From<(String, u16)> for Addr {
    fn from((host, port): (String, u16)) -> Self {
        Self::new(host, port)
    }
}

/// Error returned when parsing a `host:port` string fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address: {0}")]
pub struct AddrParseError(pub String);

impl FromStr for Addr {
    type Err = AddrParseError;

    /// Parses `host:port`. The split is on the *last* colon so bracketless
    /// IPv6-ish hosts still land on the port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrParseError(s.to_string()))?;
        if host.is_empty() {
            return Err(AddrParseError(s.to_string()));
        }
        let port = port_str
            .parse()
            .map_err(|_| AddrParseError(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}
