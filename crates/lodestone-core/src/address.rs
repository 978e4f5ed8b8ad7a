//! Server endpoint identity.
//!
//! Addresses compare case-insensitively on host and never resolve
//! hostnames — `localhost:7687` and `127.0.0.1:7687` are two different
//! addresses even when they name the same machine. Routing tables,
//! pools, and eviction all key on this identity, so resolution at
//! comparison time would make topology updates non-deterministic.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{ConfigError, Error, Result};

pub const DEFAULT_PORT: u16 = 7687;

/// Whether an endpoint was named for direct or routed use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Bolt,
    BoltRouting,
}

/// The role a caller needs a server for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => write!(f, "READ"),
            AccessMode::Write => write!(f, "WRITE"),
        }
    }
}

#[derive(Debug, Clone, Eq)]
pub struct Address {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Address {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Address {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Parse either a full `bolt://` / `bolt+routing://` URI or a bare
    /// `host[:port]` endpoint as they appear in routing records.
    pub fn parse(input: &str) -> Result<Self> {
        if input.contains("://") {
            let uri = url::Url::parse(input)
                .map_err(|e| invalid(input, e.to_string()))?;
            let scheme = match uri.scheme() {
                "bolt" => Scheme::Bolt,
                "bolt+routing" => Scheme::BoltRouting,
                other => return Err(invalid(input, format!("unsupported scheme {other:?}"))),
            };
            let host = uri
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| invalid(input, "missing host".to_string()))?;
            Ok(Address::new(scheme, host, uri.port().unwrap_or(DEFAULT_PORT)))
        } else {
            let (host, port) = match input.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse()
                        .map_err(|_| invalid(input, format!("bad port {port:?}")))?;
                    (host, port)
                }
                None => (input, DEFAULT_PORT),
            };
            if host.is_empty() {
                return Err(invalid(input, "missing host".to_string()));
            }
            Ok(Address::new(Scheme::Bolt, host, port))
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` as handed to the connector.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Identity is host + port; the scheme records how the address was named,
// not where it points.
impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.host.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_u16(self.port);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn invalid(input: &str, reason: String) -> Error {
    Error::Config(ConfigError::InvalidUri(input.to_string(), reason))
}
