//! Driver configuration.
//!
//! Settings are immutable value objects handed to the driver at
//! construction; nothing here is process-global. Durations are carried
//! as `_ms` fields so a config file stays plain numbers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::value::Value;

/// Top-level driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-address cap on pooled connections.
    pub max_connection_pool_size: usize,
    /// How long an acquire may block when a pool is at capacity.
    pub connection_acquisition_timeout_ms: u64,
    /// TCP connect + handshake deadline.
    pub connect_timeout_ms: u64,
    /// Lower bound applied to the server-supplied routing table TTL.
    pub routing_table_ttl_floor_ms: u64,
    /// How many addresses the load balancer tries before giving up on a
    /// role.
    pub max_acquire_attempts: usize,
    /// Extra seed routers (URIs or `host:port`), folded in behind the
    /// address the driver was constructed with.
    pub initial_routers: Vec<String>,
    /// Sent in INIT as the client name.
    pub user_agent: String,
    pub encryption: EncryptionLevel,
    pub trust: TrustStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionLevel {
    Required,
    Optional,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustStrategy {
    All,
    SystemCa,
    CustomCa { path: PathBuf },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_connection_pool_size: 500,
            connection_acquisition_timeout_ms: 60_000,
            connect_timeout_ms: 5_000,
            routing_table_ttl_floor_ms: 5_000,
            max_acquire_attempts: 5,
            initial_routers: Vec::new(),
            user_agent: concat!("lodestone/", env!("CARGO_PKG_VERSION")).to_string(),
            encryption: EncryptionLevel::None,
            trust: TrustStrategy::SystemCa,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e.to_string()))?;
        toml::from_str(&text)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e.to_string()))
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_acquisition_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn routing_table_ttl_floor(&self) -> Duration {
        Duration::from_millis(self.routing_table_ttl_floor_ms)
    }
}

/// Opaque credential map passed through in INIT. The driver never
/// inspects it beyond forwarding.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthToken {
    entries: HashMap<String, Value>,
}

impl AuthToken {
    /// Username/password authentication.
    pub fn basic(principal: impl Into<String>, credentials: impl Into<String>) -> Self {
        let mut entries = HashMap::new();
        entries.insert("scheme".to_string(), Value::from("basic"));
        entries.insert("principal".to_string(), Value::from(principal.into()));
        entries.insert("credentials".to_string(), Value::from(credentials.into()));
        AuthToken { entries }
    }

    /// No authentication (servers with auth disabled).
    pub fn none() -> Self {
        let mut entries = HashMap::new();
        entries.insert("scheme".to_string(), Value::from("none"));
        AuthToken { entries }
    }

    /// A raw token for custom schemes.
    pub fn custom(entries: HashMap<String, Value>) -> Self {
        AuthToken { entries }
    }

    pub fn entries(&self) -> &HashMap<String, Value> {
        &self.entries
    }

    pub fn into_entries(self) -> HashMap<String, Value> {
        self.entries
    }
}
