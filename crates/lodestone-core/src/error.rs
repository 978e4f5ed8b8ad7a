//! Driver error taxonomy.
//!
//! Server FAILURE messages carry a status code string such as
//! `Neo.ClientError.Security.Unauthorized`. The second segment selects the
//! broad class (ClientError / TransientError / DatabaseError); the rest
//! narrows it. `from_server_failure` folds a raw code into the variant the
//! rest of the driver reasons about.

use std::path::PathBuf;

/// Everything that can go wrong between enqueueing a request and seeing
/// its summary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A malformed marker, field count, chunk header, or an unexpected
    /// struct at value position. The connection that produced it must be
    /// closed, never reused.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The server rejected the credentials during INIT.
    #[error("authentication failed: {code}: {message}")]
    Authentication { code: String, message: String },

    /// Handshake or version-negotiation failure.
    #[error("security error: {0}")]
    Security(String),

    /// A fault on our side — a bad query reported by the server (carrying
    /// its status code) or a local misuse such as an exhausted acquisition
    /// timeout. The connection stays usable once any server failure is
    /// acknowledged.
    #[error("client error{}: {}", .code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default(), .message)]
    Client {
        code: Option<String>,
        message: String,
    },

    /// The server asked us to retry. Surfaced to the caller; the core does
    /// not retry on its own.
    #[error("{code}: {message}")]
    Transient { code: String, message: String },

    /// The connection's host can no longer serve the requested role. The
    /// routing layer consumes this to evict addresses.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// No path to any server in the required role.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Acquire against a disposed pool.
    #[error("pool closed")]
    PoolClosed,

    /// Configuration file problems. Grouped here so callers deal with a
    /// single error type.
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, String),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, String),
    #[error("invalid URI {0}: {1}")]
    InvalidUri(String, String),
}

const AUTH_CODES: &[&str] = &[
    "Neo.ClientError.Security.Unauthorized",
    "Neo.ClientError.Security.AuthenticationRateLimit",
    "Neo.ClientError.Security.CredentialsExpired",
];

const CLUSTER_CODES: &[&str] = &[
    "Neo.ClientError.Cluster.NotALeader",
    "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase",
];

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::ServiceUnavailable(msg.into())
    }

    /// A client-side misuse with no server status code behind it.
    pub fn client(msg: impl Into<String>) -> Self {
        Error::Client {
            code: None,
            message: msg.into(),
        }
    }

    /// Fold a server FAILURE into the taxonomy.
    pub fn from_server_failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        if AUTH_CODES.contains(&code.as_str()) {
            Error::Authentication { code, message }
        } else if code.starts_with("Neo.TransientError.") {
            Error::Transient { code, message }
        } else {
            Error::Client {
                code: Some(code),
                message,
            }
        }
    }

    /// Status code of a server-reported failure, if this error carries one.
    pub fn server_code(&self) -> Option<&str> {
        match self {
            Error::Authentication { code, .. } | Error::Transient { code, .. } => Some(code),
            Error::Client { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// True when the server that raised this cannot serve the request in
    /// its current cluster role (e.g. a follower asked to write).
    pub fn is_cluster_error(&self) -> bool {
        self.server_code()
            .map(|code| CLUSTER_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// True when the connection that surfaced this error must be torn
    /// down rather than returned to its pool.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::Security(_)
                | Error::ServiceUnavailable(_)
                | Error::SessionExpired(_)
        )
    }
}
