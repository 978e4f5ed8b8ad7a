//! Fault classification for routed connections.
//!
//! A `RoutedConnection` wraps a pooled session together with the access
//! mode it was borrowed for and a sink for topology side effects. Faults
//! crossing it are narrowed: a dead connection evicts its address and
//! purges its pool before surfacing as `SessionExpired`; a cluster-role
//! error on a writer demotes just that writer. Everything else passes
//! through untouched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use lodestone_core::address::{AccessMode, Address};
use lodestone_core::error::{Error, Result};
use lodestone_core::message::ResponseHandler;
use lodestone_core::value::Value;

use crate::connection::BoltConnection;

/// Receives the topology consequences of classified faults.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    /// The connection's host is unreachable: purge its pool and forget
    /// the address entirely.
    async fn on_connection_error(&self, address: &Address);
    /// The host refused a write in its current role: stop routing writes
    /// to it, but keep its pool — it still serves reads and routing.
    async fn on_write_error(&self, address: &Address);
}

pub struct RoutedConnection {
    inner: Box<dyn BoltConnection>,
    address: Address,
    mode: AccessMode,
    sink: Arc<dyn ErrorSink>,
}

impl std::fmt::Debug for RoutedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedConnection")
            .field("address", &self.address)
            .field("mode", &self.mode)
            .finish()
    }
}

impl RoutedConnection {
    pub fn new(
        inner: Box<dyn BoltConnection>,
        mode: AccessMode,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let address = inner.address().clone();
        RoutedConnection {
            inner,
            address,
            mode,
            sink,
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    async fn classify_error(
        address: Address,
        mode: AccessMode,
        sink: Arc<dyn ErrorSink>,
        error: Error,
    ) -> Error {
        if let Error::ServiceUnavailable(reason) = &error {
            tracing::warn!(address = %address, reason = %reason, "connection error");
            sink.on_connection_error(&address).await;
            return Error::SessionExpired(format!(
                "server at {address} is no longer available: {reason}",
            ));
        }
        if error.is_cluster_error() {
            return match mode {
                AccessMode::Read => {
                    Error::client("Write queries cannot be performed in READ access mode")
                }
                AccessMode::Write => {
                    tracing::warn!(address = %address, "server no longer accepts writes");
                    sink.on_write_error(&address).await;
                    Error::SessionExpired(format!("Server at {address} no longer accepts writes"))
                }
            };
        }
        error
    }
}

macro_rules! classified {
    ($self:ident, $call:expr) => {
        match $call.await {
            Ok(value) => Ok(value),
            Err(error) => {
                let address = $self.address.clone();
                let mode = $self.mode;
                let sink = Arc::clone(&$self.sink);
                Err(RoutedConnection::classify_error(address, mode, sink, error).await)
            }
        }
    };
}

#[async_trait]
impl BoltConnection for RoutedConnection {
    fn address(&self) -> &Address {
        &self.address
    }

    fn protocol_version(&self) -> u32 {
        self.inner.protocol_version()
    }

    fn server_agent(&self) -> Option<String> {
        self.inner.server_agent()
    }

    fn is_healthy(&self) -> bool {
        self.inner.is_healthy()
    }

    async fn run(
        &mut self,
        statement: &str,
        parameters: HashMap<String, Value>,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<()> {
        classified!(self, self.inner.run(statement, parameters, handler))
    }

    async fn pull_all(&mut self, handler: Box<dyn ResponseHandler>) -> Result<()> {
        classified!(self, self.inner.pull_all(handler))
    }

    async fn discard_all(&mut self, handler: Box<dyn ResponseHandler>) -> Result<()> {
        classified!(self, self.inner.discard_all(handler))
    }

    async fn sync(&mut self) -> Result<()> {
        classified!(self, self.inner.sync())
    }

    async fn reset(&mut self) -> Result<()> {
        classified!(self, self.inner.reset())
    }

    async fn close(&mut self) {
        self.inner.close().await
    }
}
