//! Role-aware connection acquisition.
//!
//! `acquire(mode)` refreshes the routing table when it is stale — under
//! a single-flight lock, so concurrent callers wait for the in-flight
//! refresh instead of stampeding the routers — then round-robins through
//! the role's ring, evicting addresses whose pools cannot produce a
//! connection, for a bounded number of attempts.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use lodestone_core::address::{AccessMode, Address};
use lodestone_core::error::{Error, Result};

use crate::cluster::ClusterPool;
use crate::routed::{ErrorSink, RoutedConnection};
use crate::routing::RoutingTableManager;

pub struct LoadBalancer {
    manager: Arc<RoutingTableManager>,
    pool: Arc<ClusterPool>,
    sink: Arc<TopologySink>,
    refresh_lock: Mutex<()>,
    max_attempts: usize,
}

impl LoadBalancer {
    pub fn new(
        manager: Arc<RoutingTableManager>,
        pool: Arc<ClusterPool>,
        max_attempts: usize,
    ) -> Self {
        let sink = Arc::new(TopologySink {
            manager: Arc::clone(&manager),
            pool: Arc::clone(&pool),
        });
        LoadBalancer {
            manager,
            pool,
            sink,
            refresh_lock: Mutex::new(()),
            max_attempts: max_attempts.max(1),
        }
    }

    /// A connection to a server currently serving `mode`, wrapped in the
    /// fault classifier.
    pub async fn acquire(&self, mode: AccessMode) -> Result<RoutedConnection> {
        self.ensure_fresh(mode).await?;

        for _ in 0..self.max_attempts {
            let Some(address) = self.manager.try_next(mode) else {
                if mode == AccessMode::Write && self.manager.reading_in_absence_of_writer() {
                    return Err(Error::client("Writes not supported in current topology"));
                }
                return Err(Error::unavailable(format!(
                    "no servers available for {mode} access"
                )));
            };

            match self.pool.acquire(&address).await {
                Ok(conn) => {
                    tracing::trace!(address = %address, mode = %mode, "connection acquired");
                    return Ok(RoutedConnection::new(
                        Box::new(conn),
                        mode,
                        Arc::clone(&self.sink) as Arc<dyn ErrorSink>,
                    ));
                }
                Err(Error::PoolClosed) => return Err(Error::PoolClosed),
                // Saturated pool: the server is fine, just busy. Move on
                // to the next ring member without evicting.
                Err(Error::Client { message, .. }) => {
                    tracing::debug!(address = %address, reason = %message, "pool exhausted, trying next");
                }
                Err(e) => {
                    tracing::warn!(address = %address, error = %e, "acquisition failed, evicting");
                    self.manager.remove(&address);
                }
            }
        }

        Err(Error::unavailable(format!(
            "could not acquire a {mode} connection after {} attempts",
            self.max_attempts
        )))
    }

    /// Refresh the routing table if stale; concurrent callers coalesce
    /// onto one in-flight refresh.
    async fn ensure_fresh(&self, mode: AccessMode) -> Result<()> {
        if !self.manager.is_stale(mode) {
            return Ok(());
        }
        let _guard = self.refresh_lock.lock().await;
        if self.manager.is_stale(mode) {
            self.manager.refresh().await?;
        }
        Ok(())
    }
}

/// Topology side effects of classified connection faults.
struct TopologySink {
    manager: Arc<RoutingTableManager>,
    pool: Arc<ClusterPool>,
}

#[async_trait]
impl ErrorSink for TopologySink {
    async fn on_connection_error(&self, address: &Address) {
        self.pool.purge(address).await;
        self.manager.remove(address);
    }

    async fn on_write_error(&self, address: &Address) {
        self.manager.remove_writer(address);
    }
}
