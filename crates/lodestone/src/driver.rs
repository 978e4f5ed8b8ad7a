//! Driver assembly: URI scheme → provider stack.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use lodestone_core::address::{AccessMode, Address, Scheme};
use lodestone_core::config::{AuthToken, Config};
use lodestone_core::error::Result;
use lodestone_net::balancer::LoadBalancer;
use lodestone_net::cluster::ClusterPool;
use lodestone_net::connection::BoltConnection;
use lodestone_net::pool::{ConnectionPool, TcpConnector};
use lodestone_net::routing::{BoltRoutingProcedure, RoutingSettings, RoutingTableManager};

/// The seam the session layer consumes: borrow a connection fit for the
/// requested access mode.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self, mode: AccessMode) -> Result<Box<dyn BoltConnection>>;
    async fn close(&self);
}

pub struct Driver {
    provider: Arc<dyn ConnectionProvider>,
}

impl Driver {
    /// Build a driver for the given URI. `bolt://` talks to a single
    /// server; `bolt+routing://` discovers the cluster from the URI's
    /// host. No connection is opened until the first acquire.
    pub fn new(uri: &str, config: Config, auth: AuthToken) -> Result<Driver> {
        let address = Address::parse(uri)?;
        let provider: Arc<dyn ConnectionProvider> = match address.scheme() {
            Scheme::Bolt => {
                tracing::info!(address = %address, "direct driver");
                let connector = Arc::new(TcpConnector::new(config.clone(), auth));
                Arc::new(DirectProvider {
                    pool: ConnectionPool::new(address, connector, &config),
                })
            }
            Scheme::BoltRouting => {
                tracing::info!(address = %address, "routing driver");
                let mut seeds = vec![address];
                for raw in &config.initial_routers {
                    let seed = Address::parse(raw)?;
                    if !seeds.contains(&seed) {
                        seeds.push(seed);
                    }
                }
                let connector = Arc::new(TcpConnector::new(config.clone(), auth));
                let pool = Arc::new(ClusterPool::new(connector, config.clone()));
                let procedure = Arc::new(BoltRoutingProcedure::new(HashMap::new()));
                let manager = Arc::new(RoutingTableManager::new(
                    RoutingSettings {
                        seeds,
                        ttl_floor: config.routing_table_ttl_floor(),
                    },
                    Arc::clone(&pool),
                    procedure,
                ));
                let balancer =
                    LoadBalancer::new(manager, Arc::clone(&pool), config.max_acquire_attempts);
                Arc::new(RoutingProvider { balancer, pool })
            }
        };
        Ok(Driver { provider })
    }

    pub async fn acquire(&self, mode: AccessMode) -> Result<Box<dyn BoltConnection>> {
        self.provider.acquire(mode).await
    }

    /// Dispose every pool. In-flight connections finish their work and
    /// are destroyed on release.
    pub async fn close(&self) {
        self.provider.close().await;
    }
}

/// Single-server stack: one pool serves both access modes.
struct DirectProvider {
    pool: ConnectionPool,
}

#[async_trait]
impl ConnectionProvider for DirectProvider {
    async fn acquire(&self, _mode: AccessMode) -> Result<Box<dyn BoltConnection>> {
        Ok(Box::new(self.pool.acquire().await?))
    }

    async fn close(&self) {
        self.pool.dispose().await;
    }
}

/// Cluster stack: routing table + load balancer over the cluster pool.
struct RoutingProvider {
    balancer: LoadBalancer,
    pool: Arc<ClusterPool>,
}

#[async_trait]
impl ConnectionProvider for RoutingProvider {
    async fn acquire(&self, mode: AccessMode) -> Result<Box<dyn BoltConnection>> {
        Ok(Box::new(self.balancer.acquire(mode).await?))
    }

    async fn close(&self) {
        self.pool.dispose().await;
    }
}
