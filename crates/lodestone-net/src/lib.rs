//! lodestone-net — the driver's I/O core: chunked framing, the Bolt
//! connection state machine, per-address and cluster-wide pools, routing
//! table maintenance, and the load balancer that ties them together.

pub mod balancer;
pub mod chunk;
pub mod cluster;
pub mod connection;
pub mod handshake;
pub mod pool;
pub mod routed;
pub mod routing;

#[cfg(test)]
pub(crate) mod testing;

pub use balancer::LoadBalancer;
pub use cluster::ClusterPool;
pub use connection::{BoltConnection, Collector, Connection, SharedCollector};
pub use pool::{ConnectionPool, Connector, PooledConnection, TcpConnector};
pub use routed::RoutedConnection;
pub use routing::{RoutingTable, RoutingTableManager};
