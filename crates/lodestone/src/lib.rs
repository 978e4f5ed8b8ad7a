//! lodestone — a Bolt-protocol graph database driver with causal-cluster
//! routing.
//!
//! Construct a [`Driver`] from a `bolt://` (single server) or
//! `bolt+routing://` (cluster) URI, then borrow connections per access
//! mode:
//!
//! ```no_run
//! use lodestone::{AccessMode, AuthToken, BoltConnection, Config, Driver, SharedCollector};
//!
//! # async fn example() -> lodestone::Result<()> {
//! let driver = Driver::new(
//!     "bolt+routing://cluster.example.com:7687",
//!     Config::default(),
//!     AuthToken::basic("neo4j", "secret"),
//! )?;
//!
//! let mut conn = driver.acquire(AccessMode::Read).await?;
//! let rows = SharedCollector::new();
//! conn.run("RETURN 1 AS n", Default::default(), rows.handler()).await?;
//! conn.pull_all(rows.handler()).await?;
//! conn.sync().await?;
//! # Ok(())
//! # }
//! ```

mod driver;

pub use driver::{ConnectionProvider, Driver};

pub use lodestone_core::address::{AccessMode, Address, Scheme};
pub use lodestone_core::config::{AuthToken, Config, EncryptionLevel, TrustStrategy};
pub use lodestone_core::error::{Error, Result};
pub use lodestone_core::graph::{Node, Path, Relationship, UnboundRelationship};
pub use lodestone_core::message::ResponseHandler;
pub use lodestone_core::value::Value;
pub use lodestone_net::connection::{BoltConnection, Collector, SharedCollector};
