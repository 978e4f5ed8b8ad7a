//! Cluster-wide pool: one per-address pool for every server the routing
//! table currently names.
//!
//! The map itself is lock-free for readers; `update` and `dispose` are
//! serialized on a lifecycle lock so a topology update can never revive
//! a disposed pool. A pool created concurrently with `dispose` is torn
//! down before the error escapes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use lodestone_core::address::Address;
use lodestone_core::config::Config;
use lodestone_core::error::{Error, Result};

use crate::pool::{ConnectionPool, Connector, PooledConnection};

pub struct ClusterPool {
    pools: DashMap<Address, ConnectionPool>,
    connector: Arc<dyn Connector>,
    config: Config,
    disposed: AtomicBool,
    lifecycle: Mutex<()>,
}

impl ClusterPool {
    pub fn new(connector: Arc<dyn Connector>, config: Config) -> Self {
        ClusterPool {
            pools: DashMap::new(),
            connector,
            config,
            disposed: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.pools.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Borrow an initialized connection to `address`, creating the pool
    /// on first use.
    pub async fn acquire(&self, address: &Address) -> Result<PooledConnection> {
        let pool = self.ensure_pool(address).await?;
        pool.acquire().await
    }

    /// Register addresses ahead of a routing-table prepend so that
    /// acquisitions against them succeed.
    pub async fn add(&self, addresses: &[Address]) -> Result<()> {
        for address in addresses {
            self.ensure_pool(address).await?;
        }
        Ok(())
    }

    /// Reshape the pool set to exactly `keep`: new addresses get fresh
    /// pools, departed addresses have theirs disposed and removed.
    pub async fn update(&self, keep: &HashSet<Address>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_disposed() {
            return Err(Error::PoolClosed);
        }

        for address in keep {
            if !self.pools.contains_key(address) {
                self.pools
                    .insert(address.clone(), self.new_pool(address));
                tracing::debug!(address = %address, "pool added");
            }
        }

        let departed: Vec<Address> = self
            .pools
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|address| !keep.contains(address))
            .collect();
        for address in departed {
            if let Some((_, pool)) = self.pools.remove(&address) {
                pool.dispose().await;
                tracing::debug!(address = %address, "pool removed");
            }
        }
        Ok(())
    }

    /// Dispose and drop the pool for one failing address.
    pub async fn purge(&self, address: &Address) {
        if let Some((_, pool)) = self.pools.remove(address) {
            pool.dispose().await;
            tracing::info!(address = %address, "pool purged");
        }
    }

    /// Dispose every pool and refuse all future work.
    pub async fn dispose(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let all: Vec<ConnectionPool> = self
            .pools
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.pools.clear();
        for pool in all {
            pool.dispose().await;
        }
        tracing::debug!("cluster pool disposed");
    }

    fn new_pool(&self, address: &Address) -> ConnectionPool {
        ConnectionPool::new(address.clone(), Arc::clone(&self.connector), &self.config)
    }

    async fn ensure_pool(&self, address: &Address) -> Result<ConnectionPool> {
        if self.is_disposed() {
            return Err(Error::PoolClosed);
        }
        let pool = self
            .pools
            .entry(address.clone())
            .or_insert_with(|| self.new_pool(address))
            .clone();
        // A dispose may have raced the insert; tear the new pool down
        // before reporting the closure.
        if self.is_disposed() {
            pool.dispose().await;
            self.pools.remove(address);
            return Err(Error::PoolClosed);
        }
        Ok(pool)
    }
}
