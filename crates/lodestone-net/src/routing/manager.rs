//! Routing table maintenance.
//!
//! A refresh walks the routers ring: routers we cannot reach, or whose
//! session dies mid-call, are evicted and the walk continues. Faults
//! that implicate the caller or the cluster as a whole — authentication,
//! protocol violations, a server without routing support — propagate
//! immediately. When the ring is exhausted the seed routers are folded
//! back in (untried ones only) for one more pass.
//!
//! The table itself is only ever mutated under the manager's lock; the
//! lock is never held across an await.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lodestone_core::address::{AccessMode, Address};
use lodestone_core::error::{Error, Result};

use super::procedure::RoutingProcedure;
use super::table::RoutingTable;
use crate::cluster::ClusterPool;

/// Immutable routing inputs fixed at driver construction.
#[derive(Debug, Clone)]
pub struct RoutingSettings {
    /// Initial `bolt+routing` routers, retried when discovery runs dry.
    pub seeds: Vec<Address>,
    /// Lower bound on the server-supplied table TTL.
    pub ttl_floor: Duration,
}

pub struct RoutingTableManager {
    table: Mutex<RoutingTable>,
    reading_in_absence_of_writer: AtomicBool,
    pool: Arc<ClusterPool>,
    procedure: Arc<dyn RoutingProcedure>,
    settings: RoutingSettings,
}

impl RoutingTableManager {
    pub fn new(
        settings: RoutingSettings,
        pool: Arc<ClusterPool>,
        procedure: Arc<dyn RoutingProcedure>,
    ) -> Self {
        RoutingTableManager {
            table: Mutex::new(RoutingTable::seeded(settings.seeds.clone())),
            reading_in_absence_of_writer: AtomicBool::new(false),
            pool,
            procedure,
            settings,
        }
    }

    pub fn is_stale(&self, mode: AccessMode) -> bool {
        self.lock_table().is_stale(mode)
    }

    pub fn try_next(&self, mode: AccessMode) -> Option<Address> {
        self.lock_table().try_next(mode)
    }

    pub fn reading_in_absence_of_writer(&self) -> bool {
        self.reading_in_absence_of_writer.load(Ordering::SeqCst)
    }

    /// Evict an address from every ring, e.g. after a transport fault.
    pub fn remove(&self, address: &Address) {
        tracing::info!(address = %address, "removing address from routing table");
        self.lock_table().remove(address);
    }

    /// Evict an address from the writers ring only; it may still serve
    /// reads and routing.
    pub fn remove_writer(&self, address: &Address) {
        tracing::info!(address = %address, "removing writer from routing table");
        self.lock_table().remove_writer(address);
    }

    pub fn routers(&self) -> Vec<Address> {
        self.lock_table().routers()
    }

    pub fn readers(&self) -> Vec<Address> {
        self.lock_table().readers()
    }

    pub fn writers(&self) -> Vec<Address> {
        self.lock_table().writers()
    }

    /// Rebuild the routing table, falling back to the seed routers when
    /// the known ring is exhausted.
    pub async fn refresh(&self) -> Result<()> {
        let mut tried = HashSet::new();

        if self.reading_in_absence_of_writer() {
            // The writer may have come back anywhere in the cluster; ask
            // the seeds first rather than the possibly writerless ring.
            self.prepend_routers(&self.settings.seeds).await?;
            if self.update_once(&mut tried).await? {
                return Ok(());
            }
        } else {
            if self.update_once(&mut tried).await? {
                return Ok(());
            }
            let untried: Vec<Address> = self
                .settings
                .seeds
                .iter()
                .filter(|seed| !tried.contains(*seed))
                .cloned()
                .collect();
            if !untried.is_empty() {
                self.prepend_routers(&untried).await?;
                if self.update_once(&mut tried).await? {
                    return Ok(());
                }
            }
        }

        Err(Error::unavailable("Failed to connect to any routing server"))
    }

    /// One walk over the routers ring. Returns whether a table was
    /// accepted; records every router attempted in `tried`.
    async fn update_once(&self, tried: &mut HashSet<Address>) -> Result<bool> {
        let routers = self.routers();
        for router in routers {
            tried.insert(router.clone());

            let mut conn = match self.pool.acquire(&router).await {
                Ok(conn) => conn,
                Err(Error::PoolClosed) => return Err(Error::PoolClosed),
                Err(e) => {
                    tracing::warn!(router = %router, error = %e, "router unreachable");
                    self.remove(&router);
                    continue;
                }
            };

            match self.procedure.fetch(&mut *conn).await {
                Ok(table) if table.reader_count() == 0 => {
                    tracing::warn!(router = %router, "discarding routing table with no readers");
                    continue;
                }
                Ok(table) => {
                    let absent_writer = table.writer_count() == 0;
                    self.accept(table, absent_writer).await?;
                    return Ok(true);
                }
                Err(Error::SessionExpired(m)) => {
                    tracing::warn!(router = %router, reason = %m, "router evicted");
                    self.remove(&router);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    async fn accept(&self, table: RoutingTable, absent_writer: bool) -> Result<()> {
        let table = table.with_ttl_floor(self.settings.ttl_floor);
        // Pools first: every address the new table names must be
        // acquirable before anyone can round-robin onto it.
        self.pool.update(&table.all()).await?;
        {
            let mut current = self.lock_table();
            tracing::info!(
                routers = table.routers().len(),
                readers = table.reader_count(),
                writers = table.writer_count(),
                ttl = ?table.ttl(),
                "routing table updated"
            );
            *current = table;
        }
        self.reading_in_absence_of_writer
            .store(absent_writer, Ordering::SeqCst);
        if absent_writer {
            tracing::warn!("routing table has no writers; continuing in read-only mode");
        }
        Ok(())
    }

    async fn prepend_routers(&self, addresses: &[Address]) -> Result<()> {
        self.pool.add(addresses).await?;
        self.lock_table().prepend_routers(addresses);
        Ok(())
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, RoutingTable> {
        self.table.lock().expect("routing table lock poisoned")
    }

    #[cfg(test)]
    pub(crate) fn install_table(&self, table: RoutingTable) {
        *self.lock_table() = table;
    }
}
