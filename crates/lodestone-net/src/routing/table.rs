//! The routing table: three round-robin address rings with a TTL.
//!
//! Rings rotate by popping the head and pushing it back, so the head is
//! always the next hit — which is what makes `prepend_routers`'s
//! move-to-front semantics observable: a freshly prepended router is the
//! next one tried.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use lodestone_core::address::{AccessMode, Address};

#[derive(Debug, Clone)]
pub struct RoutingTable {
    routers: VecDeque<Address>,
    readers: VecDeque<Address>,
    writers: VecDeque<Address>,
    created: Instant,
    ttl: Duration,
}

impl RoutingTable {
    pub fn new(
        routers: Vec<Address>,
        readers: Vec<Address>,
        writers: Vec<Address>,
        ttl: Duration,
    ) -> Self {
        RoutingTable {
            routers: routers.into(),
            readers: readers.into(),
            writers: writers.into(),
            created: Instant::now(),
            ttl,
        }
    }

    /// The table a driver starts from: only the seed routers, already
    /// expired so the first acquire forces a refresh.
    pub fn seeded(seeds: Vec<Address>) -> Self {
        Self::new(seeds, Vec::new(), Vec::new(), Duration::ZERO)
    }

    /// Server-supplied TTLs below the floor are raised to it.
    pub fn with_ttl_floor(mut self, floor: Duration) -> Self {
        if self.ttl < floor {
            self.ttl = floor;
        }
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Next address in the ring serving `mode`, round-robin. Absent only
    /// when that ring is empty.
    pub fn try_next(&mut self, mode: AccessMode) -> Option<Address> {
        let ring = match mode {
            AccessMode::Read => &mut self.readers,
            AccessMode::Write => &mut self.writers,
        };
        rotate(ring)
    }

    /// Next router, round-robin.
    pub fn next_router(&mut self) -> Option<Address> {
        rotate(&mut self.routers)
    }

    /// Expired, routerless, or missing the ring `mode` needs.
    pub fn is_stale(&self, mode: AccessMode) -> bool {
        self.created.elapsed() >= self.ttl
            || self.routers.is_empty()
            || match mode {
                AccessMode::Read => self.readers.is_empty(),
                AccessMode::Write => self.writers.is_empty(),
            }
    }

    /// Move the given addresses to the front of the routers ring, in the
    /// order given, deduplicating entries already present.
    pub fn prepend_routers(&mut self, addresses: &[Address]) {
        for address in addresses.iter().rev() {
            self.routers.retain(|a| a != address);
            self.routers.push_front(address.clone());
        }
    }

    /// Evict an address from every ring.
    pub fn remove(&mut self, address: &Address) {
        self.routers.retain(|a| a != address);
        self.readers.retain(|a| a != address);
        self.writers.retain(|a| a != address);
    }

    /// Evict an address from the writers ring only.
    pub fn remove_writer(&mut self, address: &Address) {
        self.writers.retain(|a| a != address);
    }

    /// Union of all three rings.
    pub fn all(&self) -> HashSet<Address> {
        self.routers
            .iter()
            .chain(self.readers.iter())
            .chain(self.writers.iter())
            .cloned()
            .collect()
    }

    pub fn routers(&self) -> Vec<Address> {
        self.routers.iter().cloned().collect()
    }

    pub fn readers(&self) -> Vec<Address> {
        self.readers.iter().cloned().collect()
    }

    pub fn writers(&self) -> Vec<Address> {
        self.writers.iter().cloned().collect()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }
}

fn rotate(ring: &mut VecDeque<Address>) -> Option<Address> {
    let next = ring.pop_front()?;
    ring.push_back(next.clone());
    Some(next)
}
