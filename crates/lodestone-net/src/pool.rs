//! Per-address connection pool.
//!
//! Idle connections are pre-initialized and handed out before any new
//! one is dialed. Total connections are bounded by a semaphore; an
//! acquire at capacity blocks up to the acquisition timeout. The guard
//! returns its connection on drop, so a cancelled caller can never leak
//! one. No lock is held across an await.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use lodestone_core::address::Address;
use lodestone_core::config::{AuthToken, Config};
use lodestone_core::error::{Error, Result};
use lodestone_core::message::ResponseHandler;
use lodestone_core::value::Value;

use crate::connection::{BoltConnection, Connection};

/// How new sessions come to exist. The production connector dials TCP;
/// tests swap in fakes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &Address) -> Result<Box<dyn BoltConnection>>;
}

/// Dials, handshakes, and INITs real sockets.
pub struct TcpConnector {
    config: Config,
    auth: AuthToken,
}

impl TcpConnector {
    pub fn new(config: Config, auth: AuthToken) -> Self {
        TcpConnector { config, auth }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &Address) -> Result<Box<dyn BoltConnection>> {
        let conn = Connection::connect(address, &self.config, &self.auth).await?;
        Ok(Box::new(conn))
    }
}

struct PoolInner {
    address: Address,
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Box<dyn BoltConnection>>>,
    permits: Arc<Semaphore>,
    acquisition_timeout: Duration,
    disposed: AtomicBool,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    max_size: usize,
}

impl ConnectionPool {
    pub fn new(address: Address, connector: Arc<dyn Connector>, config: &Config) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                address,
                connector,
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(config.max_connection_pool_size)),
                acquisition_timeout: config.acquisition_timeout(),
                disposed: AtomicBool::new(false),
            }),
            max_size: config.max_connection_pool_size,
        }
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().expect("pool lock poisoned").len()
    }

    pub fn in_use(&self) -> usize {
        self.max_size - self.inner.permits.available_permits()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Borrow an idle connection, or dial a new one while under the cap.
    /// Blocks up to the acquisition timeout when the pool is exhausted.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        if self.is_disposed() {
            return Err(Error::PoolClosed);
        }

        let permit = match timeout(
            self.inner.acquisition_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Err(_elapsed) => {
                return Err(Error::client(format!(
                    "failed to acquire a connection to {} within {:?}",
                    self.inner.address, self.inner.acquisition_timeout
                )))
            }
            // The semaphore only closes on dispose.
            Ok(Err(_closed)) => return Err(Error::PoolClosed),
            Ok(Ok(permit)) => permit,
        };
        if self.is_disposed() {
            return Err(Error::PoolClosed);
        }

        // Unhealthy idles are dropped on the floor; their sockets close
        // with them.
        loop {
            let candidate = self.inner.idle.lock().expect("pool lock poisoned").pop();
            match candidate {
                Some(conn) if conn.is_healthy() => {
                    tracing::trace!(address = %self.inner.address, "reusing idle connection");
                    return Ok(PooledConnection::new(conn, Arc::clone(&self.inner), permit));
                }
                Some(conn) => {
                    tracing::debug!(address = %self.inner.address, "discarding unhealthy idle connection");
                    drop(conn);
                }
                None => break,
            }
        }

        tracing::debug!(address = %self.inner.address, "dialing new connection");
        let conn = self.inner.connector.connect(&self.inner.address).await?;
        Ok(PooledConnection::new(conn, Arc::clone(&self.inner), permit))
    }

    /// Close every pooled connection and refuse all future acquires.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        let drained: Vec<_> = {
            let mut idle = self.inner.idle.lock().expect("pool lock poisoned");
            idle.drain(..).collect()
        };
        let count = drained.len();
        for mut conn in drained {
            conn.close().await;
        }
        tracing::debug!(address = %self.inner.address, closed = count, "pool disposed");
    }
}

/// Exclusive hold on one pooled connection. Dropping the guard returns a
/// healthy connection to the idle set and destroys anything else.
pub struct PooledConnection {
    conn: Option<Box<dyn BoltConnection>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

impl PooledConnection {
    fn new(
        conn: Box<dyn BoltConnection>,
        pool: Arc<PoolInner>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        PooledConnection {
            conn: Some(conn),
            pool,
            _permit: permit,
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn BoltConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.is_healthy() && !self.pool.disposed.load(Ordering::SeqCst) {
                self.pool
                    .idle
                    .lock()
                    .expect("pool lock poisoned")
                    .push(conn);
            }
            // else: dropped here; the socket closes with it
        }
    }
}

#[async_trait]
impl BoltConnection for PooledConnection {
    fn address(&self) -> &Address {
        (**self).address()
    }

    fn protocol_version(&self) -> u32 {
        (**self).protocol_version()
    }

    fn server_agent(&self) -> Option<String> {
        (**self).server_agent()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    async fn run(
        &mut self,
        statement: &str,
        parameters: HashMap<String, Value>,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<()> {
        (**self).run(statement, parameters, handler).await
    }

    async fn pull_all(&mut self, handler: Box<dyn ResponseHandler>) -> Result<()> {
        (**self).pull_all(handler).await
    }

    async fn discard_all(&mut self, handler: Box<dyn ResponseHandler>) -> Result<()> {
        (**self).discard_all(handler).await
    }

    async fn sync(&mut self) -> Result<()> {
        (**self).sync().await
    }

    async fn reset(&mut self) -> Result<()> {
        (**self).reset().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}
