//! In-memory fakes shared by the pool, routing, and balancer tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use lodestone_core::address::Address;
use lodestone_core::error::{Error, Result};
use lodestone_core::message::ResponseHandler;
use lodestone_core::value::Value;

use crate::connection::BoltConnection;
use crate::pool::Connector;

/// Observable state of one fake connection, kept alive by the test.
#[derive(Debug, Default)]
pub struct FakeState {
    pub unhealthy: std::sync::atomic::AtomicBool,
    pub closed: AtomicUsize,
}

pub struct FakeConnection {
    address: Address,
    state: Arc<FakeState>,
    /// Error every `sync` resolves to, if set.
    fail_with: Option<Error>,
}

impl FakeConnection {
    pub fn new(address: Address) -> (Self, Arc<FakeState>) {
        let state = Arc::new(FakeState::default());
        (
            FakeConnection {
                address,
                state: Arc::clone(&state),
                fail_with: None,
            },
            state,
        )
    }

    pub fn failing(address: Address, error: Error) -> Self {
        FakeConnection {
            address,
            state: Arc::new(FakeState::default()),
            fail_with: Some(error),
        }
    }
}

#[async_trait]
impl BoltConnection for FakeConnection {
    fn address(&self) -> &Address {
        &self.address
    }

    fn protocol_version(&self) -> u32 {
        1
    }

    fn server_agent(&self) -> Option<String> {
        Some("Fake/0.0".to_string())
    }

    fn is_healthy(&self) -> bool {
        !self.state.unhealthy.load(Ordering::SeqCst)
    }

    async fn run(
        &mut self,
        _statement: &str,
        _parameters: HashMap<String, Value>,
        _handler: Box<dyn ResponseHandler>,
    ) -> Result<()> {
        Ok(())
    }

    async fn pull_all(&mut self, _handler: Box<dyn ResponseHandler>) -> Result<()> {
        Ok(())
    }

    async fn discard_all(&mut self, _handler: Box<dyn ResponseHandler>) -> Result<()> {
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        match &self.fail_with {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector producing fakes, with per-address failure injection.
#[derive(Default)]
pub struct FakeConnector {
    pub created: AtomicUsize,
    refused: Mutex<HashSet<Address>>,
    sync_failures: Mutex<HashMap<Address, Error>>,
    states: Mutex<Vec<(Address, Arc<FakeState>)>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make future connects to `address` fail with ServiceUnavailable.
    pub fn refuse(&self, address: &Address) {
        self.refused.lock().unwrap().insert(address.clone());
    }

    /// Make connections to `address` fail every `sync` with `error`.
    pub fn fail_sync(&self, address: &Address, error: Error) {
        self.sync_failures
            .lock()
            .unwrap()
            .insert(address.clone(), error);
    }

    pub fn accept(&self, address: &Address) {
        self.refused.lock().unwrap().remove(address);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// States of every connection handed out, in creation order.
    pub fn states(&self) -> Vec<(Address, Arc<FakeState>)> {
        self.states.lock().unwrap().clone()
    }

    pub fn states_for(&self, address: &Address) -> Vec<Arc<FakeState>> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, s)| Arc::clone(s))
            .collect()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, address: &Address) -> Result<Box<dyn BoltConnection>> {
        if self.refused.lock().unwrap().contains(address) {
            return Err(Error::unavailable(format!("refused connect to {address}")));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let (mut conn, state) = FakeConnection::new(address.clone());
        conn.fail_with = self.sync_failures.lock().unwrap().get(address).cloned();
        self.states
            .lock()
            .unwrap()
            .push((address.clone(), state));
        Ok(Box::new(conn))
    }
}

/// Routing procedure answering from per-router scripts.
#[derive(Default)]
pub struct ScriptedProcedure {
    scripts: Mutex<HashMap<Address, std::collections::VecDeque<Result<crate::routing::RoutingTable>>>>,
    calls: Mutex<Vec<Address>>,
    delay: Mutex<Option<std::time::Duration>>,
}

impl ScriptedProcedure {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, address: &str, result: Result<crate::routing::RoutingTable>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(addr(address))
            .or_default()
            .push_back(result);
    }

    /// Make every fetch take this long, to widen race windows.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Address> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::routing::RoutingProcedure for ScriptedProcedure {
    async fn fetch(
        &self,
        conn: &mut dyn BoltConnection,
    ) -> Result<crate::routing::RoutingTable> {
        let address = conn.address().clone();
        self.calls.lock().unwrap().push(address.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&address)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Err(Error::SessionExpired(format!("no script for {address}"))))
    }
}

pub fn addr(name: &str) -> Address {
    Address::parse(name).unwrap()
}
