//! One socket, one Bolt session.
//!
//! Lifecycle: TCP connect → handshake → INIT → active. Requests are
//! enqueued together with the handler that will receive their responses;
//! `sync` flushes the outbound buffer and drains responses in strict
//! FIFO order. A server FAILURE poisons the tail of the queue — the
//! server answers the remaining requests with IGNORED — and the
//! connection acknowledges the failure before the next request cycle.
//!
//! A connection is owned by exactly one holder at a time; it is never
//! shared across tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use lodestone_core::address::Address;
use lodestone_core::config::{AuthToken, Config};
use lodestone_core::error::{Error, Result};
use lodestone_core::message::{BoltFormat, Request, Response, ResponseHandler};
use lodestone_core::value::Value;

use crate::chunk::{ChunkedInput, ChunkedOutput};
use crate::handshake;

/// The seam between the pools/routing layer and a live session. Object
/// safe so pools can hold fakes in tests and wrappers in production.
#[async_trait]
pub trait BoltConnection: Send {
    fn address(&self) -> &Address;
    fn protocol_version(&self) -> u32;
    fn server_agent(&self) -> Option<String>;
    /// Initialized, not broken, no unacknowledged failure, and no I/O
    /// operation abandoned midway.
    fn is_healthy(&self) -> bool;

    async fn run(
        &mut self,
        statement: &str,
        parameters: HashMap<String, Value>,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<()>;
    async fn pull_all(&mut self, handler: Box<dyn ResponseHandler>) -> Result<()>;
    async fn discard_all(&mut self, handler: Box<dyn ResponseHandler>) -> Result<()>;
    /// Flush outbound buffers, then read responses until every enqueued
    /// request has its summary. Returns the first server failure after
    /// acknowledging it.
    async fn sync(&mut self) -> Result<()>;
    /// Pipeline RESET; outstanding requests drain as IGNORED and the
    /// failure state is cleared.
    async fn reset(&mut self) -> Result<()>;
    async fn close(&mut self);
}

impl std::fmt::Debug for dyn BoltConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoltConnection")
            .field("address", self.address())
            .finish()
    }
}

pub struct Connection<S> {
    address: Address,
    input: ChunkedInput<io::ReadHalf<S>>,
    output: ChunkedOutput<io::WriteHalf<S>>,
    format: BoltFormat,
    protocol_version: u32,
    pending: VecDeque<Box<dyn ResponseHandler>>,
    server_agent: Option<String>,
    /// First unacknowledged server FAILURE.
    failure: Option<Error>,
    initialized: bool,
    broken: bool,
    /// Set across every await on the socket; a future dropped mid-I/O
    /// leaves it set, which marks the connection unfit for reuse.
    in_flight: bool,
}

impl Connection<TcpStream> {
    /// Dial, handshake, and initialize a session.
    pub async fn connect(address: &Address, config: &Config, auth: &AuthToken) -> Result<Self> {
        let stream = timeout(
            config.connect_timeout(),
            TcpStream::connect(address.endpoint()),
        )
        .await
        .map_err(|_| Error::unavailable(format!("timed out connecting to {address}")))?
        .map_err(|e| Error::unavailable(format!("failed to connect to {address}: {e}")))?;
        let _ = stream.set_nodelay(true);
        Self::establish(stream, address.clone(), config, auth).await
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Handshake and INIT over an already-open stream.
    pub async fn establish(
        mut stream: S,
        address: Address,
        config: &Config,
        auth: &AuthToken,
    ) -> Result<Self> {
        let version = handshake::negotiate(&mut stream).await?;
        tracing::debug!(address = %address, version, "bolt handshake complete");

        let (read_half, write_half) = io::split(stream);
        let mut conn = Connection {
            address,
            input: ChunkedInput::new(read_half),
            output: ChunkedOutput::new(write_half),
            format: BoltFormat::new(version),
            protocol_version: version,
            pending: VecDeque::new(),
            server_agent: None,
            failure: None,
            initialized: false,
            broken: false,
            in_flight: false,
        };
        conn.init(&config.user_agent, auth).await?;
        Ok(conn)
    }

    async fn init(&mut self, user_agent: &str, auth: &AuthToken) -> Result<()> {
        let request = Request::Init {
            user_agent: user_agent.to_string(),
            auth: auth.entries().clone(),
        };
        self.write_request(&request).await?;
        self.in_flight = true;
        if let Err(e) = self.output.flush().await {
            return self.fail(e);
        }
        self.in_flight = false;

        match self.receive().await? {
            Response::Success(metadata) => {
                self.server_agent = metadata
                    .get("server")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned);
                self.initialized = true;
                tracing::debug!(
                    address = %self.address,
                    server = self.server_agent.as_deref().unwrap_or("unknown"),
                    "session initialized"
                );
                Ok(())
            }
            Response::Failure { code, message } => {
                self.broken = true;
                Err(Error::from_server_failure(code, message))
            }
            other => self.fail(Error::protocol(format!(
                "unexpected response to INIT: {other:?}"
            ))),
        }
    }

    // ── Wire primitives ──────────────────────────────────────────────────────

    async fn write_request(&mut self, request: &Request) -> Result<()> {
        let payload = self.format.encode(request)?;
        tracing::trace!(address = %self.address, signature = request.signature(), "enqueue request");
        self.in_flight = true;
        if let Err(e) = self.output.write(&payload).await {
            return self.fail(e);
        }
        self.output.write_message_tail();
        self.in_flight = false;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Response> {
        self.in_flight = true;
        let payload = match self.input.read_message().await {
            Ok(payload) => payload,
            Err(e) => return self.fail(e),
        };
        self.in_flight = false;
        match self.format.decode(&payload) {
            Ok(response) => Ok(response),
            Err(e) => self.fail(e),
        }
    }

    /// Read one response and route it to its handler. Records stream to
    /// the front handler; summaries retire it.
    async fn receive_one(&mut self) -> Result<()> {
        let response = self.receive().await?;
        if response.is_summary() {
            let Some(mut handler) = self.pending.pop_front() else {
                return self.fail(Error::protocol("response received with no request outstanding"));
            };
            if let Response::Failure { code, message } = &response {
                tracing::debug!(address = %self.address, code = %code, "server failure");
                if self.failure.is_none() {
                    self.failure = Some(Error::from_server_failure(code.clone(), message.clone()));
                }
            }
            response.dispatch(handler.as_mut());
        } else {
            let Some(handler) = self.pending.front_mut() else {
                return self.fail(Error::protocol("record received with no request outstanding"));
            };
            response.dispatch(handler.as_mut());
        }
        Ok(())
    }

    /// ACK_FAILURE exchange run outside the handler queue.
    async fn acknowledge_failure(&mut self) -> Result<()> {
        self.write_request(&Request::AckFailure).await?;
        self.in_flight = true;
        if let Err(e) = self.output.flush().await {
            return self.fail(e);
        }
        self.in_flight = false;
        match self.receive().await? {
            Response::Success(_) => {
                self.failure = None;
                Ok(())
            }
            other => self.fail(Error::protocol(format!(
                "unexpected response to ACK_FAILURE: {other:?}"
            ))),
        }
    }

    fn fail<T>(&mut self, e: Error) -> Result<T> {
        if e.is_fatal_for_connection() {
            self.broken = true;
        }
        self.in_flight = false;
        Err(e)
    }

    async fn queue_request(
        &mut self,
        request: Request,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<()> {
        self.write_request(&request).await?;
        self.pending.push_back(handler);
        Ok(())
    }
}

#[async_trait]
impl<S> BoltConnection for Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn address(&self) -> &Address {
        &self.address
    }

    fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    fn server_agent(&self) -> Option<String> {
        self.server_agent.clone()
    }

    fn is_healthy(&self) -> bool {
        self.initialized && !self.broken && !self.in_flight && self.failure.is_none()
    }

    async fn run(
        &mut self,
        statement: &str,
        parameters: HashMap<String, Value>,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<()> {
        let request = Request::Run {
            statement: statement.to_string(),
            parameters,
        };
        self.queue_request(request, handler).await
    }

    async fn pull_all(&mut self, handler: Box<dyn ResponseHandler>) -> Result<()> {
        self.queue_request(Request::PullAll, handler).await
    }

    async fn discard_all(&mut self, handler: Box<dyn ResponseHandler>) -> Result<()> {
        self.queue_request(Request::DiscardAll, handler).await
    }

    async fn sync(&mut self) -> Result<()> {
        self.in_flight = true;
        if let Err(e) = self.output.flush().await {
            return self.fail(e);
        }
        self.in_flight = false;
        while !self.pending.is_empty() {
            self.receive_one().await?;
        }
        if let Some(err) = self.failure.clone() {
            self.acknowledge_failure().await?;
            return Err(err);
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.write_request(&Request::Reset).await?;
        self.in_flight = true;
        if let Err(e) = self.output.flush().await {
            return self.fail(e);
        }
        self.in_flight = false;

        // Responses for requests ahead of the RESET drain first.
        while !self.pending.is_empty() {
            self.receive_one().await?;
        }
        match self.receive().await? {
            Response::Success(_) => {
                self.failure = None;
                tracing::debug!(address = %self.address, "session reset");
                Ok(())
            }
            other => self.fail(Error::protocol(format!(
                "unexpected response to RESET: {other:?}"
            ))),
        }
    }

    async fn close(&mut self) {
        self.broken = true;
        self.output.shutdown().await;
        tracing::debug!(address = %self.address, "connection closed");
    }
}

// ── Response collection ──────────────────────────────────────────────────────

/// Accumulated responses for one request.
#[derive(Debug, Default)]
pub struct Collector {
    pub metadata: Option<HashMap<String, Value>>,
    pub records: Vec<Vec<Value>>,
    pub failure: Option<(String, String)>,
    pub ignored: bool,
}

impl ResponseHandler for Collector {
    fn on_success(&mut self, metadata: HashMap<String, Value>) {
        self.metadata = Some(metadata);
    }

    fn on_record(&mut self, fields: Vec<Value>) {
        self.records.push(fields);
    }

    fn on_failure(&mut self, code: &str, message: &str) {
        self.failure = Some((code.to_string(), message.to_string()));
    }

    fn on_ignored(&mut self) {
        self.ignored = true;
    }
}

/// A collector that can be handed to the connection as a boxed handler
/// while the caller keeps a handle to read the results after `sync`.
#[derive(Debug, Clone, Default)]
pub struct SharedCollector(Arc<Mutex<Collector>>);

impl SharedCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Box<dyn ResponseHandler> {
        Box::new(self.clone())
    }

    /// Take the accumulated state, leaving an empty collector behind.
    pub fn take(&self) -> Collector {
        std::mem::take(&mut *self.0.lock().expect("collector lock poisoned"))
    }
}

impl ResponseHandler for SharedCollector {
    fn on_success(&mut self, metadata: HashMap<String, Value>) {
        self.0.lock().expect("collector lock poisoned").on_success(metadata);
    }

    fn on_record(&mut self, fields: Vec<Value>) {
        self.0.lock().expect("collector lock poisoned").on_record(fields);
    }

    fn on_failure(&mut self, code: &str, message: &str) {
        self.0
            .lock()
            .expect("collector lock poisoned")
            .on_failure(code, message);
    }

    fn on_ignored(&mut self) {
        self.0.lock().expect("collector lock poisoned").on_ignored();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
