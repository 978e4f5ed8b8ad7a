//! Stub Bolt server and wire helpers shared by the integration tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Once;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use lodestone_core::message::{
    SIG_FAILURE, SIG_IGNORED, SIG_INIT, SIG_PULL_ALL, SIG_RECORD, SIG_RUN, SIG_SUCCESS,
};
use lodestone_core::packstream::{Packer, Unpacker};
use lodestone_core::value::Value;
use lodestone_net::chunk::{ChunkedInput, ChunkedOutput};

static TRACING: Once = Once::new();

/// RUST_LOG-controlled tracing, initialized once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ── Server-side wire ──────────────────────────────────────────────────────────

/// The server end of one Bolt connection: handshake done, chunked
/// streams ready.
pub struct ServerWire {
    input: ChunkedInput<OwnedReadHalf>,
    output: ChunkedOutput<OwnedWriteHalf>,
}

impl ServerWire {
    pub async fn accept(mut stream: TcpStream) -> Result<ServerWire> {
        let mut proposal = [0u8; 20];
        stream
            .read_exact(&mut proposal)
            .await
            .context("reading handshake proposal")?;
        if proposal[..4] != [0x60, 0x60, 0xB0, 0x17] {
            bail!("bad preamble: {:02X?}", &proposal[..4]);
        }
        stream
            .write_all(&1u32.to_be_bytes())
            .await
            .context("writing handshake reply")?;
        let (read_half, write_half) = stream.into_split();
        Ok(ServerWire {
            input: ChunkedInput::new(read_half),
            output: ChunkedOutput::new(write_half),
        })
    }

    /// Read one request and check its signature. Returns the payload.
    pub async fn expect(&mut self, signature: u8) -> Result<Vec<u8>> {
        let payload = self
            .input
            .read_message()
            .await
            .map_err(|e| anyhow::anyhow!("reading request: {e}"))?;
        if payload.len() < 2 || payload[1] != signature {
            bail!(
                "expected request signature 0x{signature:02X}, got {:02X?}",
                &payload[..payload.len().min(2)]
            );
        }
        Ok(payload.to_vec())
    }

    /// Consume an INIT and answer SUCCESS. Returns (user_agent, auth).
    pub async fn handle_init(&mut self) -> Result<(String, HashMap<String, Value>)> {
        let payload = self.expect(SIG_INIT).await?;
        let mut unpacker = Unpacker::new(&payload[2..]);
        let user_agent = unpacker
            .unpack_string()
            .map_err(|e| anyhow::anyhow!("INIT user agent: {e}"))?;
        let auth = unpacker
            .unpack_map()
            .map_err(|e| anyhow::anyhow!("INIT auth token: {e}"))?;
        self.send_success(&[("server", Value::from("Neo4j/3.1.0"))])
            .await?;
        Ok((user_agent, auth))
    }

    pub async fn send_success(&mut self, entries: &[(&str, Value)]) -> Result<()> {
        let mut packer = Packer::new();
        packer.pack_struct_header(1, SIG_SUCCESS).unwrap();
        packer.pack_map_header(entries.len()).unwrap();
        for (key, value) in entries {
            packer.pack_string(key).unwrap();
            packer.pack(value).unwrap();
        }
        self.send_payload(packer).await
    }

    pub async fn send_record(&mut self, fields: &[Value]) -> Result<()> {
        let mut packer = Packer::new();
        packer.pack_struct_header(1, SIG_RECORD).unwrap();
        packer.pack_list_header(fields.len()).unwrap();
        for field in fields {
            packer.pack(field).unwrap();
        }
        self.send_payload(packer).await
    }

    pub async fn send_failure(&mut self, code: &str, message: &str) -> Result<()> {
        let mut packer = Packer::new();
        packer.pack_struct_header(1, SIG_FAILURE).unwrap();
        packer.pack_map_header(2).unwrap();
        packer.pack_string("code").unwrap();
        packer.pack_string(code).unwrap();
        packer.pack_string("message").unwrap();
        packer.pack_string(message).unwrap();
        self.send_payload(packer).await
    }

    pub async fn send_ignored(&mut self) -> Result<()> {
        let mut packer = Packer::new();
        packer.pack_struct_header(0, SIG_IGNORED).unwrap();
        self.send_payload(packer).await
    }

    /// Serve one RUN + PULL_ALL exchange with the given records.
    pub async fn serve_query(&mut self, columns: &[&str], records: &[Vec<Value>]) -> Result<()> {
        self.expect(SIG_RUN).await?;
        self.expect(SIG_PULL_ALL).await?;
        let fields = Value::List(columns.iter().map(|c| Value::from(*c)).collect());
        self.send_success(&[("fields", fields)]).await?;
        for record in records {
            self.send_record(record).await?;
        }
        self.send_success(&[]).await?;
        Ok(())
    }

    /// Serve one getRoutingTable call with the given role → addresses
    /// assignment.
    pub async fn serve_routing_table(
        &mut self,
        ttl_secs: i64,
        roles: &[(&str, Vec<String>)],
    ) -> Result<()> {
        self.expect(SIG_RUN).await?;
        self.expect(SIG_PULL_ALL).await?;
        self.send_success(&[(
            "fields",
            Value::List(vec![Value::from("ttl"), Value::from("servers")]),
        )])
        .await?;

        let servers = Value::List(
            roles
                .iter()
                .map(|(role, addresses)| {
                    let mut entry = HashMap::new();
                    entry.insert("role".to_string(), Value::from(*role));
                    entry.insert(
                        "addresses".to_string(),
                        Value::List(addresses.iter().map(|a| Value::from(a.clone())).collect()),
                    );
                    Value::Map(entry)
                })
                .collect(),
        );
        self.send_record(&[Value::Integer(ttl_secs), servers])
            .await?;
        self.send_success(&[]).await?;
        Ok(())
    }

    async fn send_payload(&mut self, packer: Packer) -> Result<()> {
        let payload = packer.finish();
        self.output
            .write(&payload)
            .await
            .map_err(|e| anyhow::anyhow!("writing response: {e}"))?;
        self.output.write_message_tail();
        self.output
            .flush()
            .await
            .map_err(|e| anyhow::anyhow!("flushing response: {e}"))?;
        Ok(())
    }
}

// ── Stub server ───────────────────────────────────────────────────────────────

/// A bound listener whose address is known before the accept loop runs,
/// so a script can name the server's own endpoint (e.g. in ROUTE rings).
pub struct BoundStub {
    listener: TcpListener,
    address: String,
}

impl BoundStub {
    pub async fn bind() -> Result<BoundStub> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("binding stub listener")?;
        let address = format!("127.0.0.1:{}", listener.local_addr()?.port());
        Ok(BoundStub { listener, address })
    }

    pub fn address(&self) -> String {
        self.address.clone()
    }

    /// Run `script` for every accepted connection. The second argument
    /// is the zero-based connection index.
    pub fn serve<F, Fut>(self, script: F) -> StubServer
    where
        F: Fn(ServerWire, usize) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let BoundStub { listener, address } = self;
        let handle = tokio::spawn(async move {
            let mut index = 0usize;
            while let Ok((stream, _)) = listener.accept().await {
                let script = script.clone();
                let conn_index = index;
                index += 1;
                tokio::spawn(async move {
                    match ServerWire::accept(stream).await {
                        Ok(wire) => {
                            if let Err(e) = script(wire, conn_index).await {
                                eprintln!("stub connection {conn_index}: {e:#}");
                            }
                        }
                        Err(e) => eprintln!("stub handshake: {e:#}"),
                    }
                });
            }
        });
        StubServer { address, handle }
    }
}

pub struct StubServer {
    address: String,
    handle: JoinHandle<()>,
}

impl StubServer {
    /// Bind-and-serve in one step for scripts that don't need their own
    /// address.
    pub async fn start<F, Fut>(script: F) -> Result<StubServer>
    where
        F: Fn(ServerWire, usize) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Ok(BoundStub::bind().await?.serve(script))
    }

    pub fn address(&self) -> String {
        self.address.clone()
    }

    pub fn bolt_uri(&self) -> String {
        format!("bolt://{}", self.address)
    }

    pub fn routing_uri(&self) -> String {
        format!("bolt+routing://{}", self.address)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Driver settings tightened for tests: fail fast rather than hang.
pub fn test_config() -> lodestone::Config {
    lodestone::Config {
        connect_timeout_ms: 2_000,
        connection_acquisition_timeout_ms: 2_000,
        ..lodestone::Config::default()
    }
}
