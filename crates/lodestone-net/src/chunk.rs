//! Chunked message framing.
//!
//! A message travels as one or more chunks — a two-byte big-endian
//! payload length followed by that many bytes — and ends with a
//! zero-length chunk. Chunk boundaries carry no meaning beyond flow
//! control: a reader must recover the identical payload no matter how
//! the writer split it.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use lodestone_core::error::{Error, Result};

/// Hard wire-format limit on a single chunk's payload.
pub const MAX_CHUNK_PAYLOAD: usize = 0xFFFF;
/// Default payload size the writer aims for.
pub const DEFAULT_CHUNK_PAYLOAD: usize = 8192;

const CHUNK_HEADER: usize = 2;

fn write_failed(e: std::io::Error) -> Error {
    Error::unavailable(format!("failed to write to connection: {e}"))
}

// ── Output ───────────────────────────────────────────────────────────────────

/// Splits an outbound byte stream into chunks of at most `max_payload`
/// bytes. Chunks are finalized (length backfilled) as they fill and
/// pushed to the socket; the message tail and any partial chunk go down
/// on `flush`.
pub struct ChunkedOutput<W> {
    writer: W,
    buf: BytesMut,
    /// Offset of the open chunk's header in `buf`; None when no chunk is
    /// open.
    open_chunk: Option<usize>,
    max_payload: usize,
}

impl<W: AsyncWrite + Unpin> ChunkedOutput<W> {
    pub fn new(writer: W) -> Self {
        Self::with_chunk_size(writer, DEFAULT_CHUNK_PAYLOAD)
    }

    pub fn with_chunk_size(writer: W, max_payload: usize) -> Self {
        ChunkedOutput {
            writer,
            buf: BytesMut::with_capacity(DEFAULT_CHUNK_PAYLOAD + CHUNK_HEADER),
            open_chunk: None,
            max_payload: max_payload.clamp(1, MAX_CHUNK_PAYLOAD),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.max_payload
    }

    /// Append message bytes, closing and emitting chunks whenever the
    /// current one fills.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let start = match self.open_chunk {
                Some(start) => start,
                None => {
                    let start = self.buf.len();
                    self.buf.put_u16(0); // backfilled on close
                    self.open_chunk = Some(start);
                    start
                }
            };
            let used = self.buf.len() - start - CHUNK_HEADER;
            let take = (self.max_payload - used).min(data.len());
            self.buf.put_slice(&data[..take]);
            data = &data[take..];

            if self.buf.len() - start - CHUNK_HEADER == self.max_payload {
                self.close_chunk();
                self.push_down().await?;
            }
        }
        Ok(())
    }

    /// Close the message: finalize the open chunk and append the
    /// zero-length terminator. The next write starts a fresh chunk.
    pub fn write_message_tail(&mut self) {
        self.close_chunk();
        self.buf.put_u16(0);
    }

    /// Push every buffered byte to the socket and flush it.
    pub async fn flush(&mut self) -> Result<()> {
        self.close_chunk();
        self.push_down().await?;
        self.writer.flush().await.map_err(write_failed)
    }

    /// Shut down the write side, best-effort.
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }

    fn close_chunk(&mut self) {
        if let Some(start) = self.open_chunk.take() {
            let payload = self.buf.len() - start - CHUNK_HEADER;
            if payload == 0 {
                // Nothing was written; drop the placeholder header rather
                // than emit an empty chunk (which would terminate the
                // message).
                self.buf.truncate(start);
            } else {
                self.buf[start..start + CHUNK_HEADER]
                    .copy_from_slice(&(payload as u16).to_be_bytes());
            }
        }
    }

    async fn push_down(&mut self) -> Result<()> {
        debug_assert!(self.open_chunk.is_none());
        if !self.buf.is_empty() {
            self.writer
                .write_all(&self.buf)
                .await
                .map_err(write_failed)?;
            self.buf.clear();
        }
        Ok(())
    }
}

// ── Input ────────────────────────────────────────────────────────────────────

/// Reassembles message payloads from the chunk stream. Reads span chunk
/// boundaries transparently; only `read_message_tail` may consume a
/// zero-length chunk.
pub struct ChunkedInput<R> {
    reader: R,
    /// Unconsumed payload bytes left in the current chunk.
    remaining: usize,
}

impl<R: AsyncRead + Unpin> ChunkedInput<R> {
    pub fn new(reader: R) -> Self {
        ChunkedInput {
            reader,
            remaining: 0,
        }
    }

    /// Fill `buf` with message bytes, crossing chunk boundaries as
    /// needed. Encountering the message terminator mid-read is a
    /// protocol violation.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.remaining == 0 {
                let size = self.read_chunk_header().await?;
                if size == 0 {
                    return Err(Error::protocol(
                        "message terminator inside an in-progress read",
                    ));
                }
                self.remaining = size;
            }
            let take = self.remaining.min(buf.len() - filled);
            self.read_payload(&mut buf[filled..filled + take]).await?;
            self.remaining -= take;
            filled += take;
        }
        Ok(())
    }

    /// Consume chunks up to and including the zero-length terminator,
    /// and not a byte past it.
    pub async fn read_message_tail(&mut self) -> Result<()> {
        let mut scratch = [0u8; 1024];
        loop {
            while self.remaining > 0 {
                let take = self.remaining.min(scratch.len());
                self.read_payload(&mut scratch[..take]).await?;
                self.remaining -= take;
            }
            let size = self.read_chunk_header().await?;
            if size == 0 {
                return Ok(());
            }
            self.remaining = size;
        }
    }

    /// Read one complete message payload, consuming its terminator.
    pub async fn read_message(&mut self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        loop {
            if self.remaining == 0 {
                let size = self.read_chunk_header().await?;
                if size == 0 {
                    return Ok(payload.freeze());
                }
                self.remaining = size;
            }
            let start = payload.len();
            payload.resize(start + self.remaining, 0);
            let take = self.remaining;
            self.read_payload(&mut payload[start..start + take]).await?;
            self.remaining = 0;
        }
    }

    async fn read_chunk_header(&mut self) -> Result<usize> {
        let mut header = [0u8; CHUNK_HEADER];
        self.reader.read_exact(&mut header).await.map_err(|e| {
            Error::unavailable(format!("connection closed while reading chunk header: {e}"))
        })?;
        Ok(u16::from_be_bytes(header) as usize)
    }

    // A chunk header promised these bytes; an EOF before they arrive is
    // a framing violation, not a clean close.
    async fn read_payload(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader
            .read_exact(buf)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::protocol("stream ended inside a chunk payload")
                } else {
                    Error::unavailable(format!("failed to read from connection: {e}"))
                }
            })
            .map(|_| ())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
