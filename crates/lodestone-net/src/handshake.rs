//! Bolt handshake: preamble plus version negotiation.
//!
//! The client opens with four magic bytes and four proposed protocol
//! versions as big-endian u32s, most preferred first, zero in unused
//! slots. The server answers with the single version it picked.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use lodestone_core::error::{Error, Result};

pub const PREAMBLE: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];
pub const PROTOCOL_VERSION: u32 = 1;

// "HTTP" — what a web server answers when the preamble lands on its port.
const HTTP_MAGIC: u32 = 0x4854_5450;

/// Run the handshake on a fresh stream and return the agreed version.
pub async fn negotiate<S>(stream: &mut S) -> Result<u32>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut proposal = [0u8; 20];
    proposal[..4].copy_from_slice(&PREAMBLE);
    proposal[4..8].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());

    stream
        .write_all(&proposal)
        .await
        .map_err(|e| Error::unavailable(format!("handshake write failed: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| Error::unavailable(format!("handshake flush failed: {e}")))?;

    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| Error::unavailable(format!("handshake read failed: {e}")))?;

    match u32::from_be_bytes(reply) {
        0 => Err(Error::Security(
            "server rejected every proposed Bolt version".into(),
        )),
        HTTP_MAGIC => Err(Error::client(
            "server answered with HTTP — the address points at an HTTP port, not a Bolt port",
        )),
        version if version == PROTOCOL_VERSION => Ok(version),
        other => Err(Error::Security(format!(
            "server picked unsupported protocol version {other}"
        ))),
    }
}
