//! Bolt message format — domain messages as PackStream structs.
//!
//! A message is a struct whose signature byte names the message type and
//! whose fields are ordinary PackStream values. Requests are encoded into
//! a payload that the framing layer chunks; one inbound payload decodes
//! into exactly one response. Message structs are dispatched here, at the
//! top level; graph-entity structs are dispatched inside the value codec.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::packstream::{Packer, Unpacker};
use crate::value::Value;

// Request signatures.
pub const SIG_INIT: u8 = 0x01;
pub const SIG_ACK_FAILURE: u8 = 0x0E;
pub const SIG_RESET: u8 = 0x0F;
pub const SIG_RUN: u8 = 0x10;
pub const SIG_DISCARD_ALL: u8 = 0x2F;
pub const SIG_PULL_ALL: u8 = 0x3F;

// Response signatures.
pub const SIG_SUCCESS: u8 = 0x70;
pub const SIG_RECORD: u8 = 0x71;
pub const SIG_IGNORED: u8 = 0x7E;
pub const SIG_FAILURE: u8 = 0x7F;

/// Client → server messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Init {
        user_agent: String,
        auth: HashMap<String, Value>,
    },
    Run {
        statement: String,
        parameters: HashMap<String, Value>,
    },
    PullAll,
    DiscardAll,
    Reset,
    AckFailure,
}

impl Request {
    pub fn signature(&self) -> u8 {
        match self {
            Request::Init { .. } => SIG_INIT,
            Request::Run { .. } => SIG_RUN,
            Request::PullAll => SIG_PULL_ALL,
            Request::DiscardAll => SIG_DISCARD_ALL,
            Request::Reset => SIG_RESET,
            Request::AckFailure => SIG_ACK_FAILURE,
        }
    }

    fn arity(&self) -> usize {
        match self {
            Request::Init { .. } | Request::Run { .. } => 2,
            _ => 0,
        }
    }
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(HashMap<String, Value>),
    Record(Vec<Value>),
    Ignored,
    Failure { code: String, message: String },
}

impl Response {
    /// Records stream detail; everything else closes out one request.
    pub fn is_summary(&self) -> bool {
        !matches!(self, Response::Record(_))
    }
}

/// Receives the responses paired with one request, in arrival order.
pub trait ResponseHandler: Send {
    fn on_success(&mut self, metadata: HashMap<String, Value>);
    fn on_record(&mut self, fields: Vec<Value>);
    fn on_failure(&mut self, code: &str, message: &str);
    fn on_ignored(&mut self);
}

impl Response {
    pub fn dispatch(self, handler: &mut dyn ResponseHandler) {
        match self {
            Response::Success(metadata) => handler.on_success(metadata),
            Response::Record(fields) => handler.on_record(fields),
            Response::Failure { code, message } => handler.on_failure(&code, &message),
            Response::Ignored => handler.on_ignored(),
        }
    }
}

/// Encoder/decoder for protocol version 1, parameterized on whether the
/// negotiated version carries byte-array support.
#[derive(Debug, Clone, Copy)]
pub struct BoltFormat {
    supports_bytes: bool,
}

impl BoltFormat {
    pub fn new(protocol_version: u32) -> Self {
        // Byte arrays arrived with the second protocol revision.
        BoltFormat {
            supports_bytes: protocol_version >= 2,
        }
    }

    pub fn supports_bytes(&self) -> bool {
        self.supports_bytes
    }

    /// Encode one request into a message payload, ready for chunking.
    pub fn encode(&self, request: &Request) -> Result<Bytes> {
        let mut packer = Packer::with_byte_support(self.supports_bytes);
        packer.pack_struct_header(request.arity(), request.signature())?;
        match request {
            Request::Init { user_agent, auth } => {
                packer.pack_string(user_agent)?;
                packer.pack(&Value::Map(auth.clone()))?;
            }
            Request::Run {
                statement,
                parameters,
            } => {
                packer.pack_string(statement)?;
                packer.pack(&Value::Map(parameters.clone()))?;
            }
            Request::PullAll | Request::DiscardAll | Request::Reset | Request::AckFailure => {}
        }
        Ok(packer.finish())
    }

    /// Decode one complete message payload into a response.
    pub fn decode(&self, payload: &[u8]) -> Result<Response> {
        let mut unpacker = Unpacker::with_byte_support(payload, self.supports_bytes);
        let (arity, signature) = unpacker.unpack_struct_header()?;
        let response = match signature {
            SIG_SUCCESS => {
                check_arity("SUCCESS", arity, 1)?;
                Response::Success(unpacker.unpack_map()?)
            }
            SIG_RECORD => {
                check_arity("RECORD", arity, 1)?;
                Response::Record(unpacker.unpack_list()?)
            }
            SIG_IGNORED => {
                // Older servers attach metadata to IGNORED; tolerate and drop it.
                if arity > 0 {
                    check_arity("IGNORED", arity, 1)?;
                    unpacker.unpack_map()?;
                }
                Response::Ignored
            }
            SIG_FAILURE => {
                check_arity("FAILURE", arity, 1)?;
                let mut metadata = unpacker.unpack_map()?;
                let code = take_string(&mut metadata, "code")?;
                let message = take_string(&mut metadata, "message")?;
                Response::Failure { code, message }
            }
            other => {
                return Err(Error::protocol(format!(
                    "unexpected message signature 0x{other:02X}"
                )))
            }
        };
        if unpacker.remaining() > 0 {
            return Err(Error::protocol(format!(
                "{} trailing bytes after message",
                unpacker.remaining()
            )));
        }
        Ok(response)
    }
}

fn check_arity(name: &str, got: usize, want: usize) -> Result<()> {
    if got != want {
        return Err(Error::protocol(format!(
            "{name} message expects {want} fields, got {got}"
        )));
    }
    Ok(())
}

fn take_string(metadata: &mut HashMap<String, Value>, key: &str) -> Result<String> {
    match metadata.remove(key) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(Error::protocol(format!(
            "FAILURE {key} must be a string, got {other:?}"
        ))),
        None => Err(Error::protocol(format!("FAILURE metadata missing {key}"))),
    }
}
