//! PackStream — the self-describing value encoding underneath Bolt.
//!
//! Every value starts with a one-byte marker. Small integers, and the
//! lengths of small strings, lists, maps, and structs, live inside the
//! marker itself; everything larger spills into an 8-, 16-, or 32-bit
//! big-endian size that follows it. The packer always chooses the
//! narrowest representation that fits, and the unpacker accepts exactly
//! what the markers describe — a typed read against the wrong marker is
//! a protocol violation, not a coercion.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::graph::{Node, Path, Relationship, UnboundRelationship};
use crate::value::Value;

// ── Markers ──────────────────────────────────────────────────────────────────

pub const NULL: u8 = 0xC0;
pub const FLOAT_64: u8 = 0xC1;
pub const FALSE: u8 = 0xC2;
pub const TRUE: u8 = 0xC3;

pub const INT_8: u8 = 0xC8;
pub const INT_16: u8 = 0xC9;
pub const INT_32: u8 = 0xCA;
pub const INT_64: u8 = 0xCB;

pub const BYTES_8: u8 = 0xCC;
pub const BYTES_16: u8 = 0xCD;
pub const BYTES_32: u8 = 0xCE;

pub const TINY_STRING: u8 = 0x80;
pub const STRING_8: u8 = 0xD0;
pub const STRING_16: u8 = 0xD1;
pub const STRING_32: u8 = 0xD2;

pub const TINY_LIST: u8 = 0x90;
pub const LIST_8: u8 = 0xD4;
pub const LIST_16: u8 = 0xD5;
pub const LIST_32: u8 = 0xD6;

pub const TINY_MAP: u8 = 0xA0;
pub const MAP_8: u8 = 0xD8;
pub const MAP_16: u8 = 0xD9;
pub const MAP_32: u8 = 0xDA;

pub const TINY_STRUCT: u8 = 0xB0;
pub const STRUCT_8: u8 = 0xDC;
pub const STRUCT_16: u8 = 0xDD;

// Graph entity struct signatures and their fixed field counts.
pub const SIG_NODE: u8 = b'N';
pub const SIG_RELATIONSHIP: u8 = b'R';
pub const SIG_UNBOUND_RELATIONSHIP: u8 = b'r';
pub const SIG_PATH: u8 = b'P';

const NODE_FIELDS: usize = 3;
const RELATIONSHIP_FIELDS: usize = 5;
const UNBOUND_RELATIONSHIP_FIELDS: usize = 3;
const PATH_FIELDS: usize = 3;

/// Broad type of the next value in the stream, derivable from its marker
/// alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Bytes,
    List,
    Map,
    Struct,
}

fn pack_type_of(marker: u8) -> Result<PackType> {
    Ok(match marker {
        0x00..=0x7F | 0xF0..=0xFF | INT_8 | INT_16 | INT_32 | INT_64 => PackType::Integer,
        NULL => PackType::Null,
        TRUE | FALSE => PackType::Boolean,
        FLOAT_64 => PackType::Float,
        0x80..=0x8F | STRING_8 | STRING_16 | STRING_32 => PackType::String,
        BYTES_8 | BYTES_16 | BYTES_32 => PackType::Bytes,
        0x90..=0x9F | LIST_8 | LIST_16 | LIST_32 => PackType::List,
        0xA0..=0xAF | MAP_8 | MAP_16 | MAP_32 => PackType::Map,
        0xB0..=0xBF | STRUCT_8 | STRUCT_16 => PackType::Struct,
        other => return Err(Error::protocol(format!("unknown marker 0x{other:02X}"))),
    })
}

// ── Packer ───────────────────────────────────────────────────────────────────

/// Encodes values into a growable buffer, always choosing the narrowest
/// marker family that fits.
pub struct Packer {
    buf: BytesMut,
    supports_bytes: bool,
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

impl Packer {
    pub fn new() -> Self {
        Self::with_byte_support(true)
    }

    /// Protocol versions without byte-array support must reject `Bytes`
    /// payloads at pack time.
    pub fn with_byte_support(supports_bytes: bool) -> Self {
        Packer {
            buf: BytesMut::with_capacity(128),
            supports_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn pack(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.pack_null(),
            Value::Boolean(b) => self.pack_bool(*b),
            Value::Integer(i) => self.pack_integer(*i),
            Value::Float(f) => self.pack_float(*f),
            Value::String(s) => self.pack_string(s)?,
            Value::Bytes(b) => self.pack_bytes(b)?,
            Value::List(items) => {
                self.pack_list_header(items.len())?;
                for item in items {
                    self.pack(item)?;
                }
            }
            Value::Map(entries) => {
                self.pack_map_header(entries.len())?;
                for (key, item) in entries {
                    self.pack_string(key)?;
                    self.pack(item)?;
                }
            }
            Value::Node(_)
            | Value::Relationship(_)
            | Value::UnboundRelationship(_)
            | Value::Path(_) => {
                return Err(Error::protocol(
                    "graph entities are server-emitted and cannot be packed",
                ))
            }
        }
        Ok(())
    }

    pub fn pack_null(&mut self) {
        self.buf.put_u8(NULL);
    }

    pub fn pack_bool(&mut self, value: bool) {
        self.buf.put_u8(if value { TRUE } else { FALSE });
    }

    pub fn pack_integer(&mut self, value: i64) {
        match value {
            -16..=127 => self.buf.put_i8(value as i8),
            -128..=-17 => {
                self.buf.put_u8(INT_8);
                self.buf.put_i8(value as i8);
            }
            _ if i16::try_from(value).is_ok() => {
                self.buf.put_u8(INT_16);
                self.buf.put_i16(value as i16);
            }
            _ if i32::try_from(value).is_ok() => {
                self.buf.put_u8(INT_32);
                self.buf.put_i32(value as i32);
            }
            _ => {
                self.buf.put_u8(INT_64);
                self.buf.put_i64(value);
            }
        }
    }

    pub fn pack_float(&mut self, value: f64) {
        self.buf.put_u8(FLOAT_64);
        self.buf.put_f64(value);
    }

    pub fn pack_string(&mut self, value: &str) -> Result<()> {
        self.pack_sized_header(value.len(), TINY_STRING, STRING_8, STRING_16, STRING_32)?;
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    pub fn pack_bytes(&mut self, value: &[u8]) -> Result<()> {
        if !self.supports_bytes {
            return Err(Error::protocol(
                "byte arrays are not supported by the negotiated protocol version",
            ));
        }
        match value.len() {
            n if n <= u8::MAX as usize => {
                self.buf.put_u8(BYTES_8);
                self.buf.put_u8(n as u8);
            }
            n if n <= u16::MAX as usize => {
                self.buf.put_u8(BYTES_16);
                self.buf.put_u16(n as u16);
            }
            n if n <= u32::MAX as usize => {
                self.buf.put_u8(BYTES_32);
                self.buf.put_u32(n as u32);
            }
            n => return Err(Error::protocol(format!("byte array too long: {n}"))),
        }
        self.buf.put_slice(value);
        Ok(())
    }

    pub fn pack_list_header(&mut self, count: usize) -> Result<()> {
        self.pack_sized_header(count, TINY_LIST, LIST_8, LIST_16, LIST_32)
    }

    pub fn pack_map_header(&mut self, count: usize) -> Result<()> {
        self.pack_sized_header(count, TINY_MAP, MAP_8, MAP_16, MAP_32)
    }

    pub fn pack_struct_header(&mut self, size: usize, signature: u8) -> Result<()> {
        match size {
            n if n <= 0x0F => self.buf.put_u8(TINY_STRUCT | n as u8),
            n if n <= u8::MAX as usize => {
                self.buf.put_u8(STRUCT_8);
                self.buf.put_u8(n as u8);
            }
            n if n <= u16::MAX as usize => {
                self.buf.put_u8(STRUCT_16);
                self.buf.put_u16(n as u16);
            }
            n => return Err(Error::protocol(format!("struct too large: {n} fields"))),
        }
        self.buf.put_u8(signature);
        Ok(())
    }

    fn pack_sized_header(
        &mut self,
        size: usize,
        tiny: u8,
        eight: u8,
        sixteen: u8,
        thirty_two: u8,
    ) -> Result<()> {
        match size {
            n if n <= 0x0F => self.buf.put_u8(tiny | n as u8),
            n if n <= u8::MAX as usize => {
                self.buf.put_u8(eight);
                self.buf.put_u8(n as u8);
            }
            n if n <= u16::MAX as usize => {
                self.buf.put_u8(sixteen);
                self.buf.put_u16(n as u16);
            }
            n if n <= u32::MAX as usize => {
                self.buf.put_u8(thirty_two);
                self.buf.put_u32(n as u32);
            }
            n => return Err(Error::protocol(format!("collection too large: {n}"))),
        }
        Ok(())
    }
}

// ── Unpacker ─────────────────────────────────────────────────────────────────

/// Decodes values from a byte slice. Typed reads fail on marker mismatch;
/// the general `unpack` dispatches graph structs by signature.
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
    supports_bytes: bool,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_byte_support(buf, true)
    }

    pub fn with_byte_support(buf: &'a [u8], supports_bytes: bool) -> Self {
        Unpacker {
            buf,
            pos: 0,
            supports_bytes,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Type of the next value without consuming anything.
    pub fn peek_type(&self) -> Result<PackType> {
        pack_type_of(self.peek_marker()?)
    }

    pub fn unpack(&mut self) -> Result<Value> {
        match self.peek_type()? {
            PackType::Null => {
                self.next_marker()?;
                Ok(Value::Null)
            }
            PackType::Boolean => self.unpack_bool().map(Value::Boolean),
            PackType::Integer => self.unpack_integer().map(Value::Integer),
            PackType::Float => self.unpack_float().map(Value::Float),
            PackType::String => self.unpack_string().map(Value::String),
            PackType::Bytes => self.unpack_bytes().map(Value::Bytes),
            PackType::List => self.unpack_list().map(Value::List),
            PackType::Map => self.unpack_map().map(Value::Map),
            PackType::Struct => self.unpack_graph_struct(),
        }
    }

    pub fn unpack_null(&mut self) -> Result<()> {
        match self.next_marker()? {
            NULL => Ok(()),
            other => Err(marker_mismatch("null", other)),
        }
    }

    pub fn unpack_bool(&mut self) -> Result<bool> {
        match self.next_marker()? {
            TRUE => Ok(true),
            FALSE => Ok(false),
            other => Err(marker_mismatch("boolean", other)),
        }
    }

    pub fn unpack_integer(&mut self) -> Result<i64> {
        let marker = self.next_marker()?;
        match marker {
            0x00..=0x7F => Ok(marker as i64),
            0xF0..=0xFF => Ok(marker as i8 as i64),
            INT_8 => Ok(self.take_u8()? as i8 as i64),
            INT_16 => Ok(i16::from_be_bytes(self.take_array()?) as i64),
            INT_32 => Ok(i32::from_be_bytes(self.take_array()?) as i64),
            INT_64 => Ok(i64::from_be_bytes(self.take_array()?)),
            other => Err(marker_mismatch("integer", other)),
        }
    }

    pub fn unpack_float(&mut self) -> Result<f64> {
        match self.next_marker()? {
            FLOAT_64 => Ok(f64::from_be_bytes(self.take_array()?)),
            other => Err(marker_mismatch("float", other)),
        }
    }

    pub fn unpack_string(&mut self) -> Result<String> {
        let marker = self.next_marker()?;
        let len = match marker {
            0x80..=0x8F => (marker & 0x0F) as usize,
            STRING_8 => self.take_u8()? as usize,
            STRING_16 => self.take_u16()? as usize,
            STRING_32 => self.take_u32()? as usize,
            other => return Err(marker_mismatch("string", other)),
        };
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::protocol("string payload is not valid UTF-8"))
    }

    pub fn unpack_bytes(&mut self) -> Result<Vec<u8>> {
        let marker = self.next_marker()?;
        let len = match marker {
            BYTES_8 => self.take_u8()? as usize,
            BYTES_16 => self.take_u16()? as usize,
            BYTES_32 => self.take_u32()? as usize,
            other => return Err(marker_mismatch("bytes", other)),
        };
        if !self.supports_bytes {
            return Err(Error::protocol(
                "byte arrays are not supported by the negotiated protocol version",
            ));
        }
        Ok(self.take(len)?.to_vec())
    }

    pub fn unpack_list(&mut self) -> Result<Vec<Value>> {
        let marker = self.next_marker()?;
        let count = match marker {
            0x90..=0x9F => (marker & 0x0F) as usize,
            LIST_8 => self.take_u8()? as usize,
            LIST_16 => self.take_u16()? as usize,
            LIST_32 => self.take_u32()? as usize,
            other => return Err(marker_mismatch("list", other)),
        };
        let mut items = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            items.push(self.unpack()?);
        }
        Ok(items)
    }

    pub fn unpack_map(&mut self) -> Result<HashMap<String, Value>> {
        let marker = self.next_marker()?;
        let count = match marker {
            0xA0..=0xAF => (marker & 0x0F) as usize,
            MAP_8 => self.take_u8()? as usize,
            MAP_16 => self.take_u16()? as usize,
            MAP_32 => self.take_u32()? as usize,
            other => return Err(marker_mismatch("map", other)),
        };
        let mut entries = HashMap::with_capacity(count.min(64));
        for _ in 0..count {
            let key = self.unpack_string()?;
            let value = self.unpack()?;
            if entries.insert(key.clone(), value).is_some() {
                return Err(Error::protocol(format!("duplicate map key {key:?}")));
            }
        }
        Ok(entries)
    }

    /// Struct header: (field count, signature byte).
    pub fn unpack_struct_header(&mut self) -> Result<(usize, u8)> {
        let marker = self.next_marker()?;
        let size = match marker {
            0xB0..=0xBF => (marker & 0x0F) as usize,
            STRUCT_8 => self.take_u8()? as usize,
            STRUCT_16 => self.take_u16()? as usize,
            other => return Err(marker_mismatch("struct", other)),
        };
        let signature = self.take_u8()?;
        Ok((size, signature))
    }

    // A struct at value position must be a graph entity; message structs
    // are dispatched at the top level by a separate switch.
    fn unpack_graph_struct(&mut self) -> Result<Value> {
        let (size, signature) = self.unpack_struct_header()?;
        match signature {
            SIG_NODE => {
                check_fields("Node", size, NODE_FIELDS)?;
                self.unpack_node().map(Value::Node)
            }
            SIG_RELATIONSHIP => {
                check_fields("Relationship", size, RELATIONSHIP_FIELDS)?;
                Ok(Value::Relationship(Relationship {
                    id: self.unpack_integer()?,
                    start_id: self.unpack_integer()?,
                    end_id: self.unpack_integer()?,
                    typ: self.unpack_string()?,
                    properties: self.unpack_map()?,
                }))
            }
            SIG_UNBOUND_RELATIONSHIP => {
                check_fields("UnboundRelationship", size, UNBOUND_RELATIONSHIP_FIELDS)?;
                self.unpack_unbound().map(Value::UnboundRelationship)
            }
            SIG_PATH => {
                check_fields("Path", size, PATH_FIELDS)?;
                self.unpack_path().map(Value::Path)
            }
            other => Err(Error::protocol(format!(
                "unexpected struct signature 0x{other:02X} at value position"
            ))),
        }
    }

    fn unpack_node(&mut self) -> Result<Node> {
        let id = self.unpack_integer()?;
        let raw_labels = self.unpack_list()?;
        let mut labels = Vec::with_capacity(raw_labels.len());
        for label in raw_labels {
            match label {
                Value::String(s) => labels.push(s),
                other => {
                    return Err(Error::protocol(format!(
                        "node label must be a string, got {other:?}"
                    )))
                }
            }
        }
        Ok(Node {
            id,
            labels,
            properties: self.unpack_map()?,
        })
    }

    fn unpack_unbound(&mut self) -> Result<UnboundRelationship> {
        Ok(UnboundRelationship {
            id: self.unpack_integer()?,
            typ: self.unpack_string()?,
            properties: self.unpack_map()?,
        })
    }

    fn unpack_path(&mut self) -> Result<Path> {
        let mut nodes = Vec::new();
        for value in self.unpack_list()? {
            match value {
                Value::Node(n) => nodes.push(n),
                other => {
                    return Err(Error::protocol(format!(
                        "path node arena entry must be a node, got {other:?}"
                    )))
                }
            }
        }
        let mut rels = Vec::new();
        for value in self.unpack_list()? {
            match value {
                Value::UnboundRelationship(r) => rels.push(r),
                other => {
                    return Err(Error::protocol(format!(
                        "path relationship arena entry must be unbound, got {other:?}"
                    )))
                }
            }
        }
        let mut sequence = Vec::new();
        for value in self.unpack_list()? {
            match value {
                Value::Integer(i) => sequence.push(i),
                other => {
                    return Err(Error::protocol(format!(
                        "path sequence entry must be an integer, got {other:?}"
                    )))
                }
            }
        }
        Path::new(nodes, rels, sequence)
    }

    // ── Raw reads ────────────────────────────────────────────────────────────

    fn peek_marker(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::protocol("unexpected end of message payload"))
    }

    fn next_marker(&mut self) -> Result<u8> {
        let marker = self.peek_marker()?;
        self.pos += 1;
        Ok(marker)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::protocol(format!(
                "payload truncated: wanted {len} bytes, {} remain",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().expect("length checked"))
    }
}

fn marker_mismatch(expected: &str, marker: u8) -> Error {
    Error::protocol(format!("expected {expected}, found marker 0x{marker:02X}"))
}

fn check_fields(name: &str, got: usize, want: usize) -> Result<()> {
    if got != want {
        return Err(Error::protocol(format!(
            "{name} struct expects {want} fields, got {got}"
        )));
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────
