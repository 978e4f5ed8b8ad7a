//! The server-side routing procedure and its record parsing.
//!
//! A routing table comes back as a single record: `ttl` in seconds and
//! `servers`, a list of `{role, addresses}` maps with roles ROUTE, READ,
//! and WRITE. Transport faults during the call are narrowed to
//! `SessionExpired` so the table manager moves on to the next router; a
//! server without the procedure is reported as unavailable for routing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use lodestone_core::address::Address;
use lodestone_core::error::{Error, Result};
use lodestone_core::value::Value;

use super::table::RoutingTable;
use crate::connection::{BoltConnection, SharedCollector};

pub const ROUTING_PROCEDURE: &str = "CALL dbms.cluster.routing.getRoutingTable({context})";

const PROCEDURE_NOT_FOUND: &str = "Neo.ClientError.Procedure.ProcedureNotFound";

const ROLE_ROUTE: &str = "ROUTE";
const ROLE_READ: &str = "READ";
const ROLE_WRITE: &str = "WRITE";

/// How the manager obtains a fresh table from one router.
#[async_trait]
pub trait RoutingProcedure: Send + Sync {
    async fn fetch(&self, conn: &mut dyn BoltConnection) -> Result<RoutingTable>;
}

/// Issues the getRoutingTable call over Bolt.
pub struct BoltRoutingProcedure {
    context: HashMap<String, Value>,
}

impl BoltRoutingProcedure {
    pub fn new(context: HashMap<String, Value>) -> Self {
        BoltRoutingProcedure { context }
    }
}

#[async_trait]
impl RoutingProcedure for BoltRoutingProcedure {
    async fn fetch(&self, conn: &mut dyn BoltConnection) -> Result<RoutingTable> {
        let router = conn.address().clone();
        let header = SharedCollector::new();
        let rows = SharedCollector::new();

        let mut parameters = HashMap::new();
        parameters.insert("context".to_string(), Value::Map(self.context.clone()));

        conn.run(ROUTING_PROCEDURE, parameters, header.handler())
            .await
            .map_err(|e| narrow(e, &router))?;
        conn.pull_all(rows.handler())
            .await
            .map_err(|e| narrow(e, &router))?;
        conn.sync().await.map_err(|e| narrow(e, &router))?;

        let fields = field_names(&header.take().metadata);
        let mut collected = rows.take();
        if collected.records.len() != 1 {
            return Err(Error::protocol(format!(
                "routing procedure returned {} records, expected exactly one",
                collected.records.len()
            )));
        }
        parse_record(collected.records.remove(0), &fields)
    }
}

fn narrow(error: Error, router: &Address) -> Error {
    match error {
        // The connection to the router died; the router itself is the
        // suspect, not the cluster.
        Error::ServiceUnavailable(m) => {
            Error::SessionExpired(format!("router {router} became unavailable: {m}"))
        }
        Error::Client {
            code: Some(code),
            message,
        } if code == PROCEDURE_NOT_FOUND => Error::unavailable(format!(
            "server {router} does not support routing: {message}"
        )),
        other => other,
    }
}

fn field_names(metadata: &Option<HashMap<String, Value>>) -> Vec<String> {
    metadata
        .as_ref()
        .and_then(|m| m.get("fields"))
        .and_then(|v| v.as_list())
        .map(|fields| {
            fields
                .iter()
                .filter_map(|f| f.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_record(record: Vec<Value>, fields: &[String]) -> Result<RoutingTable> {
    let index_of = |name: &str, default: usize| {
        fields
            .iter()
            .position(|f| f == name)
            .unwrap_or(default)
    };

    let ttl = record
        .get(index_of("ttl", 0))
        .and_then(|v| v.as_int())
        .ok_or_else(|| Error::protocol("routing record has no integer ttl field"))?;
    if ttl < 0 {
        return Err(Error::protocol(format!("negative routing table ttl {ttl}")));
    }

    let servers = record
        .get(index_of("servers", 1))
        .and_then(|v| v.as_list())
        .ok_or_else(|| Error::protocol("routing record has no servers list"))?;

    let mut routers = Vec::new();
    let mut readers = Vec::new();
    let mut writers = Vec::new();
    for entry in servers {
        let entry = entry
            .as_map()
            .ok_or_else(|| Error::protocol("server entry is not a map"))?;
        let role = entry
            .get("role")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::protocol("server entry has no role"))?;
        let addresses = entry
            .get("addresses")
            .and_then(|v| v.as_list())
            .ok_or_else(|| Error::protocol("server entry has no addresses"))?;

        let ring = match role {
            ROLE_ROUTE => &mut routers,
            ROLE_READ => &mut readers,
            ROLE_WRITE => &mut writers,
            other => {
                return Err(Error::protocol(format!(
                    "unknown routing role {other:?}"
                )))
            }
        };
        for address in addresses {
            let raw = address
                .as_str()
                .ok_or_else(|| Error::protocol("server address is not a string"))?;
            ring.push(Address::parse(raw)?);
        }
    }

    Ok(RoutingTable::new(
        routers,
        readers,
        writers,
        Duration::from_secs(ttl as u64),
    ))
}
