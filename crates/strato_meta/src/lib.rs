//! Strato Meta — the metadata control plane of a sharded replicated storage
//! cluster.
//!
//! The meta plane maintains the authoritative table → partition → replica
//! mapping, tracks data-node liveness from heartbeats, and orchestrates safe
//! reconfiguration (master hand-off, replica add/remove, bulk migration)
//! on top of an opaque consensus-backed key/value store. Writes are accepted
//! on the elected leader and serialized through a single update pipeline;
//! followers forward write commands to the leader and refresh their cached
//! topology snapshot periodically.

pub mod client;
pub mod cluster;
pub mod condition_cron;
pub mod consensus;
pub mod error;
pub mod info_store;
pub mod leader_joint;
pub mod migrate;
pub mod offsets;
pub mod server;
pub mod update_thread;
pub mod wire;

pub use error::{Error, Result};

use std::time::{SystemTime, UNIX_EPOCH};

use cluster::Node;

/// Port shift from a node's base port to its consensus port.
pub const PORT_SHIFT_CONSENSUS: u16 = 100;
/// Port shift from a node's base port to its command RPC port.
pub const PORT_SHIFT_CMD: u16 = 200;

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Parse a comma-separated consensus member list. Entries accept both
/// `ip:port` and `ip/port`; the slash form is normalized before parsing.
/// A malformed entry is an error, which is fatal at startup.
pub fn parse_members(raw: &str) -> Result<Vec<Node>> {
    let mut members = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let normalized = entry.replace('/', ":");
        members.push(Node::parse(&normalized)?);
    }
    if members.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "no usable member address in {raw:?}"
        )));
    }
    Ok(members)
}
