//! Cluster topology data model and the records persisted through consensus.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A data-plane node address. Identity is the `ip:port` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub ip: String,
    pub port: u16,
}

impl Node {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("bad node address {s:?}")))?;
        if ip.is_empty() {
            return Err(Error::InvalidArgument(format!("bad node address {s:?}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidArgument(format!("bad node port in {s:?}")))?;
        Ok(Node::new(ip, port))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Client-visible partition state. `Stuck` tells writers to suspend until a
/// role change settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    Active,
    Stuck,
    SlowDown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: u32,
    /// Absent only while the partition is `Stuck` with no promotable slave.
    pub master: Option<Node>,
    pub slaves: Vec<Node>,
    pub status: PartitionStatus,
}

impl Partition {
    pub fn is_master(&self, node: &Node) -> bool {
        self.master.as_ref() == Some(node)
    }

    pub fn is_slave(&self, node: &Node) -> bool {
        self.slaves.contains(node)
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.is_master(node) || self.is_slave(node)
    }
}

/// One table's partition map as persisted in the consensus store.
///
/// `version` is the epoch at which the record was last written; refresh uses
/// it to reconcile when the epoch watermark write failed after a record write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub version: u64,
    pub partitions: Vec<Partition>,
}

impl Table {
    pub fn partition(&self, id: u32) -> Option<&Partition> {
        self.partitions.get(id as usize)
    }

    pub fn contains_node(&self, node: &Node) -> bool {
        self.partitions.iter().any(|p| p.contains(node))
    }
}

/// Data-node liveness as tracked by the leader and persisted (Up/Down only)
/// for leader hand-over. `Pending` never hits the store: it marks a node that
/// is either awaiting a DownNode commit or awaiting re-ping after hand-over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Up,
    Down,
    Pending,
}

/// Last-known node states, persisted under [`keys::NODES`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodesRecord {
    pub nodes: BTreeMap<String, NodeState>,
}

/// A single replica move within a bulk migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationItem {
    pub table: String,
    pub partition: u32,
    pub from: Node,
    pub to: Node,
}

/// Topology mutations applied by the single-writer update pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateTask {
    UpNode { node: Node },
    DownNode { node: Node },
    AddTable { table: Table },
    RemoveTable { table: String },
    AddSlave { node: Node, table: String, partition: u32 },
    RemoveSlave { node: Node, table: String, partition: u32 },
    SetMaster { node: Node, table: String, partition: u32 },
    SetStuck { table: String, partition: u32 },
    SetActive { table: String, partition: u32 },
}

/// Key layout inside the consensus store.
pub mod keys {
    pub const EPOCH: &str = "meta/epoch";
    pub const TABLE_LIST: &str = "meta/tables";
    pub const NODES: &str = "meta/nodes";
    pub const MIGRATE: &str = "meta/migrate";

    pub fn table(name: &str) -> String {
        format!("meta/table/{name}")
    }
}

/// Build the initial partition map for a new table: masters assigned
/// round-robin over the currently-Up nodes, the next `rf - 1` nodes in
/// rotation as slaves, with `rf = min(3, up-node count)`.
pub fn assign_partitions(name: &str, partition_count: u32, up_nodes: &[Node]) -> Result<Table> {
    if partition_count == 0 {
        return Err(Error::InvalidArgument(
            "partition count must be at least 1".into(),
        ));
    }
    if up_nodes.is_empty() {
        return Err(Error::Incomplete("no up data node to place replicas".into()));
    }

    let n = up_nodes.len();
    let rf = n.min(3);
    let mut partitions = Vec::with_capacity(partition_count as usize);
    for id in 0..partition_count {
        let base = id as usize % n;
        let master = up_nodes[base].clone();
        let slaves = (1..rf)
            .map(|k| up_nodes[(base + k) % n].clone())
            .collect::<Vec<_>>();
        partitions.push(Partition {
            id,
            master: Some(master),
            slaves,
            status: PartitionStatus::Active,
        });
    }

    Ok(Table {
        name: name.to_string(),
        version: 0,
        partitions,
    })
}
