//! Replication offsets reported by data-node heartbeats.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::cluster::Node;

/// A binlog position. Ordering is lexicographic on `(filenum, offset)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeOffset {
    pub filenum: u32,
    pub offset: u64,
}

impl NodeOffset {
    pub fn new(filenum: u32, offset: u64) -> Self {
        Self { filenum, offset }
    }
}

/// One (table, partition) offset carried by a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedOffset {
    pub table: String,
    pub partition: u32,
    pub offset: NodeOffset,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OffsetKey {
    table: String,
    partition: u32,
    node: String,
}

/// Concurrent map of the last offset each node reported for each partition.
///
/// Entries are never expired; the map is bounded by cluster × tables ×
/// partitions and is rebuilt from heartbeats after a restart.
#[derive(Debug, Default)]
pub struct NodeOffsetMap {
    inner: Mutex<HashMap<OffsetKey, NodeOffset>>,
}

impl NodeOffsetMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite every offset carried by one heartbeat.
    pub fn update_from_ping(&self, node: &Node, offsets: &[ReportedOffset]) {
        let mut inner = self.inner.lock().expect("offset map poisoned");
        for report in offsets {
            inner.insert(
                OffsetKey {
                    table: report.table.clone(),
                    partition: report.partition,
                    node: node.key(),
                },
                report.offset,
            );
        }
    }

    pub fn lookup(&self, table: &str, partition: u32, node: &Node) -> Option<NodeOffset> {
        let inner = self.inner.lock().expect("offset map poisoned");
        inner
            .get(&OffsetKey {
                table: table.to_string(),
                partition,
                node: node.key(),
            })
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_order_by_filenum_before_offset() {
        assert!(NodeOffset::new(4, 0) > NodeOffset::new(3, 9999));
        assert!(NodeOffset::new(3, 1000) > NodeOffset::new(3, 950));
        assert!(NodeOffset::new(3, 950) >= NodeOffset::new(3, 950));
    }

    #[test]
    fn ping_overwrites_previous_report() {
        let map = NodeOffsetMap::new();
        let node = Node::new("1.1.1.1", 10);
        map.update_from_ping(
            &node,
            &[ReportedOffset {
                table: "t".into(),
                partition: 0,
                offset: NodeOffset::new(1, 100),
            }],
        );
        map.update_from_ping(
            &node,
            &[ReportedOffset {
                table: "t".into(),
                partition: 0,
                offset: NodeOffset::new(2, 50),
            }],
        );
        assert_eq!(map.lookup("t", 0, &node), Some(NodeOffset::new(2, 50)));
        assert_eq!(map.lookup("t", 1, &node), None);
    }
}
