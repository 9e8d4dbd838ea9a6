//! Opaque consensus-backed key/value contract and the shipped adapters.
//!
//! The meta plane only ever talks to consensus through [`ConsensusKv`]:
//! a replicated map with quorum-durable writes plus leader/member queries.
//! Two adapters are provided. [`LocalKv`] is a single-replica durable store
//! (fjall-backed) for single-node deployments; a real consensus library
//! plugs in behind the same trait. [`MemKv`] shares one in-process map across
//! handles and lets the caller steer leadership, which is what the
//! multi-node integration tests run on.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::cluster::Node;
use crate::error::{Error, Result};

/// Replicated KV with leader election, as seen by the rest of the meta plane.
///
/// `set` and `delete` return only once the write is durable. Every error is
/// treated as transient by callers unless it is `InvalidArgument`.
#[async_trait]
pub trait ConsensusKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Current leader as `(ip, consensus_port)`, if one is elected.
    fn leader(&self) -> Option<Node>;
    /// All group members as consensus addresses.
    fn members(&self) -> Vec<Node>;
    /// Free-form status text for introspection commands.
    async fn server_status(&self) -> String;
}

/// Single-replica durable adapter backed by fjall.
pub struct LocalKv {
    keyspace: Keyspace,
    records: PartitionHandle,
    local: Node,
    members: Vec<Node>,
}

impl LocalKv {
    /// Open (or create) the store under `data_dir`. `local` is this node's
    /// consensus address; `members` is the configured group, kept for
    /// introspection.
    pub fn open(data_dir: &Path, local: Node, members: Vec<Node>) -> Result<Self> {
        let keyspace = fjall::Config::new(data_dir)
            .open()
            .map_err(|err| Error::IoError(format!("open keyspace: {err}")))?;
        let records = keyspace
            .open_partition("meta_records", PartitionCreateOptions::default())
            .map_err(|err| Error::IoError(format!("open records partition: {err}")))?;
        Ok(Self {
            keyspace,
            records,
            local,
            members,
        })
    }
}

#[async_trait]
impl ConsensusKv for LocalKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .records
            .get(key)
            .map_err(|err| Error::IoError(format!("get {key}: {err}")))?;
        Ok(value.map(|slice| slice.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.records
            .insert(key, value)
            .map_err(|err| Error::IoError(format!("set {key}: {err}")))?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|err| Error::IoError(format!("persist {key}: {err}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.records
            .remove(key)
            .map_err(|err| Error::IoError(format!("delete {key}: {err}")))?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|err| Error::IoError(format!("persist delete {key}: {err}")))?;
        Ok(())
    }

    fn leader(&self) -> Option<Node> {
        // Single replica: always the leader of its own group.
        Some(self.local.clone())
    }

    fn members(&self) -> Vec<Node> {
        self.members.clone()
    }

    async fn server_status(&self) -> String {
        format!(
            "local consensus kv: single replica at {}, {} configured members",
            self.local,
            self.members.len()
        )
    }
}

#[derive(Debug, Default)]
struct MemClusterInner {
    data: std::collections::BTreeMap<String, Vec<u8>>,
    leader: Option<Node>,
    members: Vec<Node>,
}

/// Shared state behind every [`MemKv`] handle of one simulated group.
///
/// Writes are visible to all handles immediately, which models the
/// quorum-durable contract; leadership changes come from the outside via
/// [`MemCluster::set_leader`].
#[derive(Debug, Default)]
pub struct MemCluster {
    inner: Mutex<MemClusterInner>,
}

impl MemCluster {
    pub fn new(members: Vec<Node>) -> Arc<Self> {
        let leader = members.first().cloned();
        Arc::new(Self {
            inner: Mutex::new(MemClusterInner {
                data: Default::default(),
                leader,
                members,
            }),
        })
    }

    pub fn set_leader(&self, leader: Option<Node>) {
        self.inner.lock().expect("mem cluster poisoned").leader = leader;
    }

    pub fn handle(self: &Arc<Self>, local: Node) -> MemKv {
        MemKv {
            cluster: Arc::clone(self),
            local,
        }
    }
}

/// One node's handle onto a [`MemCluster`].
pub struct MemKv {
    cluster: Arc<MemCluster>,
    local: Node,
}

#[async_trait]
impl ConsensusKv for MemKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.cluster.inner.lock().expect("mem cluster poisoned");
        Ok(inner.data.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.cluster.inner.lock().expect("mem cluster poisoned");
        inner.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.cluster.inner.lock().expect("mem cluster poisoned");
        inner.data.remove(key);
        Ok(())
    }

    fn leader(&self) -> Option<Node> {
        let inner = self.cluster.inner.lock().expect("mem cluster poisoned");
        inner.leader.clone()
    }

    fn members(&self) -> Vec<Node> {
        let inner = self.cluster.inner.lock().expect("mem cluster poisoned");
        inner.members.clone()
    }

    async fn server_status(&self) -> String {
        let inner = self.cluster.inner.lock().expect("mem cluster poisoned");
        format!(
            "in-memory consensus kv: {} members, leader {}, local {}",
            inner.members.len(),
            inner
                .leader
                .as_ref()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "none".into()),
            self.local
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_kv_shares_writes_across_handles() {
        let a = Node::new("1.1.1.1", 9100);
        let b = Node::new("1.1.1.2", 9100);
        let cluster = MemCluster::new(vec![a.clone(), b.clone()]);
        let kv_a = cluster.handle(a.clone());
        let kv_b = cluster.handle(b.clone());

        kv_a.set("k", b"v".to_vec()).await.expect("set");
        assert_eq!(kv_b.get("k").await.expect("get"), Some(b"v".to_vec()));

        assert_eq!(kv_b.leader(), Some(a.clone()));
        cluster.set_leader(Some(b.clone()));
        assert_eq!(kv_a.leader(), Some(b));

        kv_b.delete("k").await.expect("delete");
        assert_eq!(kv_a.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn local_kv_round_trips_durably() {
        let dir = std::env::temp_dir().join(format!(
            "strato-meta-localkv-{}-{}",
            std::process::id(),
            crate::now_micros()
        ));
        let local = Node::new("127.0.0.1", 9321);
        let kv = LocalKv::open(&dir, local.clone(), vec![local.clone()]).expect("open");

        assert_eq!(kv.get("missing").await.expect("get"), None);
        kv.set("k", b"v".to_vec()).await.expect("set");
        assert_eq!(kv.get("k").await.expect("get"), Some(b"v".to_vec()));
        kv.delete("k").await.expect("delete");
        assert_eq!(kv.get("k").await.expect("get"), None);
        assert_eq!(kv.leader(), Some(local));

        drop(kv);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
