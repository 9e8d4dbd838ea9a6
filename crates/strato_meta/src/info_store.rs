//! Cached topology snapshot, node liveness, and the single topology mutator.
//!
//! The info store is the only component that writes table records through
//! consensus. All mutations arrive as [`UpdateTask`]s from the update
//! pipeline, are validated against the current snapshot, committed record by
//! record, and sealed with an epoch bump. The table records are authoritative;
//! the epoch key is a watermark only, and `refresh` reconciles from the
//! maximum table version whenever the watermark is missing or stale.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::cluster::{
    keys, Node, NodeState, NodesRecord, Partition, PartitionStatus, Table, UpdateTask,
};
use crate::consensus::ConsensusKv;
use crate::error::{Error, Result};
use crate::offsets::{NodeOffset, NodeOffsetMap};

/// Immutable view of the replicated topology, published wholesale.
#[derive(Debug, Clone, Default)]
pub struct MetaSnapshot {
    pub epoch: u64,
    pub tables: BTreeMap<String, Table>,
    /// Last-known node states as persisted through consensus.
    pub nodes: BTreeMap<String, NodeState>,
}

impl MetaSnapshot {
    fn max_table_version(&self) -> u64 {
        self.tables.values().map(|t| t.version).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_alive_us: u64,
    state: NodeState,
}

/// Which consensus records an applied task touched.
#[derive(Debug, Default, PartialEq)]
struct WriteSet {
    tables: Vec<String>,
    removed_table: Option<String>,
    list_changed: bool,
    nodes_changed: bool,
}

impl WriteSet {
    fn is_empty(&self) -> bool {
        self.tables.is_empty()
            && self.removed_table.is_none()
            && !self.list_changed
            && !self.nodes_changed
    }
}

pub struct InfoStore {
    kv: Arc<dyn ConsensusKv>,
    offsets: Arc<NodeOffsetMap>,
    snapshot: RwLock<Arc<MetaSnapshot>>,
    loaded: AtomicBool,
    liveness: Mutex<HashMap<String, Liveness>>,
    alive_timeout: Duration,
}

impl InfoStore {
    pub fn new(
        kv: Arc<dyn ConsensusKv>,
        offsets: Arc<NodeOffsetMap>,
        alive_timeout: Duration,
    ) -> Self {
        Self {
            kv,
            offsets,
            snapshot: RwLock::new(Arc::new(MetaSnapshot::default())),
            loaded: AtomicBool::new(false),
            liveness: Mutex::new(HashMap::new()),
            alive_timeout,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.snapshot().epoch
    }

    pub fn snapshot(&self) -> Arc<MetaSnapshot> {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }

    fn publish(&self, snapshot: MetaSnapshot) {
        *self.snapshot.write().expect("snapshot lock poisoned") = Arc::new(snapshot);
    }

    /// Reload the topology from consensus unless the epoch watermark is
    /// unchanged. Returns `Incomplete` until the store has been initialized.
    pub async fn refresh(&self) -> Result<()> {
        let stored_epoch = match self.kv.get(keys::EPOCH).await? {
            Some(bytes) => Some(
                serde_json::from_slice::<u64>(&bytes)
                    .map_err(|err| Error::Corruption(format!("epoch record: {err}")))?,
            ),
            None => None,
        };

        if self.loaded.load(Ordering::Acquire) {
            if let Some(epoch) = stored_epoch {
                if epoch == self.epoch() {
                    return Ok(());
                }
            }
        }

        let names: Vec<String> = match self.kv.get(keys::TABLE_LIST).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| Error::Corruption(format!("table list record: {err}")))?,
            None => Vec::new(),
        };

        let mut tables = BTreeMap::new();
        for name in names {
            match self.kv.get(&keys::table(&name)).await? {
                Some(bytes) => match serde_json::from_slice::<Table>(&bytes) {
                    Ok(table) => {
                        tables.insert(name, table);
                    }
                    // One bad record must not invalidate the others.
                    Err(err) => {
                        tracing::warn!(table = %name, error = %err,
                            "skipping unparsable table record")
                    }
                },
                None => tracing::warn!(table = %name, "table record missing, skipping"),
            }
        }

        let nodes = match self.kv.get(keys::NODES).await? {
            Some(bytes) => match serde_json::from_slice::<NodesRecord>(&bytes) {
                Ok(record) => record.nodes,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unparsable nodes record");
                    BTreeMap::new()
                }
            },
            None => BTreeMap::new(),
        };

        if stored_epoch.is_none() && tables.is_empty() {
            return Err(Error::Incomplete("meta info not initialized yet".into()));
        }

        let mut snapshot = MetaSnapshot {
            epoch: 0,
            tables,
            nodes,
        };
        snapshot.epoch = stored_epoch.unwrap_or(0).max(snapshot.max_table_version());
        self.publish(snapshot);
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    pub fn get_table_meta(&self, name: &str) -> Result<Table> {
        self.snapshot()
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("table {name}")))
    }

    pub fn get_table_list(&self) -> Vec<String> {
        self.snapshot().tables.keys().cloned().collect()
    }

    /// Tables in which the node appears in any partition.
    pub fn get_tables_for_node(&self, node: &Node) -> Result<Vec<String>> {
        let tables: Vec<String> = self
            .snapshot()
            .tables
            .values()
            .filter(|t| t.contains_node(node))
            .map(|t| t.name.clone())
            .collect();
        if tables.is_empty() {
            return Err(Error::NotFound(format!("no table for node {node}")));
        }
        Ok(tables)
    }

    pub fn get_partition_master(&self, table: &str, partition: u32) -> Result<Node> {
        let meta = self.get_table_meta(table)?;
        let part = meta
            .partition(partition)
            .ok_or_else(|| Error::NotFound(format!("partition {table}_{partition}")))?;
        part.master
            .clone()
            .ok_or_else(|| Error::NotFound(format!("no master for {table}_{partition}")))
    }

    /// Persisted node states overlaid with the leader's live view.
    pub fn get_all_nodes(&self) -> BTreeMap<String, NodeState> {
        let mut nodes = self.snapshot().nodes.clone();
        let liveness = self.liveness.lock().expect("liveness lock poisoned");
        for (key, entry) in liveness.iter() {
            nodes.insert(key.clone(), entry.state);
        }
        nodes
    }

    /// Record a heartbeat. Returns true iff this transitions the node from
    /// Down or unknown to Up, in which case the caller schedules an UpNode
    /// task to persist the transition.
    pub fn update_node_alive(&self, key: &str) -> bool {
        let now = crate::now_micros();
        let mut liveness = self.liveness.lock().expect("liveness lock poisoned");
        match liveness.get_mut(key) {
            None => {
                liveness.insert(
                    key.to_string(),
                    Liveness {
                        last_alive_us: now,
                        state: NodeState::Up,
                    },
                );
                true
            }
            Some(entry) => {
                let was = entry.state;
                entry.last_alive_us = now;
                entry.state = NodeState::Up;
                was == NodeState::Down
            }
        }
    }

    /// Nodes whose heartbeat is older than the liveness timeout. Expired
    /// nodes flip to Pending and their timestamp is touched, so each emits at
    /// most one DownNode per timeout window while the task is in flight; they
    /// only become Down once the task commits.
    pub fn fetch_expired_nodes(&self) -> Vec<String> {
        let timeout_us = self.alive_timeout.as_micros().min(u128::from(u64::MAX)) as u64;
        let now = crate::now_micros();
        let mut expired = Vec::new();
        let mut liveness = self.liveness.lock().expect("liveness lock poisoned");
        for (key, entry) in liveness.iter_mut() {
            if entry.state == NodeState::Down {
                continue;
            }
            if now.saturating_sub(entry.last_alive_us) >= timeout_us {
                entry.state = NodeState::Pending;
                entry.last_alive_us = now;
                expired.push(key.clone());
            }
        }
        expired.sort();
        expired
    }

    /// Called on leader take-over: rebuild the live view from the persisted
    /// record, marking every previously-Up node Pending until it re-pings.
    pub async fn restore_node_alive(&self) -> Result<()> {
        let record = match self.kv.get(keys::NODES).await? {
            Some(bytes) => serde_json::from_slice::<NodesRecord>(&bytes)
                .map_err(|err| Error::Corruption(format!("nodes record: {err}")))?,
            None => NodesRecord::default(),
        };
        let now = crate::now_micros();
        let mut liveness = self.liveness.lock().expect("liveness lock poisoned");
        liveness.clear();
        for (key, state) in record.nodes {
            let state = match state {
                NodeState::Down => NodeState::Down,
                NodeState::Up | NodeState::Pending => NodeState::Pending,
            };
            liveness.insert(
                key,
                Liveness {
                    last_alive_us: now,
                    state,
                },
            );
        }
        Ok(())
    }

    /// The only topology mutator. Validates against the current snapshot,
    /// writes the affected records, then bumps the epoch watermark by one.
    /// Once the record writes are durable the mutation is committed; a failed
    /// watermark write is only logged and heals on the next reconcile.
    pub async fn apply(&self, task: &UpdateTask) -> Result<()> {
        let current = self.snapshot();
        let mut next = (*current).clone();
        let writes = apply_task(&mut next, task, &self.offsets)?;
        if writes.is_empty() {
            return Ok(());
        }

        let new_epoch = current.epoch.max(current.max_table_version()) + 1;
        for name in &writes.tables {
            if let Some(table) = next.tables.get_mut(name) {
                table.version = new_epoch;
                let bytes = serde_json::to_vec(table)?;
                self.kv.set(&keys::table(name), bytes).await?;
            }
        }
        if let Some(name) = &writes.removed_table {
            self.kv.delete(&keys::table(name)).await?;
        }
        if writes.list_changed {
            let names: Vec<&String> = next.tables.keys().collect();
            self.kv.set(keys::TABLE_LIST, serde_json::to_vec(&names)?).await?;
        }
        if writes.nodes_changed {
            let record = NodesRecord {
                nodes: next.nodes.clone(),
            };
            self.kv.set(keys::NODES, serde_json::to_vec(&record)?).await?;
        }

        next.epoch = new_epoch;
        if let Err(err) = self
            .kv
            .set(keys::EPOCH, serde_json::to_vec(&new_epoch)?)
            .await
        {
            tracing::warn!(epoch = new_epoch, error = %err,
                "epoch watermark write failed after record write, relying on reconcile");
        }

        self.publish(next);
        self.loaded.store(true, Ordering::Release);
        self.note_applied_liveness(task);
        Ok(())
    }

    fn note_applied_liveness(&self, task: &UpdateTask) {
        let (key, state) = match task {
            UpdateTask::UpNode { node } => (node.key(), NodeState::Up),
            UpdateTask::DownNode { node } => (node.key(), NodeState::Down),
            _ => return,
        };
        let mut liveness = self.liveness.lock().expect("liveness lock poisoned");
        let entry = liveness.entry(key).or_insert(Liveness {
            last_alive_us: crate::now_micros(),
            state,
        });
        entry.state = state;
    }
}

/// Apply one task to a snapshot copy, returning which records changed.
fn apply_task(
    next: &mut MetaSnapshot,
    task: &UpdateTask,
    offsets: &NodeOffsetMap,
) -> Result<WriteSet> {
    let mut writes = WriteSet::default();
    match task {
        UpdateTask::UpNode { node } => {
            let key = node.key();
            if next.nodes.get(&key) != Some(&NodeState::Up) {
                next.nodes.insert(key, NodeState::Up);
                writes.nodes_changed = true;
            }
        }
        UpdateTask::DownNode { node } => {
            for (name, table) in next.tables.iter_mut() {
                let mut changed = false;
                for partition in table.partitions.iter_mut() {
                    if partition.is_master(node) {
                        promote_partition(offsets, name, partition);
                        changed = true;
                    }
                }
                if changed {
                    writes.tables.push(name.clone());
                }
            }
            let key = node.key();
            if next.nodes.get(&key) != Some(&NodeState::Down) {
                next.nodes.insert(key, NodeState::Down);
                writes.nodes_changed = true;
            }
        }
        UpdateTask::AddTable { table } => {
            if next.tables.contains_key(&table.name) {
                return Err(Error::InvalidArgument(format!(
                    "table {} already exists",
                    table.name
                )));
            }
            for (idx, partition) in table.partitions.iter().enumerate() {
                if partition.id as usize != idx {
                    return Err(Error::InvalidArgument(format!(
                        "table {} partition ids are not dense",
                        table.name
                    )));
                }
            }
            writes.tables.push(table.name.clone());
            writes.list_changed = true;
            next.tables.insert(table.name.clone(), table.clone());
        }
        UpdateTask::RemoveTable { table } => {
            if next.tables.remove(table).is_none() {
                return Err(Error::NotFound(format!("table {table}")));
            }
            writes.removed_table = Some(table.clone());
            writes.list_changed = true;
        }
        UpdateTask::AddSlave {
            node,
            table,
            partition,
        } => {
            let part = lookup_partition(next, table, *partition)?;
            if part.contains(node) {
                return Err(Error::InvalidArgument(format!(
                    "node {node} already serves {table}_{partition}"
                )));
            }
            part.slaves.push(node.clone());
            writes.tables.push(table.clone());
        }
        UpdateTask::RemoveSlave {
            node,
            table,
            partition,
        } => {
            let part = lookup_partition(next, table, *partition)?;
            if part.is_master(node) {
                return Err(Error::InvalidArgument(format!(
                    "node {node} is master of {table}_{partition}"
                )));
            }
            if part.is_slave(node) {
                part.slaves.retain(|s| s != node);
                writes.tables.push(table.clone());
            }
        }
        UpdateTask::SetMaster {
            node,
            table,
            partition,
        } => {
            let part = lookup_partition(next, table, *partition)?;
            if part.is_master(node) {
                // Duplicate of an already-applied hand-off.
                return Ok(writes);
            }
            if !part.is_slave(node) {
                return Err(Error::InvalidArgument(format!(
                    "node {node} is not a slave of {table}_{partition}"
                )));
            }
            part.slaves.retain(|s| s != node);
            if let Some(old) = part.master.replace(node.clone()) {
                part.slaves.push(old);
            }
            part.status = PartitionStatus::Active;
            writes.tables.push(table.clone());
        }
        UpdateTask::SetStuck { table, partition } => {
            let part = lookup_partition(next, table, *partition)?;
            if part.status != PartitionStatus::Stuck {
                part.status = PartitionStatus::Stuck;
                writes.tables.push(table.clone());
            }
        }
        UpdateTask::SetActive { table, partition } => {
            let part = lookup_partition(next, table, *partition)?;
            if part.status != PartitionStatus::Active {
                part.status = PartitionStatus::Active;
                writes.tables.push(table.clone());
            }
        }
    }
    Ok(writes)
}

fn lookup_partition<'a>(
    snapshot: &'a mut MetaSnapshot,
    table: &str,
    partition: u32,
) -> Result<&'a mut Partition> {
    let meta = snapshot
        .tables
        .get_mut(table)
        .ok_or_else(|| Error::NotFound(format!("table {table}")))?;
    meta.partitions
        .get_mut(partition as usize)
        .ok_or_else(|| Error::NotFound(format!("partition {table}_{partition}")))
}

/// Replace a dead master with its best-caught-up slave. The winner is the
/// slave with the greatest reported offset, ties broken by the smallest
/// `ip:port`; a missing offset counts as zero. The old master is demoted into
/// the slave list so it re-syncs when it returns. With no slave to promote
/// the partition goes Stuck with no master.
fn promote_partition(offsets: &NodeOffsetMap, table: &str, partition: &mut Partition) {
    let old = partition.master.take();
    if partition.slaves.is_empty() {
        partition.status = PartitionStatus::Stuck;
    } else {
        let mut candidates = partition.slaves.clone();
        candidates.sort_by_key(|n| n.key());
        let mut best: Option<(Node, NodeOffset)> = None;
        for slave in candidates {
            let offset = offsets
                .lookup(table, partition.id, &slave)
                .unwrap_or_default();
            if best.as_ref().map_or(true, |(_, b)| offset > *b) {
                best = Some((slave, offset));
            }
        }
        if let Some((winner, _)) = best {
            partition.slaves.retain(|s| s != &winner);
            partition.master = Some(winner);
        }
    }
    if let Some(old) = old {
        partition.slaves.push(old);
    }
}
