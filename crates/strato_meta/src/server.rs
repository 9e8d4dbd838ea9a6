//! The meta server: command dispatch, periodic maintenance, and statistics.
//!
//! One instance owns every control-plane component. Startup blocks until the
//! info store loads a consistent snapshot, then the command listener and the
//! periodic loop run until the shutdown future resolves. Each connection is
//! served by its own task; write commands arriving on a follower are
//! forwarded through the leader joint.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::cluster::{assign_partitions, keys, MigrationItem, Node, NodeState, UpdateTask};
use crate::condition_cron::{ConditionCron, ConditionCronConfig, OffsetCondition};
use crate::consensus::ConsensusKv;
use crate::error::{Error, Result};
use crate::info_store::InfoStore;
use crate::leader_joint::LeaderJoint;
use crate::migrate::{MigrateRegister, MigrateStatus};
use crate::offsets::NodeOffsetMap;
use crate::update_thread::{UpdateThread, UpdateThreadConfig};
use crate::wire::{
    self, flags, NodeStatus, OpCode, PullTarget, Request, Response, ResponseBody,
};
use crate::{PORT_SHIFT_CMD, PORT_SHIFT_CONSENSUS};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub local_ip: String,
    /// Base port; consensus and command ports are derived from it.
    pub local_port: u16,
    pub cron_interval: Duration,
    pub node_alive_timeout: Duration,
    pub condition: ConditionCronConfig,
    pub update: UpdateThreadConfig,
    /// Migration items popped from the register per drain step.
    pub migrate_once_count: usize,
    /// Inline ProcessMigrate attempts after a MIGRATE command.
    pub init_migrate_retry: u32,
    pub forward_timeout: Duration,
}

impl ServerConfig {
    pub fn new(local_ip: impl Into<String>, local_port: u16) -> Self {
        Self {
            local_ip: local_ip.into(),
            local_port,
            cron_interval: Duration::from_secs(1),
            node_alive_timeout: Duration::from_secs(10),
            condition: ConditionCronConfig::default(),
            update: UpdateThreadConfig::default(),
            migrate_once_count: 4,
            init_migrate_retry: 3,
            forward_timeout: Duration::from_secs(1),
        }
    }

    pub fn cmd_port(&self) -> u16 {
        self.local_port + PORT_SHIFT_CMD
    }

    pub fn cmd_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.cmd_port())
    }

    /// This node's consensus address.
    pub fn consensus_node(&self) -> Node {
        Node::new(self.local_ip.clone(), self.local_port + PORT_SHIFT_CONSENSUS)
    }
}

/// Windowed query statistics, rolled once per server tick.
struct Statistics {
    query_num: AtomicU64,
    window: Mutex<StatWindow>,
}

struct StatWindow {
    last_query_num: u64,
    last_time_us: u64,
    last_qps: u64,
}

impl Statistics {
    fn new() -> Self {
        Self {
            query_num: AtomicU64::new(0),
            window: Mutex::new(StatWindow {
                last_query_num: 0,
                last_time_us: crate::now_micros(),
                last_qps: 0,
            }),
        }
    }

    fn incr_query(&self) {
        self.query_num.fetch_add(1, Ordering::Relaxed);
    }

    fn roll(&self) -> (u64, u64) {
        let now = crate::now_micros();
        let total = self.query_num.load(Ordering::Relaxed);
        let mut window = self.window.lock().expect("stat window poisoned");
        window.last_qps = (total - window.last_query_num)
            .saturating_mul(1_000_000)
            / (now.saturating_sub(window.last_time_us) + 1);
        window.last_query_num = total;
        window.last_time_us = now;
        (total, window.last_qps)
    }

    fn read(&self) -> (u64, u64) {
        let total = self.query_num.load(Ordering::Relaxed);
        let window = self.window.lock().expect("stat window poisoned");
        (total, window.last_qps)
    }
}

pub struct MetaServer {
    cfg: ServerConfig,
    kv: Arc<dyn ConsensusKv>,
    info: Arc<InfoStore>,
    offsets: Arc<NodeOffsetMap>,
    migrate: MigrateRegister,
    update: UpdateThread,
    cron: ConditionCron,
    leader: LeaderJoint,
    cmds: HashMap<OpCode, u8>,
    stats: Statistics,
}

impl MetaServer {
    /// Wire the components together. Must run inside a tokio runtime: the
    /// update pipeline and condition cron workers start here.
    pub fn new(cfg: ServerConfig, kv: Arc<dyn ConsensusKv>) -> Arc<Self> {
        let offsets = Arc::new(NodeOffsetMap::new());
        let info = Arc::new(InfoStore::new(
            kv.clone(),
            offsets.clone(),
            cfg.node_alive_timeout,
        ));
        let update = UpdateThread::spawn(info.clone(), cfg.update);
        let cron = ConditionCron::spawn(offsets.clone(), update.clone(), cfg.condition);
        let leader = LeaderJoint::new(
            kv.clone(),
            info.clone(),
            cfg.local_ip.clone(),
            cfg.local_port,
            cfg.forward_timeout,
        );
        Arc::new(Self {
            migrate: MigrateRegister::new(kv.clone()),
            kv,
            info,
            offsets,
            update,
            cron,
            leader,
            cmds: wire::command_table(),
            stats: Statistics::new(),
            cfg,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        // Start from a consistent view; seed the epoch watermark once when
        // the group is brand new so the first refresh can converge.
        let mut seeded = false;
        loop {
            match self.info.refresh().await {
                Ok(()) => break,
                Err(err) => {
                    if err.is_incomplete() && !seeded {
                        seeded = true;
                        if let Err(err) = self
                            .kv
                            .set(keys::EPOCH, serde_json::to_vec(&0u64).context("encode epoch")?)
                            .await
                        {
                            tracing::warn!(error = %err, "seeding epoch watermark failed");
                        }
                        continue;
                    }
                    tracing::info!(error = %err, "info store not loaded yet");
                }
            }
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }

        if let Err(err) = self.leader.refresh().await {
            tracing::warn!(error = %err, "initial leader refresh failed");
        }

        let listener = TcpListener::bind(self.cfg.cmd_addr())
            .await
            .with_context(|| format!("bind command port {}", self.cfg.cmd_addr()))?;
        tracing::info!(addr = %self.cfg.cmd_addr(), "meta server listening");

        let mut ticker = tokio::time::interval(self.cfg.cron_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("meta server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, _)) => {
                        let server = self.clone();
                        tokio::spawn(async move { server.handle_conn(socket).await });
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                },
                _ = ticker.tick() => self.do_timing_task().await,
            }
        }
    }

    async fn handle_conn(&self, socket: TcpStream) {
        let mut framed = Framed::new(socket, wire::frame_codec());
        while let Some(frame) = framed.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!(error = %err, "command connection closed");
                    return;
                }
            };
            let resp = match wire::decode_request(&frame) {
                Ok(req) => self.dispatch(req).await,
                Err(err) => Response::from_error(&err),
            };
            let bytes = match wire::encode_response(&resp) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::error!(error = %err, "response encode failed");
                    return;
                }
            };
            if framed.send(bytes).await.is_err() {
                return;
            }
        }
    }

    pub async fn dispatch(&self, req: Request) -> Response {
        self.stats.incr_query();
        let flag = self.cmds.get(&req.op()).copied().unwrap_or(flags::READ);
        if flag & flags::REDIRECT != 0 && !self.leader.is_leader().await {
            return match self.leader.redirect(&req).await {
                Ok(resp) => resp,
                Err(err) => Response::from_error(&err),
            };
        }
        match self.handle(req).await {
            Ok(resp) => resp,
            Err(err) => Response::from_error(&err),
        }
    }

    async fn handle(&self, req: Request) -> Result<Response> {
        match req {
            Request::Ping { node, offsets } => self.handle_ping(node, offsets),
            Request::Pull { target } => self.handle_pull(target),
            Request::Init { table, partitions } => self.handle_init(table, partitions),
            Request::SetMaster {
                node,
                table,
                partition,
            } => self.handle_set_master(node, table, partition),
            Request::AddSlave {
                node,
                table,
                partition,
            } => self.handle_add_slave(node, table, partition),
            Request::RemoveSlave {
                node,
                table,
                partition,
            } => self.handle_remove_slave(node, table, partition),
            Request::ListTable => Ok(Response::ok(Some(ResponseBody::TableList {
                tables: self.info.get_table_list(),
            }))),
            Request::ListNode => Ok(Response::ok(Some(ResponseBody::NodeList {
                nodes: self
                    .info
                    .get_all_nodes()
                    .into_iter()
                    .map(|(node, state)| NodeStatus { node, state })
                    .collect(),
            }))),
            Request::ListMeta => self.handle_list_meta(),
            Request::MetaStatus => self.handle_meta_status().await,
            Request::DropTable { table } => self.handle_drop_table(table),
            Request::Migrate { epoch, items } => self.handle_migrate(epoch, items).await,
            Request::CancelMigrate => {
                self.migrate.cancel().await?;
                Ok(Response::ok(None))
            }
        }
    }

    fn handle_ping(
        &self,
        node: Node,
        offsets: Vec<crate::offsets::ReportedOffset>,
    ) -> Result<Response> {
        self.offsets.update_from_ping(&node, &offsets);
        if self.info.update_node_alive(&node.key()) {
            tracing::info!(node = %node, "new node alive, scheduling UpNode");
            self.update.pending_update(UpdateTask::UpNode { node });
        }
        Ok(Response::ok(Some(ResponseBody::Ping {
            epoch: self.info.epoch(),
        })))
    }

    fn handle_pull(&self, target: PullTarget) -> Result<Response> {
        // Epoch first: it is bumped last on writes, so the reply can only
        // understate the tables that follow.
        let epoch = self.info.epoch();
        let tables = match target {
            PullTarget::Table(name) => vec![self.info.get_table_meta(&name)?],
            PullTarget::Node(node) => match self.info.get_tables_for_node(&node) {
                Ok(names) => {
                    let mut tables = Vec::with_capacity(names.len());
                    for name in names {
                        tables.push(self.info.get_table_meta(&name)?);
                    }
                    tables
                }
                // A node serving nothing yet gets an empty map.
                Err(err) if err.is_not_found() => Vec::new(),
                Err(err) => return Err(err),
            },
        };
        Ok(Response::ok(Some(ResponseBody::Pull { epoch, tables })))
    }

    fn handle_init(&self, table: String, partitions: u32) -> Result<Response> {
        if table.is_empty() {
            return Err(Error::InvalidArgument("empty table name".into()));
        }
        if self.info.get_table_meta(&table).is_ok() {
            return Err(Error::InvalidArgument(format!("table {table} already exists")));
        }
        let mut up: Vec<Node> = Vec::new();
        for (key, state) in self.info.get_all_nodes() {
            if state == NodeState::Up {
                up.push(Node::parse(&key)?);
            }
        }
        up.sort_by_key(|n| n.key());
        let layout = assign_partitions(&table, partitions, &up)?;
        tracing::info!(table = %table, partitions, nodes = up.len(), "scheduling table create");
        self.update.pending_update(UpdateTask::AddTable { table: layout });
        Ok(Response::ok(None))
    }

    /// Stuck the partition now; hand the mastership over only once the
    /// candidate has caught up with the current master.
    fn handle_set_master(&self, node: Node, table: String, partition: u32) -> Result<Response> {
        let master = self.info.get_partition_master(&table, partition)?;
        if master == node {
            return Ok(Response::ok(None));
        }
        let meta = self.info.get_table_meta(&table)?;
        let part = meta
            .partition(partition)
            .ok_or_else(|| Error::NotFound(format!("partition {table}_{partition}")))?;
        if !part.is_slave(&node) {
            return Err(Error::InvalidArgument(format!(
                "node {node} is not a slave of {table}_{partition}"
            )));
        }

        self.update.pending_update(UpdateTask::SetStuck {
            table: table.clone(),
            partition,
        });
        self.cron.add_cron_task(
            OffsetCondition {
                table: table.clone(),
                partition,
                reference: master,
                candidate: node.clone(),
            },
            UpdateTask::SetMaster {
                node,
                table,
                partition,
            },
        );
        Ok(Response::ok(None))
    }

    fn handle_add_slave(&self, node: Node, table: String, partition: u32) -> Result<Response> {
        let meta = self.info.get_table_meta(&table)?;
        if meta.partition(partition).is_none() {
            return Err(Error::NotFound(format!("partition {table}_{partition}")));
        }
        self.update.pending_update(UpdateTask::AddSlave {
            node,
            table,
            partition,
        });
        Ok(Response::ok(None))
    }

    fn handle_remove_slave(&self, node: Node, table: String, partition: u32) -> Result<Response> {
        let meta = self.info.get_table_meta(&table)?;
        if meta.partition(partition).is_none() {
            return Err(Error::NotFound(format!("partition {table}_{partition}")));
        }
        self.update.pending_update(UpdateTask::RemoveSlave {
            node,
            table,
            partition,
        });
        Ok(Response::ok(None))
    }

    fn handle_drop_table(&self, table: String) -> Result<Response> {
        self.info.get_table_meta(&table)?;
        tracing::info!(table = %table, "scheduling table drop");
        self.update.pending_update(UpdateTask::RemoveTable { table });
        Ok(Response::ok(None))
    }

    fn handle_list_meta(&self) -> Result<Response> {
        let leader_consensus = self.kv.leader();
        let leader = leader_consensus
            .as_ref()
            .map(|n| Node::new(n.ip.clone(), n.port - PORT_SHIFT_CONSENSUS));
        let mut followers = Vec::new();
        for member in self.kv.members() {
            if Some(&member) == leader_consensus.as_ref() {
                continue;
            }
            followers.push(Node::new(member.ip, member.port - PORT_SHIFT_CONSENSUS));
        }
        Ok(Response::ok(Some(ResponseBody::MetaNodes {
            leader,
            followers,
        })))
    }

    async fn handle_meta_status(&self) -> Result<Response> {
        let (queries, last_qps) = self.stats.read();
        Ok(Response::ok(Some(ResponseBody::MetaStatus {
            epoch: self.info.epoch(),
            consensus: self.kv.server_status().await,
            queries,
            last_qps,
        })))
    }

    async fn handle_migrate(&self, epoch: u64, items: Vec<MigrationItem>) -> Result<Response> {
        if epoch != self.info.epoch() {
            return Err(Error::InvalidArgument(format!(
                "expired epoch {epoch}, current {}",
                self.info.epoch()
            )));
        }
        let token = self.migrate.init(items).await?;
        tracing::info!(token, "migration batch registered");

        let mut retry = self.cfg.init_migrate_retry;
        loop {
            match self.process_migrate().await {
                Err(err) if err.is_incomplete() && retry > 0 => retry -= 1,
                other => return other.map(|()| Response::ok(None)),
            }
        }
    }

    /// Pop the next migration items and stage their reconfiguration:
    /// AddSlave(to), SetStuck, then — once `to` has caught up with `from` —
    /// RemoveSlave(from) followed by SetActive.
    async fn process_migrate(&self) -> Result<()> {
        let items = match self.migrate.get_n(self.cfg.migrate_once_count).await {
            Ok(items) => items,
            Err(err) if err.is_not_found() => {
                tracing::info!("no migration item to process");
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let mut began = false;
        for item in items {
            tracing::info!(
                table = %item.table,
                partition = item.partition,
                from = %item.from,
                to = %item.to,
                "beginning migration item"
            );
            self.update.pending_update(UpdateTask::AddSlave {
                node: item.to.clone(),
                table: item.table.clone(),
                partition: item.partition,
            });
            self.update.pending_update(UpdateTask::SetStuck {
                table: item.table.clone(),
                partition: item.partition,
            });
            let cond = OffsetCondition {
                table: item.table.clone(),
                partition: item.partition,
                reference: item.from.clone(),
                candidate: item.to.clone(),
            };
            self.cron.add_cron_task(
                cond.clone(),
                UpdateTask::RemoveSlave {
                    node: item.from.clone(),
                    table: item.table.clone(),
                    partition: item.partition,
                },
            );
            self.cron.add_cron_task(
                cond,
                UpdateTask::SetActive {
                    table: item.table,
                    partition: item.partition,
                },
            );
            began = true;
        }

        if !began {
            return Err(Error::Incomplete("no migration item began".into()));
        }
        Ok(())
    }

    /// Leader-side: feed the next batch once the in-flight one has settled.
    async fn drain_migrate(&self) {
        if self.cron.pending_len() != 0 {
            return;
        }
        match self.migrate.status().await {
            Ok(MigrateStatus::Active { remaining, .. }) if remaining > 0 => {
                if let Err(err) = self.process_migrate().await {
                    tracing::warn!(error = %err, "migration drain step failed");
                }
            }
            Ok(_) => {}
            Err(err) => tracing::debug!(error = %err, "migration register read failed"),
        }
    }

    async fn do_timing_task(&self) {
        if let Err(err) = self.leader.refresh().await {
            tracing::warn!(error = %err, "leader refresh failed");
        }

        let is_leader = self.leader.is_leader().await;
        if !is_leader {
            if let Err(err) = self.info.refresh().await {
                tracing::warn!(error = %err, "info store refresh failed");
            }
        }

        let (queries, qps) = self.stats.roll();
        tracing::debug!(queries, qps, "server statistics");

        // Liveness is tracked on the leader only; a follower's map is either
        // empty or left over from a lost term and must not produce DownNodes.
        if is_leader {
            for key in self.info.fetch_expired_nodes() {
                match Node::parse(&key) {
                    Ok(node) => {
                        tracing::info!(node = %node, "node heartbeat expired, scheduling DownNode");
                        self.update.pending_update(UpdateTask::DownNode { node });
                    }
                    Err(err) => tracing::error!(node = %key, error = %err, "bad liveness key"),
                }
            }
            self.drain_migrate().await;
        }
    }
}
