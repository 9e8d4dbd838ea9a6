//! Shared helpers for integration tests.
//!
//! Clusters are assembled in-process: every node is a real `MetaServer`
//! listening on a real TCP command port, while consensus is simulated by a
//! shared `MemCluster` whose leadership the tests steer directly.

#![allow(dead_code)]

use std::future::Future;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use strato_meta::client;
use strato_meta::cluster::{Node, NodeState, Table};
use strato_meta::condition_cron::ConditionCronConfig;
use strato_meta::consensus::MemCluster;
use strato_meta::offsets::{NodeOffset, ReportedOffset};
use strato_meta::server::{MetaServer, ServerConfig};
use strato_meta::update_thread::UpdateThreadConfig;
use strato_meta::wire::{PullTarget, Request, Response, ResponseBody, StatusCode};
use strato_meta::{PORT_SHIFT_CMD, PORT_SHIFT_CONSENSUS};

/// Timeout for cluster convergence in polls.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);

pub struct TestNode {
    pub ip: String,
    pub base_port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestNode {
    pub fn cmd_addr(&self) -> String {
        format!("{}:{}", self.ip, self.base_port + PORT_SHIFT_CMD)
    }

    pub fn consensus_node(&self) -> Node {
        Node::new(self.ip.clone(), self.base_port + PORT_SHIFT_CONSENSUS)
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

pub struct TestCluster {
    pub mem: Arc<MemCluster>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Point consensus leadership at the given node.
    pub fn elect(&self, index: usize) {
        self.mem.set_leader(Some(self.nodes[index].consensus_node()));
    }
}

/// Tight timings so scenarios converge quickly under test.
pub fn fast_config(ip: &str, base_port: u16) -> ServerConfig {
    let mut cfg = ServerConfig::new(ip, base_port);
    cfg.cron_interval = Duration::from_millis(100);
    cfg.node_alive_timeout = Duration::from_secs(5);
    cfg.condition = ConditionCronConfig {
        tick: Duration::from_millis(50),
        max_wait: Duration::from_secs(60),
    };
    cfg.update = UpdateThreadConfig {
        max_retry: 3,
        retry_base: Duration::from_millis(10),
    };
    cfg
}

pub async fn spawn_cluster(count: usize) -> TestCluster {
    spawn_cluster_with(count, |_| {}).await
}

pub async fn spawn_cluster_with(
    count: usize,
    tune: impl Fn(&mut ServerConfig),
) -> TestCluster {
    let base_ports = pick_free_base_ports(count);
    let members: Vec<Node> = base_ports
        .iter()
        .map(|p| Node::new("127.0.0.1", p + PORT_SHIFT_CONSENSUS))
        .collect();
    let mem = MemCluster::new(members.clone());

    let mut nodes = Vec::with_capacity(count);
    for (i, base_port) in base_ports.into_iter().enumerate() {
        let mut cfg = fast_config("127.0.0.1", base_port);
        tune(&mut cfg);
        let kv = Arc::new(mem.handle(members[i].clone()));
        let server = MetaServer::new(cfg, kv);
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async move {
            let _ = rx.await;
        }));
        nodes.push(TestNode {
            ip: "127.0.0.1".into(),
            base_port,
            shutdown: Some(tx),
            task,
        });
    }

    // Every node must answer locally, and followers must have a working
    // forwarding path; CancelMigrate is a harmless write probe for both.
    for node in &nodes {
        let addr = node.cmd_addr();
        wait_until("node serves redirectable writes", || async {
            matches!(
                client::call_once(&addr, &Request::CancelMigrate).await,
                Ok(resp) if resp.code == StatusCode::Ok
            )
        })
        .await;
    }

    TestCluster { mem, nodes }
}

/// Reserve distinct command ports by binding ephemeral listeners first.
fn pick_free_base_ports(count: usize) -> Vec<u16> {
    let mut listeners = Vec::new();
    let mut ports = Vec::new();
    while ports.len() < count {
        let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind probe listener");
        let port = listener.local_addr().expect("probe addr").port();
        if port <= PORT_SHIFT_CMD {
            continue;
        }
        ports.push(port - PORT_SHIFT_CMD);
        listeners.push(listener);
    }
    drop(listeners);
    ports
}

pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + IO_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timeout waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub async fn call(addr: &str, req: &Request) -> Response {
    client::call_once(addr, req)
        .await
        .unwrap_or_else(|err| panic!("rpc {req:?} to {addr} failed: {err}"))
}

pub fn report(table: &str, partition: u32, filenum: u32, offset: u64) -> ReportedOffset {
    ReportedOffset {
        table: table.into(),
        partition,
        offset: NodeOffset::new(filenum, offset),
    }
}

pub async fn ping(addr: &str, node: &Node, offsets: Vec<ReportedOffset>) -> Response {
    call(
        addr,
        &Request::Ping {
            node: node.clone(),
            offsets,
        },
    )
    .await
}

/// Pull one table; `None` while it does not exist yet.
pub async fn pull_table(addr: &str, table: &str) -> Option<(u64, Table)> {
    let resp = call(
        addr,
        &Request::Pull {
            target: PullTarget::Table(table.into()),
        },
    )
    .await;
    match resp.code {
        StatusCode::Ok => match resp.body {
            Some(ResponseBody::Pull { epoch, mut tables }) if !tables.is_empty() => {
                Some((epoch, tables.remove(0)))
            }
            _ => None,
        },
        StatusCode::NotFound => None,
        other => panic!("pull {table} failed: {other:?} {}", resp.msg),
    }
}

pub async fn node_states(addr: &str) -> Vec<(String, NodeState)> {
    let resp = call(addr, &Request::ListNode).await;
    match resp.body {
        Some(ResponseBody::NodeList { nodes }) => {
            nodes.into_iter().map(|n| (n.node, n.state)).collect()
        }
        other => panic!("unexpected ListNode body: {other:?}"),
    }
}
