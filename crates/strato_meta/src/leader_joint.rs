//! Leader tracking and write forwarding.
//!
//! Every node keeps (leader ip, leader command port, optional forwarding
//! client) behind one lock. The server loop refreshes it each tick; on a
//! leader change the old connection is dropped, and when this node itself
//! takes over it rebuilds node liveness instead of opening a client. Redirect
//! never reconnects on failure — reconnecting is left to the next refresh
//! tick so a flapping leader does not cause a connect stampede.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::client::MetaConn;
use crate::cluster::Node;
use crate::consensus::ConsensusKv;
use crate::error::{Error, Result};
use crate::info_store::InfoStore;
use crate::wire::{Request, Response};
use crate::{PORT_SHIFT_CMD, PORT_SHIFT_CONSENSUS};

#[derive(Default)]
struct Inner {
    /// Leader command address, `(ip, cmd_port)`.
    leader: Option<(String, u16)>,
    conn: Option<MetaConn>,
}

pub struct LeaderJoint {
    kv: Arc<dyn ConsensusKv>,
    info: Arc<InfoStore>,
    local_ip: String,
    local_cmd_port: u16,
    forward_timeout: Duration,
    inner: Mutex<Inner>,
}

impl LeaderJoint {
    pub fn new(
        kv: Arc<dyn ConsensusKv>,
        info: Arc<InfoStore>,
        local_ip: String,
        local_base_port: u16,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            kv,
            info,
            local_ip,
            local_cmd_port: local_base_port + PORT_SHIFT_CMD,
            forward_timeout,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn is_leader(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.leader.as_ref()
            == Some(&(self.local_ip.clone(), self.local_cmd_port))
    }

    /// Re-resolve the leader. No-op while the leader is unchanged and the
    /// forwarding client (if one is needed) is healthy.
    pub async fn refresh(&self) -> Result<()> {
        let elected = self
            .kv
            .leader()
            .ok_or_else(|| Error::Incomplete("no leader yet".into()))?;
        let cmd_port = elected.port - PORT_SHIFT_CONSENSUS + PORT_SHIFT_CMD;
        let leader = (elected.ip.clone(), cmd_port);
        let is_self = leader == (self.local_ip.clone(), self.local_cmd_port);

        let mut inner = self.inner.lock().await;
        if inner.leader.as_ref() == Some(&leader) && (is_self || inner.conn.is_some()) {
            return Ok(());
        }

        if inner.leader.as_ref() != Some(&leader) {
            tracing::warn!(
                from = %inner
                    .leader
                    .as_ref()
                    .map(|(ip, port)| format!("{ip}:{port}"))
                    .unwrap_or_else(|| "none".into()),
                to = %format!("{}:{}", leader.0, leader.1),
                "meta leader changed"
            );
        }
        inner.conn = None;
        inner.leader = None;

        if is_self {
            tracing::info!(ip = %self.local_ip, port = self.local_cmd_port, "became meta leader");
            self.info.restore_node_alive().await?;
            inner.leader = Some(leader);
            return Ok(());
        }

        let addr = format!("{}:{}", leader.0, leader.1);
        match MetaConn::connect_with_timeouts(&addr, self.forward_timeout, self.forward_timeout)
            .await
        {
            Ok(conn) => {
                tracing::info!(leader = %addr, "connected to meta leader");
                inner.conn = Some(conn);
                inner.leader = Some(leader);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(leader = %addr, error = %err, "connect to meta leader failed");
                Err(err)
            }
        }
    }

    /// Forward a request to the leader and await its single response.
    /// Followers only. A broken connection is dropped here and reopened by
    /// the next refresh tick.
    pub async fn redirect(&self, req: &Request) -> Result<Response> {
        let mut inner = self.inner.lock().await;
        let conn = inner
            .conn
            .as_mut()
            .ok_or_else(|| Error::Corruption("no leader connection".into()))?;
        match conn.call(req).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                tracing::warn!(leader = %conn.peer(), error = %err, "redirect to leader failed");
                inner.conn = None;
                Err(err)
            }
        }
    }
}
