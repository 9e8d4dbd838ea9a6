//! Request/response client for the meta command port.
//!
//! Used three ways: by followers to forward write commands to the leader, by
//! `stratoctl`, and by the integration tests. Every send and receive is
//! bounded by its own timeout; a failed call leaves the connection unusable
//! and the owner decides when to reconnect.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::{Error, Result};
use crate::wire::{self, Request, Response};

pub struct MetaConn {
    framed: Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
    peer: String,
    send_timeout: Duration,
    recv_timeout: Duration,
}

impl MetaConn {
    /// Connect with 1-second send and receive timeouts.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_timeouts(addr, Duration::from_secs(1), Duration::from_secs(1)).await
    }

    pub async fn connect_with_timeouts(
        addr: &str,
        send_timeout: Duration,
        recv_timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(send_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::IoError(format!("connect to {addr} timed out")))?
            .map_err(|err| Error::IoError(format!("connect to {addr}: {err}")))?;
        Ok(Self {
            framed: Framed::new(stream, wire::frame_codec()),
            peer: addr.to_string(),
            send_timeout,
            recv_timeout,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one request and await its response.
    pub async fn call(&mut self, req: &Request) -> Result<Response> {
        let bytes = wire::encode_request(req)?;
        tokio::time::timeout(self.send_timeout, self.framed.send(bytes))
            .await
            .map_err(|_| Error::IoError(format!("send to {} timed out", self.peer)))?
            .map_err(|err| Error::IoError(format!("send to {}: {err}", self.peer)))?;

        let frame = tokio::time::timeout(self.recv_timeout, self.framed.next())
            .await
            .map_err(|_| Error::IoError(format!("recv from {} timed out", self.peer)))?
            .ok_or_else(|| Error::IoError(format!("{} closed the connection", self.peer)))?
            .map_err(|err| Error::IoError(format!("recv from {}: {err}", self.peer)))?;
        wire::decode_response(&frame)
    }
}

/// One-shot convenience: connect, call, disconnect.
pub async fn call_once(addr: &str, req: &Request) -> Result<Response> {
    let mut conn = MetaConn::connect(addr).await?;
    conn.call(req).await
}
