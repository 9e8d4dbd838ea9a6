//! Command-port wire protocol: op codes, dispatch flags, request/response
//! envelopes, and framing.
//!
//! Frames are u32-length-delimited and carry serde-JSON envelopes. The
//! dispatcher consults the command table — op code → flag bits — before
//! invoking a handler, so write commands received on a follower are forwarded
//! to the leader without touching handler code.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::cluster::{MigrationItem, Node, NodeState, Table};
use crate::error::{Error, Result};
use crate::offsets::ReportedOffset;

/// Upper bound on a single wire frame.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Wire status codes, mirroring the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    NotFound,
    InvalidArgument,
    Corruption,
    Incomplete,
    IoError,
}

impl From<&Error> for StatusCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::NotFound(_) => StatusCode::NotFound,
            Error::InvalidArgument(_) => StatusCode::InvalidArgument,
            Error::Corruption(_) => StatusCode::Corruption,
            Error::Incomplete(_) => StatusCode::Incomplete,
            Error::IoError(_) => StatusCode::IoError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PullTarget {
    /// One table by name.
    Table(String),
    /// Every table in which the named node appears.
    Node(Node),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Ping {
        node: Node,
        offsets: Vec<ReportedOffset>,
    },
    Pull {
        target: PullTarget,
    },
    Init {
        table: String,
        partitions: u32,
    },
    SetMaster {
        node: Node,
        table: String,
        partition: u32,
    },
    AddSlave {
        node: Node,
        table: String,
        partition: u32,
    },
    RemoveSlave {
        node: Node,
        table: String,
        partition: u32,
    },
    ListTable,
    ListNode,
    ListMeta,
    MetaStatus,
    DropTable {
        table: String,
    },
    Migrate {
        epoch: u64,
        items: Vec<MigrationItem>,
    },
    CancelMigrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Ping,
    Pull,
    Init,
    SetMaster,
    AddSlave,
    RemoveSlave,
    ListTable,
    ListNode,
    ListMeta,
    MetaStatus,
    DropTable,
    Migrate,
    CancelMigrate,
}

impl Request {
    pub fn op(&self) -> OpCode {
        match self {
            Request::Ping { .. } => OpCode::Ping,
            Request::Pull { .. } => OpCode::Pull,
            Request::Init { .. } => OpCode::Init,
            Request::SetMaster { .. } => OpCode::SetMaster,
            Request::AddSlave { .. } => OpCode::AddSlave,
            Request::RemoveSlave { .. } => OpCode::RemoveSlave,
            Request::ListTable => OpCode::ListTable,
            Request::ListNode => OpCode::ListNode,
            Request::ListMeta => OpCode::ListMeta,
            Request::MetaStatus => OpCode::MetaStatus,
            Request::DropTable { .. } => OpCode::DropTable,
            Request::Migrate { .. } => OpCode::Migrate,
            Request::CancelMigrate => OpCode::CancelMigrate,
        }
    }
}

/// Dispatch flag bits.
pub mod flags {
    pub const READ: u8 = 1 << 0;
    pub const WRITE: u8 = 1 << 1;
    /// Forward to the leader when handled on a follower.
    pub const REDIRECT: u8 = 1 << 2;
}

/// Op code → flag bits, consulted by the dispatcher before every command.
pub fn command_table() -> HashMap<OpCode, u8> {
    use flags::{READ, REDIRECT, WRITE};
    HashMap::from([
        (OpCode::Ping, READ | REDIRECT),
        (OpCode::Pull, READ),
        (OpCode::Init, WRITE | REDIRECT),
        (OpCode::SetMaster, WRITE | REDIRECT),
        (OpCode::AddSlave, WRITE | REDIRECT),
        (OpCode::RemoveSlave, WRITE | REDIRECT),
        (OpCode::ListTable, READ),
        (OpCode::ListNode, READ),
        (OpCode::ListMeta, READ),
        (OpCode::MetaStatus, READ),
        (OpCode::DropTable, WRITE | REDIRECT),
        (OpCode::Migrate, WRITE | REDIRECT),
        (OpCode::CancelMigrate, WRITE | REDIRECT),
    ])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: String,
    pub state: NodeState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Ping {
        epoch: u64,
    },
    Pull {
        epoch: u64,
        tables: Vec<Table>,
    },
    TableList {
        tables: Vec<String>,
    },
    NodeList {
        nodes: Vec<NodeStatus>,
    },
    MetaNodes {
        leader: Option<Node>,
        followers: Vec<Node>,
    },
    MetaStatus {
        epoch: u64,
        consensus: String,
        queries: u64,
        last_qps: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: StatusCode,
    pub msg: String,
    pub body: Option<ResponseBody>,
}

impl Response {
    pub fn ok(body: Option<ResponseBody>) -> Self {
        Self {
            code: StatusCode::Ok,
            msg: String::new(),
            body,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            code: err.into(),
            msg: err.to_string(),
            body: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

pub fn encode_request(req: &Request) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(req)?))
}

pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    serde_json::from_slice(bytes).map_err(|err| Error::Corruption(format!("bad request: {err}")))
}

pub fn encode_response(resp: &Response) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(resp)?))
}

pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    serde_json::from_slice(bytes).map_err(|err| Error::Corruption(format!("bad response: {err}")))
}
