//! Minimal admin client for the meta command port.

use anyhow::Context;
use clap::{Parser, Subcommand};

use strato_meta::client;
use strato_meta::cluster::{MigrationItem, Node};
use strato_meta::wire::{PullTarget, Request, Response, ResponseBody, StatusCode};

#[derive(Parser)]
#[command(name = "stratoctl")]
#[command(about = "Admin client for the strato meta plane", long_about = None)]
struct Args {
    /// Target command address for a meta node (host:port).
    #[arg(long, default_value = "127.0.0.1:9421")]
    target: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch topology for one table, or for every table a node serves.
    Pull {
        #[arg(long, conflicts_with = "node")]
        table: Option<String>,
        /// Node address `ip:port`.
        #[arg(long)]
        node: Option<String>,
    },
    /// Create a table.
    Init {
        #[arg(long)]
        table: String,
        #[arg(long)]
        partitions: u32,
    },
    /// Hand mastership of a partition to a caught-up slave.
    SetMaster {
        #[arg(long)]
        node: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        partition: u32,
    },
    /// Add a slave replica to a partition.
    AddSlave {
        #[arg(long)]
        node: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        partition: u32,
    },
    /// Remove a slave replica from a partition.
    RemoveSlave {
        #[arg(long)]
        node: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        partition: u32,
    },
    /// List tables.
    ListTable,
    /// List data nodes and their liveness.
    ListNode,
    /// List meta nodes (leader and followers).
    ListMeta,
    /// Show consensus status and server counters.
    MetaStatus,
    /// Drop a table.
    DropTable {
        #[arg(long)]
        table: String,
    },
    /// Begin a bulk migration. Each item is `table:partition:from:to` with
    /// node addresses as `ip:port`.
    Migrate {
        /// Current epoch; the command is rejected when stale.
        #[arg(long)]
        epoch: u64,
        #[arg(long = "item")]
        items: Vec<String>,
    },
    /// Cancel the in-flight migration batch.
    CancelMigrate,
}

fn parse_item(raw: &str) -> anyhow::Result<MigrationItem> {
    // table:partition:from_ip:from_port:to_ip:to_port
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 6 {
        anyhow::bail!("bad migration item {raw:?}, want table:partition:from_ip:from_port:to_ip:to_port");
    }
    Ok(MigrationItem {
        table: parts[0].to_string(),
        partition: parts[1].parse().context("partition id")?,
        from: Node::new(parts[2], parts[3].parse().context("from port")?),
        to: Node::new(parts[4], parts[5].parse().context("to port")?),
    })
}

fn build_request(command: Command) -> anyhow::Result<Request> {
    Ok(match command {
        Command::Pull { table, node } => {
            let target = match (table, node) {
                (Some(table), None) => PullTarget::Table(table),
                (None, Some(node)) => {
                    PullTarget::Node(Node::parse(&node).map_err(|err| anyhow::anyhow!("{err}"))?)
                }
                _ => anyhow::bail!("pull needs exactly one of --table or --node"),
            };
            Request::Pull { target }
        }
        Command::Init { table, partitions } => Request::Init { table, partitions },
        Command::SetMaster {
            node,
            table,
            partition,
        } => Request::SetMaster {
            node: Node::parse(&node).map_err(|err| anyhow::anyhow!("{err}"))?,
            table,
            partition,
        },
        Command::AddSlave {
            node,
            table,
            partition,
        } => Request::AddSlave {
            node: Node::parse(&node).map_err(|err| anyhow::anyhow!("{err}"))?,
            table,
            partition,
        },
        Command::RemoveSlave {
            node,
            table,
            partition,
        } => Request::RemoveSlave {
            node: Node::parse(&node).map_err(|err| anyhow::anyhow!("{err}"))?,
            table,
            partition,
        },
        Command::ListTable => Request::ListTable,
        Command::ListNode => Request::ListNode,
        Command::ListMeta => Request::ListMeta,
        Command::MetaStatus => Request::MetaStatus,
        Command::DropTable { table } => Request::DropTable { table },
        Command::Migrate { epoch, items } => {
            if items.is_empty() {
                anyhow::bail!("migrate needs at least one --item");
            }
            let items = items
                .iter()
                .map(|raw| parse_item(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            Request::Migrate { epoch, items }
        }
        Command::CancelMigrate => Request::CancelMigrate,
    })
}

fn print_response(resp: &Response) -> anyhow::Result<()> {
    if resp.code != StatusCode::Ok {
        anyhow::bail!("{:?}: {}", resp.code, resp.msg);
    }
    match &resp.body {
        None => println!("ok"),
        Some(ResponseBody::Ping { epoch }) => println!("ok, epoch {epoch}"),
        Some(body) => println!("{}", serde_json::to_string_pretty(body)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let req = build_request(args.command)?;
    let resp = client::call_once(&args.target, &req)
        .await
        .map_err(|err| anyhow::anyhow!("rpc to {} failed: {err}", args.target))?;
    print_response(&resp)
}
