//! Strato meta node binary entry point.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use strato_meta::condition_cron::ConditionCronConfig;
use strato_meta::consensus::LocalKv;
use strato_meta::server::{MetaServer, ServerConfig};
use strato_meta::update_thread::UpdateThreadConfig;

#[derive(Parser, Debug)]
#[command(name = "strato-meta-node")]
#[command(about = "Metadata control plane node", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a meta node.
    Node(NodeArgs),
}

#[derive(Parser, Debug)]
pub struct NodeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    local_ip: String,

    /// Base port. The consensus port and the command port are derived from
    /// it by fixed shifts.
    #[arg(long)]
    local_port: u16,

    /// Comma-separated consensus member list, `ip:port` or `ip/port` per
    /// entry (ports are consensus ports).
    #[arg(long, env = "STRATO_META_ADDR")]
    meta_addr: String,

    #[arg(long, env = "STRATO_DATA_DIR", default_value = "./strato-meta-data")]
    data_dir: String,

    /// Periodic maintenance interval (ms).
    #[arg(long, env = "STRATO_CRON_INTERVAL_MS", default_value_t = 1000)]
    cron_interval_ms: u64,

    /// Heartbeat expiry for data nodes (ms).
    #[arg(long, env = "STRATO_NODE_ALIVE_TIMEOUT_MS", default_value_t = 10_000)]
    node_alive_timeout_ms: u64,

    /// Offset-condition scan interval (ms).
    #[arg(long, env = "STRATO_CONDITION_TICK_MS", default_value_t = 500)]
    condition_tick_ms: u64,

    /// Abandon a deferred update whose offsets stay unknown this long (ms).
    #[arg(long, env = "STRATO_CONDITION_MAX_WAIT_MS", default_value_t = 600_000)]
    condition_max_wait_ms: u64,

    /// Retry budget for transient topology-update failures.
    #[arg(long, env = "STRATO_UPDATE_MAX_RETRY", default_value_t = 3)]
    update_max_retry: u32,

    /// Migration items staged per drain step.
    #[arg(long, env = "STRATO_MIGRATE_ONCE_COUNT", default_value_t = 4)]
    migrate_once_count: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}

async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let members = strato_meta::parse_members(&args.meta_addr)
        .with_context(|| format!("parse meta addr {:?}", args.meta_addr))?;

    let mut cfg = ServerConfig::new(args.local_ip.clone(), args.local_port);
    cfg.cron_interval = Duration::from_millis(args.cron_interval_ms.max(10));
    cfg.node_alive_timeout = Duration::from_millis(args.node_alive_timeout_ms.max(100));
    cfg.condition = ConditionCronConfig {
        tick: Duration::from_millis(args.condition_tick_ms.max(10)),
        max_wait: Duration::from_millis(args.condition_max_wait_ms),
    };
    cfg.update = UpdateThreadConfig {
        max_retry: args.update_max_retry,
        ..UpdateThreadConfig::default()
    };
    cfg.migrate_once_count = args.migrate_once_count.max(1);

    let local = cfg.consensus_node();
    if !members.contains(&local) {
        tracing::warn!(local = %local, "local consensus address not in member list");
    }

    let data_dir = PathBuf::from(&args.data_dir);
    let kv = LocalKv::open(&data_dir, local, members)
        .map_err(|err| anyhow::anyhow!("open consensus store: {err}"))?;

    tracing::info!(
        ip = %args.local_ip,
        port = args.local_port,
        cmd_port = cfg.cmd_port(),
        "strato meta node starting"
    );
    let server = MetaServer::new(cfg, Arc::new(kv));
    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
