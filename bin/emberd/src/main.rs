//! Ember Daemon - Runs a discovery node.
//!
//! Maintains the routing table, answers discovery queries from other
//! nodes, and reports peer churn on the log.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::select;
use tokio::signal;
use tokio::time::interval;
use tracing::{info, warn, Level};

use ember_core::{
    set_allow_local_peers, KeyPair, NodeEndpoint, NodeId, SecretKey,
};
use ember_dht::{
    Node, NodeEventHandler, NodeEventKind, NodeRelation, NodeTable, NodeTableConfig,
};

/// Ember discovery daemon.
#[derive(Parser)]
#[command(name = "emberd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start {
        /// UDP address to bind for discovery
        #[arg(long, default_value = "0.0.0.0:30303")]
        bind: SocketAddr,

        /// Bootstrap peer, as <node-id-hex>@<host:port> (repeatable)
        #[arg(long = "bootstrap")]
        bootstrap: Vec<String>,

        /// File holding the hex-encoded node secret key
        #[arg(long)]
        key: Option<PathBuf>,

        /// Admit loopback peers (single-host setups)
        #[arg(long)]
        allow_local: bool,
    },
    /// Generate a node key and print it with its node id
    Keygen,
}

/// Logs peer churn as the table reports it.
struct LoggingEventHandler;

impl NodeEventHandler for LoggingEventHandler {
    fn on_node_event(&self, id: NodeId, kind: NodeEventKind) {
        match kind {
            NodeEventKind::Added => info!(peer = %id, "peer added to routing table"),
            NodeEventKind::Dropped => info!(peer = %id, "peer dropped from routing table"),
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn load_identity(key: Option<&PathBuf>) -> Result<KeyPair> {
    match key {
        Some(path) => {
            let hex = std::fs::read_to_string(path)
                .with_context(|| format!("reading key file {}", path.display()))?;
            let secret = SecretKey::from_hex(&hex).context("key file is not a hex secret key")?;
            KeyPair::from_secret(secret).context("key file holds an invalid secret key")
        }
        None => {
            warn!("no key file given, using an ephemeral identity");
            Ok(KeyPair::generate())
        }
    }
}

fn parse_bootstrap(s: &str) -> Result<Node> {
    let (id, addr) = s
        .split_once('@')
        .context("bootstrap peer must be <node-id-hex>@<host:port>")?;
    let id: NodeId = id.parse().context("invalid bootstrap node id")?;
    let addr: SocketAddr = addr.parse().context("invalid bootstrap address")?;
    Ok(Node::new(id, NodeEndpoint::from_udp(addr)))
}

async fn run(
    bind: SocketAddr,
    bootstrap: Vec<String>,
    key: Option<PathBuf>,
    allow_local: bool,
) -> Result<()> {
    if allow_local {
        set_allow_local_peers(true);
    }

    let key_pair = load_identity(key.as_ref())?;
    info!(id = %key_pair.public(), "node identity loaded");

    let seeds = bootstrap
        .iter()
        .map(|s| parse_bootstrap(s))
        .collect::<Result<Vec<_>>>()?;

    let config = NodeTableConfig::new(NodeEndpoint::from_udp(bind));
    let table = NodeTable::new(key_pair, config);
    table.start().await;
    table.set_event_handler(Box::new(LoggingEventHandler));

    for seed in seeds {
        info!(peer = %seed.id, endpoint = %seed.endpoint, "seeding bootstrap peer");
        table.add_node(seed, NodeRelation::Known);
    }
    if table.is_open() {
        table.discover(NodeId::random());
    }

    let mut drain = interval(Duration::from_secs(1));
    loop {
        select! {
            _ = signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = drain.tick() => {
                table.process_events();
            }
        }
    }

    table.shutdown();
    table.process_events();
    Ok(())
}

fn keygen() {
    let pair = KeyPair::generate();
    println!("secret:  {}", pair.secret().to_hex());
    println!("node id: {}", pair.public().to_hex());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Some(Commands::Keygen) => {
            keygen();
            Ok(())
        }
        Some(Commands::Start {
            bind,
            bootstrap,
            key,
            allow_local,
        }) => run(bind, bootstrap, key, allow_local).await,
        None => run("0.0.0.0:30303".parse()?, Vec::new(), None, false).await,
    }
}
