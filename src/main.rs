//! Meridian node runner.

use clap::Parser;
use meridian::{Id, LookupOption, Node, NodeConfig, NodeEvent, NodeInfo, DEFAULT_PORT};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "meridian", version, about = "Meridian: Kademlia DHT node")]
struct Args {
    /// UDP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// IPv4 address to bind
    #[arg(long, default_value = "0.0.0.0")]
    addr4: IpAddr,

    /// IPv6 address to bind (enables the v6 stack)
    #[arg(long)]
    addr6: Option<IpAddr>,

    /// Disable the IPv4 stack
    #[arg(long)]
    no_v4: bool,

    /// Data directory (key, id, routing caches, storage)
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Bootstrap nodes, comma-separated `id@host:port`
    #[arg(short, long)]
    seeds: Option<String>,

    /// Default lookup option: arbitrary, optimistic, conservative
    #[arg(long, default_value = "conservative")]
    lookup: String,

    /// Relax bogon checks (loopback/private overlays)
    #[arg(long)]
    developer: bool,
}

/// Parse `base58id@host:port`.
fn parse_seed(s: &str) -> Result<NodeInfo, String> {
    let (id_part, addr_part) = s
        .split_once('@')
        .ok_or_else(|| format!("seed '{}' is not id@host:port", s))?;
    let id = Id::from_base58(id_part.trim())
        .ok_or_else(|| format!("seed '{}' has a malformed id", s))?;
    let addr: SocketAddr = addr_part
        .trim()
        .parse()
        .map_err(|e| format!("seed '{}' has a bad address: {}", s, e))?;
    Ok(NodeInfo::new(id, addr))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meridian=info".into()),
        )
        .init();

    let args = Args::parse();

    let lookup = match args.lookup.as_str() {
        "arbitrary" => LookupOption::Arbitrary,
        "optimistic" => LookupOption::Optimistic,
        "conservative" => LookupOption::Conservative,
        other => {
            error!("unknown lookup option '{}'", other);
            return;
        }
    };

    let seeds = match args
        .seeds
        .as_deref()
        .map(|s| s.split(',').map(parse_seed).collect::<Result<Vec<_>, _>>())
        .transpose()
    {
        Ok(seeds) => seeds.unwrap_or_default(),
        Err(e) => {
            error!("{}", e);
            return;
        }
    };

    let config = NodeConfig {
        addr4: (!args.no_v4).then_some(args.addr4),
        addr6: args.addr6,
        port: args.port,
        data_dir: Some(args.data_dir),
        bootstrap_nodes: seeds,
        developer_mode: args.developer,
        default_lookup_option: lookup,
        ..Default::default()
    };

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to create node: {}", e);
            return;
        }
    };

    info!("node id: {}", node.id());

    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NodeEvent::StateChanged(state)) => info!("state: {:?}", state),
                Ok(NodeEvent::Connection(family, state)) => {
                    info!("{} connection: {:?}", family.name(), state)
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event stream lagged by {}", n)
                }
                Err(_) => break,
            }
        }
    });

    if let Err(e) = node.start().await {
        error!("failed to start: {}", e);
        return;
    }
    for addr in node.addresses() {
        info!("listening on {}", addr);
    }

    // periodic status line
    let status_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            if let Ok(stats) = status_node.stats().await {
                for s in stats {
                    info!(
                        "status {}: {} entries in {} buckets, {} calls, {} tasks, {} banned",
                        s.family.name(),
                        s.entries,
                        s.buckets,
                        s.pending_calls,
                        s.active_tasks,
                        s.banned_hosts
                    );
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    node.stop().await;
}
